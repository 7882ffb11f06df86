//! Per-consumer redelivery coordinator.
//!
//! The façade a consumer holds. Application calls land here and are routed
//! into the batch ack table and the two trackers; the sweep timer drains the
//! trackers and hands the result to the broker-facing transport.
//!
//! # Message lifecycle
//!
//! ```text
//! Delivered ──ack──────────────────────────────▶ Acked (terminal)
//!     │
//!     ├──nack──▶ NegativeAcked ──sweep──▶ RedeliveryRequested ──▶ Delivered
//!     │
//!     └──ack timeout──▶ TimedOut ──sweep──▶ RedeliveryRequested ──▶ Delivered
//! ```
//!
//! # Locking
//!
//! Each tracker sits behind its own `parking_lot::Mutex`. No lock is held
//! across an `.await`, and no call holds two tracker locks at once.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::batch::AckDecision;
use crate::batch::BatchAckTable;
use crate::config::RedeliveryConfig;
use crate::constants::MAX_REDELIVERY_BATCH_SIZE;
use crate::error::Result;
use crate::message_id::EntryId;
use crate::message_id::MessageId;
use crate::negative_ack::NegativeAckTracker;
use crate::sweeper::RedeliveryClock;
use crate::sweeper::SweepHandle;
use crate::sweeper::SweepReport;
use crate::sweeper::SweepTarget;
use crate::sweeper::spawn_sweeper;
use crate::transport::AckKind;
use crate::transport::ConsumerId;
use crate::transport::RedeliveryTransport;
use crate::unacked::UnackedMessageTracker;

/// Work left over from failed transport sends.
#[derive(Debug, Default)]
struct RetryQueue {
    redeliveries: Vec<MessageId>,
    acks: Vec<(EntryId, AckKind)>,
}

/// Snapshot of a coordinator's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Messages handed to the application and not yet acked or nacked.
    pub outstanding: usize,
    /// Messages waiting in the negative ack tracker.
    pub pending_negative_acks: usize,
    /// Messages waiting in the ack-timeout tracker.
    pub pending_ack_timeouts: usize,
    /// Wire entries with unacknowledged sub-messages.
    pub tracked_entries: usize,
    /// Redelivery requests waiting for a retry.
    pub pending_retries: usize,
}

/// Redelivery bookkeeping for one consumer.
pub struct ConsumerRedeliveryCoordinator {
    consumer_id: ConsumerId,
    config: RedeliveryConfig,
    transport: Arc<dyn RedeliveryTransport>,
    clock: RedeliveryClock,
    /// Delivered ids awaiting ack or nack, with their redelivery count.
    outstanding: Mutex<HashMap<MessageId, u32>>,
    batches: Mutex<BatchAckTable>,
    unacked: Mutex<UnackedMessageTracker>,
    negative_acks: Mutex<NegativeAckTracker>,
    retry: Mutex<RetryQueue>,
    sweeper: Mutex<Option<SweepHandle>>,
    is_closed: AtomicBool,
}

impl std::fmt::Debug for ConsumerRedeliveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRedeliveryCoordinator")
            .field("consumer_id", &self.consumer_id)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("is_closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConsumerRedeliveryCoordinator {
    /// Create a coordinator with its own clock.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation. No tracker
    /// is created in that case.
    pub fn new(consumer_id: ConsumerId, config: RedeliveryConfig, transport: Arc<dyn RedeliveryTransport>) -> Result<Self> {
        Self::with_clock(consumer_id, config, transport, RedeliveryClock::new())
    }

    /// Create a coordinator sharing `clock` with other coordinators.
    pub fn with_clock(
        consumer_id: ConsumerId,
        config: RedeliveryConfig,
        transport: Arc<dyn RedeliveryTransport>,
        clock: RedeliveryClock,
    ) -> Result<Self> {
        config.validate()?;

        let unacked = match config.ack_timeout() {
            Some(timeout) => UnackedMessageTracker::new(timeout),
            None => UnackedMessageTracker::disabled(),
        };
        let negative_acks = NegativeAckTracker::new(config.nack_bucket_granularity_ms());

        debug!(
            consumer_id,
            negative_ack_delay_ms = config.negative_ack_redelivery_delay_ms,
            ack_timeout_ms = config.ack_timeout_ms,
            subscription_type = ?config.subscription_type,
            "redelivery coordinator created"
        );

        Ok(Self {
            consumer_id,
            config,
            transport,
            clock,
            outstanding: Mutex::new(HashMap::new()),
            batches: Mutex::new(BatchAckTable::new()),
            unacked: Mutex::new(unacked),
            negative_acks: Mutex::new(negative_acks),
            retry: Mutex::new(RetryQueue::default()),
            sweeper: Mutex::new(None),
            is_closed: AtomicBool::new(false),
        })
    }

    /// Consumer this coordinator schedules for.
    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    /// Active configuration.
    pub fn config(&self) -> &RedeliveryConfig {
        &self.config
    }

    /// Current time on the coordinator's clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// Start this coordinator's own sweep timer.
    ///
    /// Partition coordinators owned by a
    /// [`PartitionRouter`](crate::PartitionRouter) are driven by the router's
    /// timer instead and never call this. Calling it twice replaces the
    /// previous timer.
    pub fn start(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let handle = spawn_sweeper(self, self.config.sweep_tick());
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.stop();
        }
    }

    /// Whether this coordinator's own sweep timer is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().as_ref().is_some_and(SweepHandle::is_running)
    }

    // =========================================================================
    // Application Operations
    // =========================================================================

    /// Register a message handed to the application.
    pub fn on_message_delivered(&self, id: MessageId) {
        self.on_message_redelivered(id, 0);
    }

    /// Register a message the broker has delivered `redelivery_count` times before.
    ///
    /// The count feeds the negative ack backoff, if one is configured.
    pub fn on_message_redelivered(&self, id: MessageId, redelivery_count: u32) {
        if self.is_closed() {
            return;
        }

        if self.register_delivery(&id) {
            self.track_delivery(id, redelivery_count);
        }
    }

    /// Record `id` in the batch table. Returns `false` if it is already acknowledged.
    fn register_delivery(&self, id: &MessageId) -> bool {
        let mut batches = self.batches.lock();
        if batches.is_acked(id) {
            debug!(consumer_id = self.consumer_id, %id, "delivery of already acknowledged message ignored");
            return false;
        }
        batches.register(id);
        true
    }

    /// Start the ack timeout for a registered delivery.
    fn track_delivery(&self, id: MessageId, redelivery_count: u32) {
        let now_ms = self.now_ms();
        self.outstanding.lock().insert(id, redelivery_count);
        self.negative_acks.lock().remove(&id);
        self.unacked.lock().on_delivered(id, now_ms, redelivery_count);

        // An acknowledge that ran after registration found nothing to remove.
        if self.batches.lock().is_acked(&id) {
            self.outstanding.lock().remove(&id);
            self.unacked.lock().on_acknowledged(&id);
        }
    }

    /// Acknowledge one message.
    ///
    /// Removes it from both trackers. If this completes its wire entry, the
    /// entry is acknowledged to the broker; a failed send is retried on the
    /// next sweep tick. Unknown or already acknowledged ids are a no-op.
    pub async fn acknowledge(&self, id: MessageId) {
        if self.is_closed() {
            return;
        }

        let decision = self.batches.lock().ack(&id);
        match decision {
            AckDecision::Unknown => {
                debug!(consumer_id = self.consumer_id, %id, "acknowledge of unknown message ignored");
                return;
            }
            AckDecision::Partial | AckDecision::EntryComplete(_) => {}
        }

        self.outstanding.lock().remove(&id);
        self.unacked.lock().on_acknowledged(&id);
        self.negative_acks.lock().remove(&id);

        if let AckDecision::EntryComplete(entry) = decision {
            self.send_entry_ack(entry, AckKind::Individual).await;
        }
    }

    /// Acknowledge `id` and every message before it on the same partition.
    pub async fn acknowledge_cumulative(&self, id: MessageId) {
        if self.is_closed() {
            return;
        }

        let completed = self.batches.lock().ack_cumulative(&id);

        let is_covered = |other: &MessageId| other.partition_index == id.partition_index && *other <= id;
        let removed_outstanding = {
            let mut outstanding = self.outstanding.lock();
            let before = outstanding.len();
            outstanding.retain(|other, _| !is_covered(other));
            before - outstanding.len()
        };
        let removed_unacked = self.unacked.lock().remove_up_to(&id).len();
        let removed_nacks = self.negative_acks.lock().remove_matching(is_covered);

        debug!(
            consumer_id = self.consumer_id,
            %id,
            completed_entries = completed.len(),
            removed_outstanding,
            removed_unacked,
            removed_nacks,
            "cumulative acknowledge"
        );

        if let Some(last) = completed.last() {
            self.send_entry_ack(*last, AckKind::Cumulative).await;
        }
    }

    /// Negatively acknowledge a message with the configured delay.
    ///
    /// With a backoff policy the delay grows with the message's redelivery count.
    pub fn negative_acknowledge(&self, id: MessageId) {
        self.schedule_negative_ack(id, None);
    }

    /// Negatively acknowledge a message with an explicit delay.
    ///
    /// A zero delay redelivers on the next sweep tick.
    pub fn negative_acknowledge_with_delay(&self, id: MessageId, delay: Duration) {
        self.schedule_negative_ack(id, Some(delay));
    }

    fn schedule_negative_ack(&self, id: MessageId, delay: Option<Duration>) {
        if self.is_closed() {
            return;
        }

        let redelivery_count = self.outstanding.lock().remove(&id);
        let is_rescheduled = redelivery_count.is_none() && self.negative_acks.lock().contains(&id);
        if redelivery_count.is_none() && !is_rescheduled {
            debug!(consumer_id = self.consumer_id, %id, "negative acknowledge of unknown message ignored");
            return;
        }

        if self.batches.lock().negative_ack(&id).is_none() {
            debug!(consumer_id = self.consumer_id, %id, "negative acknowledge of acknowledged message ignored");
            return;
        }

        self.unacked.lock().on_negative_acknowledged(&id);

        let delay = delay.unwrap_or_else(|| self.config.negative_ack_delay_for(redelivery_count.unwrap_or(0)));
        let now_ms = self.now_ms();
        self.negative_acks.lock().add(id, now_ms, delay);
    }

    /// Request redelivery of everything this consumer has not acknowledged.
    ///
    /// Drains both trackers immediately instead of waiting for deadlines.
    /// Returns the number of identities requested.
    pub async fn redeliver_unacknowledged(&self) -> usize {
        if self.is_closed() {
            return 0;
        }

        let mut ids = self.negative_acks.lock().drain_all();
        let timed = self.unacked.lock().drain_all();
        ids.extend(timed.into_iter().map(|record| record.id));
        // Outstanding covers deliveries the disabled ack-timeout tracker never saw.
        let mut outstanding: Vec<MessageId> = self.outstanding.lock().drain().map(|(id, _)| id).collect();
        outstanding.sort_unstable();
        ids.extend(outstanding);

        let ids = dedup_preserving_order(ids);
        let count = ids.len();
        info!(consumer_id = self.consumer_id, count, "redelivering all unacknowledged messages");
        self.send_redeliveries(ids).await;
        count
    }

    /// Stop scheduling for this consumer and drop all state.
    ///
    /// Requests already handed to the transport are not recalled.
    pub fn close(&self) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.sweeper.lock().take() {
            handle.stop();
        }

        let stats = self.stats();
        self.outstanding.lock().clear();
        self.batches.lock().clear();
        self.unacked.lock().clear();
        self.negative_acks.lock().clear();
        *self.retry.lock() = RetryQueue::default();

        info!(
            consumer_id = self.consumer_id,
            dropped_negative_acks = stats.pending_negative_acks,
            dropped_outstanding = stats.outstanding,
            "redelivery coordinator closed"
        );
    }

    /// Snapshot of the coordinator's bookkeeping.
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            outstanding: self.outstanding.lock().len(),
            pending_negative_acks: self.negative_acks.lock().len(),
            pending_ack_timeouts: self.unacked.lock().len(),
            tracked_entries: self.batches.lock().len(),
            pending_retries: self.retry.lock().redeliveries.len(),
        }
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Drain every due entry and request its redelivery.
    ///
    /// Due negative acks, elapsed ack timeouts and sends that failed on an
    /// earlier tick are merged, deduplicated, and sent once each. Nothing is
    /// synthesized locally: redelivered messages come back through
    /// [`on_message_delivered`](Self::on_message_delivered).
    pub async fn run_sweep_tick(&self, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();
        if self.is_closed() {
            return report;
        }

        let retried = std::mem::take(&mut self.retry.lock().redeliveries);
        let negative_ack_due = self.negative_acks.lock().sweep(now_ms);
        let timed_out = self.unacked.lock().sweep(now_ms);

        if !timed_out.is_empty() {
            let mut outstanding = self.outstanding.lock();
            for record in &timed_out {
                outstanding.remove(&record.id);
            }
            debug!(consumer_id = self.consumer_id, count = timed_out.len(), "ack timeout elapsed");
        }

        report.retried = retried.len();
        report.negative_ack_due = negative_ack_due.len();
        report.ack_timeout_due = timed_out.len();

        let candidates = retried.into_iter().chain(negative_ack_due).chain(timed_out.into_iter().map(|r| r.id));
        let mut ids = dedup_preserving_order(candidates);
        {
            let batches = self.batches.lock();
            ids.retain(|id| !batches.is_acked(id));
        }

        self.flush_entry_acks().await;

        report.failed = self.send_redeliveries(ids.clone()).await;
        if report.failed == 0 {
            report.requested = ids;
        } else {
            let failed: HashSet<MessageId> = self.retry.lock().redeliveries.iter().copied().collect();
            report.requested = ids.into_iter().filter(|id| !failed.contains(id)).collect();
        }
        report
    }

    /// Send redelivery requests in bounded chunks.
    ///
    /// Returns how many ids failed to send; those are queued for the next tick.
    async fn send_redeliveries(&self, ids: Vec<MessageId>) -> usize {
        let mut failed = 0;
        for chunk in ids.chunks(MAX_REDELIVERY_BATCH_SIZE) {
            match self.transport.send_redeliver_request(self.consumer_id, chunk).await {
                Ok(()) => {
                    debug!(consumer_id = self.consumer_id, count = chunk.len(), "redelivery requested");
                }
                Err(e) => {
                    warn!(
                        consumer_id = self.consumer_id,
                        count = chunk.len(),
                        error = %e,
                        "redelivery request failed, retrying next tick"
                    );
                    failed += chunk.len();
                    if !self.is_closed() {
                        self.retry.lock().redeliveries.extend_from_slice(chunk);
                    }
                }
            }
        }
        failed
    }

    async fn send_entry_ack(&self, entry: EntryId, kind: AckKind) {
        if let Err(e) = self.transport.send_ack_or_delete(self.consumer_id, entry, kind).await {
            warn!(consumer_id = self.consumer_id, %entry, ?kind, error = %e, "entry ack failed, retrying next tick");
            if !self.is_closed() {
                self.retry.lock().acks.push((entry, kind));
            }
        }
    }

    async fn flush_entry_acks(&self) {
        let acks = std::mem::take(&mut self.retry.lock().acks);
        for (entry, kind) in acks {
            self.send_entry_ack(entry, kind).await;
        }
    }
}

#[async_trait]
impl SweepTarget for ConsumerRedeliveryCoordinator {
    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    async fn run_sweep_tick(&self, now_ms: u64) -> SweepReport {
        ConsumerRedeliveryCoordinator::run_sweep_tick(self, now_ms).await
    }
}

impl Drop for ConsumerRedeliveryCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.stop();
        }
    }
}

fn dedup_preserving_order(ids: impl IntoIterator<Item = MessageId>) -> Vec<MessageId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
