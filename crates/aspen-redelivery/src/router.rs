//! Partitioned consumer routing.
//!
//! A consumer of a partitioned topic is one coordinator per partition. The
//! router forwards every call by the partition carried in the message id and
//! drives all partitions from a single sweep timer, so timer count does not
//! grow with partition count.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use tracing::info;

use crate::config::RedeliveryConfig;
use crate::constants::MAX_PARTITIONS;
use crate::coordinator::ConsumerRedeliveryCoordinator;
use crate::coordinator::CoordinatorStats;
use crate::error::ConfigInvalidSnafu;
use crate::error::InvalidPartitionCountSnafu;
use crate::error::Result;
use crate::message_id::MessageId;
use crate::sweeper::RedeliveryClock;
use crate::sweeper::SweepHandle;
use crate::sweeper::SweepReport;
use crate::sweeper::SweepTarget;
use crate::sweeper::spawn_sweeper;
use crate::transport::ConsumerId;
use crate::transport::RedeliveryTransport;

/// One coordinator per partition behind a single sweep timer.
pub struct PartitionRouter {
    config: RedeliveryConfig,
    clock: RedeliveryClock,
    partitions: BTreeMap<i32, Arc<ConsumerRedeliveryCoordinator>>,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl std::fmt::Debug for PartitionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionRouter")
            .field("partitions", &self.partitions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PartitionRouter {
    /// Create coordinators for partitions `0..partition_count`.
    ///
    /// Partition `p` is scheduled under consumer id `first_consumer_id + p`.
    ///
    /// # Errors
    ///
    /// - `InvalidPartitionCount` if `partition_count` is 0 or above `MAX_PARTITIONS`
    /// - `ConfigInvalid` if the consumer id range overflows `u64`
    /// - any configuration error from [`RedeliveryConfig::validate`]
    pub fn new(
        first_consumer_id: ConsumerId,
        partition_count: u32,
        config: RedeliveryConfig,
        transport: Arc<dyn RedeliveryTransport>,
    ) -> Result<Self> {
        if partition_count == 0 || partition_count > MAX_PARTITIONS {
            return InvalidPartitionCountSnafu { count: partition_count }.fail();
        }
        if first_consumer_id.checked_add(u64::from(partition_count - 1)).is_none() {
            return ConfigInvalidSnafu {
                message: format!("consumer ids for {partition_count} partitions overflow from {first_consumer_id}"),
            }
            .fail();
        }
        config.validate()?;

        let clock = RedeliveryClock::new();
        let mut partitions = BTreeMap::new();
        for partition in 0..partition_count {
            let coordinator = ConsumerRedeliveryCoordinator::with_clock(
                first_consumer_id.saturating_add(u64::from(partition)),
                config.clone(),
                transport.clone(),
                clock,
            )?;
            partitions.insert(partition as i32, Arc::new(coordinator));
        }

        debug!(first_consumer_id, partition_count, "partition router created");

        Ok(Self {
            config,
            clock,
            partitions,
            sweeper: Mutex::new(None),
        })
    }

    /// Start the shared sweep timer.
    pub fn start(self: &Arc<Self>) {
        let handle = spawn_sweeper(self, self.config.sweep_tick());
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.stop();
        }
    }

    /// Whether the shared sweep timer is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().as_ref().is_some_and(SweepHandle::is_running)
    }

    /// Interval of the shared sweep timer.
    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_tick()
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Coordinator for one partition.
    pub fn partition(&self, partition_index: i32) -> Option<&Arc<ConsumerRedeliveryCoordinator>> {
        self.partitions.get(&partition_index)
    }

    fn route(&self, id: &MessageId) -> Option<&Arc<ConsumerRedeliveryCoordinator>> {
        let coordinator = self.partitions.get(&id.partition_index);
        if coordinator.is_none() {
            debug!(%id, "message for unknown partition ignored");
        }
        coordinator
    }

    /// Register a delivered message with its partition.
    pub fn on_message_delivered(&self, id: MessageId) {
        if let Some(coordinator) = self.route(&id) {
            coordinator.on_message_delivered(id);
        }
    }

    /// Register a redelivered message with its partition.
    pub fn on_message_redelivered(&self, id: MessageId, redelivery_count: u32) {
        if let Some(coordinator) = self.route(&id) {
            coordinator.on_message_redelivered(id, redelivery_count);
        }
    }

    /// Acknowledge a message on its partition.
    pub async fn acknowledge(&self, id: MessageId) {
        if let Some(coordinator) = self.route(&id) {
            coordinator.acknowledge(id).await;
        }
    }

    /// Cumulatively acknowledge a message on its partition.
    pub async fn acknowledge_cumulative(&self, id: MessageId) {
        if let Some(coordinator) = self.route(&id) {
            coordinator.acknowledge_cumulative(id).await;
        }
    }

    /// Negatively acknowledge a message on its partition.
    pub fn negative_acknowledge(&self, id: MessageId) {
        if let Some(coordinator) = self.route(&id) {
            coordinator.negative_acknowledge(id);
        }
    }

    /// Negatively acknowledge a message on its partition with an explicit delay.
    pub fn negative_acknowledge_with_delay(&self, id: MessageId, delay: Duration) {
        if let Some(coordinator) = self.route(&id) {
            coordinator.negative_acknowledge_with_delay(id, delay);
        }
    }

    /// Request redelivery of every unacknowledged message on every partition.
    pub async fn redeliver_unacknowledged(&self) -> usize {
        let mut total = 0;
        for coordinator in self.partitions.values() {
            total += coordinator.redeliver_unacknowledged().await;
        }
        total
    }

    /// Run one sweep tick on every partition.
    pub async fn run_sweep_tick(&self, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();
        for coordinator in self.partitions.values() {
            report.merge(coordinator.run_sweep_tick(now_ms).await);
        }
        report
    }

    /// Stop the shared timer and close every partition.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.stop();
        }
        for coordinator in self.partitions.values() {
            coordinator.close();
        }
        info!(partitions = self.partitions.len(), "partition router closed");
    }

    /// Bookkeeping summed over all partitions.
    pub fn stats(&self) -> CoordinatorStats {
        self.partitions.values().map(|c| c.stats()).fold(CoordinatorStats::default(), |acc, s| CoordinatorStats {
            outstanding: acc.outstanding + s.outstanding,
            pending_negative_acks: acc.pending_negative_acks + s.pending_negative_acks,
            pending_ack_timeouts: acc.pending_ack_timeouts + s.pending_ack_timeouts,
            tracked_entries: acc.tracked_entries + s.tracked_entries,
            pending_retries: acc.pending_retries + s.pending_retries,
        })
    }
}

#[async_trait]
impl SweepTarget for PartitionRouter {
    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    async fn run_sweep_tick(&self, now_ms: u64) -> SweepReport {
        PartitionRouter::run_sweep_tick(self, now_ms).await
    }
}

impl Drop for PartitionRouter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RedeliveryError;
    use crate::error::TransportError;
    use crate::message_id::EntryId;
    use crate::transport::AckKind;

    #[derive(Debug, Default)]
    struct RecordingTransport {
        redeliveries: Mutex<Vec<(ConsumerId, Vec<MessageId>)>>,
    }

    #[async_trait]
    impl RedeliveryTransport for RecordingTransport {
        async fn send_redeliver_request(&self, consumer_id: ConsumerId, ids: &[MessageId]) -> Result<(), TransportError> {
            self.redeliveries.lock().push((consumer_id, ids.to_vec()));
            Ok(())
        }

        async fn send_ack_or_delete(&self, _consumer_id: ConsumerId, _entry: EntryId, _kind: AckKind) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn router(partitions: u32) -> (PartitionRouter, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let config = RedeliveryConfig::default().with_negative_ack_delay(Duration::from_millis(100));
        let router = PartitionRouter::new(10, partitions, config, transport.clone()).unwrap();
        (router, transport)
    }

    #[test]
    fn test_partition_count_validated() {
        let transport: Arc<dyn RedeliveryTransport> = Arc::new(RecordingTransport::default());
        let err = PartitionRouter::new(1, 0, RedeliveryConfig::default(), transport.clone()).unwrap_err();
        assert!(matches!(err, RedeliveryError::InvalidPartitionCount { count: 0 }));

        let err = PartitionRouter::new(1, MAX_PARTITIONS + 1, RedeliveryConfig::default(), transport).unwrap_err();
        assert!(matches!(err, RedeliveryError::InvalidPartitionCount { .. }));
    }

    #[test]
    fn test_consumer_id_range_overflow_rejected() {
        let transport: Arc<dyn RedeliveryTransport> = Arc::new(RecordingTransport::default());
        let err = PartitionRouter::new(u64::MAX, 2, RedeliveryConfig::default(), transport.clone()).unwrap_err();
        assert!(matches!(err, RedeliveryError::ConfigInvalid { .. }));

        let router = PartitionRouter::new(u64::MAX - 1, 2, RedeliveryConfig::default(), transport).unwrap();
        assert_eq!(router.partition(1).map(|p| p.consumer_id()), Some(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_never_cross_partitions() {
        let (router, transport) = router(3);
        for partition in 0..3 {
            for entry in 0..2 {
                let id = MessageId::new(1, entry).with_partition(partition);
                router.on_message_delivered(id);
                router.negative_acknowledge(id);
            }
        }

        let report = router.run_sweep_tick(1_000).await;
        assert_eq!(report.requested.len(), 6);

        let requests = transport.redeliveries.lock().clone();
        assert_eq!(requests.len(), 3);
        for (consumer_id, ids) in requests {
            let partition = (consumer_id - 10) as i32;
            assert!(ids.iter().all(|id| id.partition_index == partition));
            assert_eq!(ids.len(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_partition_ignored() {
        let (router, transport) = router(2);
        let id = MessageId::new(1, 1).with_partition(7);
        router.on_message_delivered(id);
        router.negative_acknowledge(id);
        router.acknowledge(id).await;

        assert_eq!(router.stats(), CoordinatorStats::default());
        assert!(router.run_sweep_tick(1_000).await.requested.is_empty());
        assert!(transport.redeliveries.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_drives_all_partitions() {
        let (router, transport) = router(4);
        let router = Arc::new(router);
        router.start();
        assert!(router.is_sweeping());
        for partition in 0..4 {
            assert!(!router.partition(partition).unwrap().is_sweeping());
        }

        for partition in 0..4 {
            let id = MessageId::new(1, 1).with_partition(partition);
            router.on_message_delivered(id);
            router.negative_acknowledge(id);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.redeliveries.lock().len(), 4);

        router.close();
        assert!(!router.is_sweeping());
        assert!(router.partition(0).unwrap().is_closed());
    }
}
