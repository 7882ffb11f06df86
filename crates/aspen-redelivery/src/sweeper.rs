//! Background sweep timer.
//!
//! One task per timer registration drives [`SweepTarget::run_sweep_tick`] at a
//! fixed interval. The task holds only a weak reference to its target, so a
//! dropped coordinator or router ends its timer on the next tick even if
//! `close` was never called.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

/// Outcome of one sweep tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Distinct identities handed to the transport this tick.
    pub requested: Vec<crate::MessageId>,
    /// Identities that came due in the negative ack tracker.
    pub negative_ack_due: usize,
    /// Identities whose ack timeout elapsed.
    pub ack_timeout_due: usize,
    /// Identities carried over from a failed send on an earlier tick.
    pub retried: usize,
    /// Identities whose send failed and were queued for the next tick.
    pub failed: usize,
}

impl SweepReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: SweepReport) {
        self.requested.extend(other.requested);
        self.negative_ack_due += other.negative_ack_due;
        self.ack_timeout_due += other.ack_timeout_due;
        self.retried += other.retried;
        self.failed += other.failed;
    }

    /// Whether the tick did nothing.
    pub fn is_empty(&self) -> bool {
        self.requested.is_empty() && self.failed == 0
    }
}

/// Millisecond clock shared by everything one timer drives.
///
/// Built on `tokio::time::Instant`, so tests running on a paused runtime see
/// deterministic time.
#[derive(Debug, Clone, Copy)]
pub struct RedeliveryClock {
    epoch: Instant,
}

impl RedeliveryClock {
    /// Start a clock at the current instant.
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    /// Milliseconds since the clock started.
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for RedeliveryClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Something a sweep timer can drive.
#[async_trait]
pub trait SweepTarget: Send + Sync + 'static {
    /// Current time on the target's clock.
    fn now_ms(&self) -> u64;

    /// Drain due entries and issue redelivery requests.
    async fn run_sweep_tick(&self, now_ms: u64) -> SweepReport;
}

/// Handle to a running sweep timer.
///
/// Dropping the handle stops the timer.
#[derive(Debug)]
pub struct SweepHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    interval: Duration,
}

impl SweepHandle {
    /// Stop the timer. A tick already in progress finishes first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the timer and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Whether the timer is still running.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Interval between ticks.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn a sweep timer for `target` ticking every `interval`.
pub fn spawn_sweeper<T: SweepTarget>(target: &Arc<T>, interval: Duration) -> SweepHandle {
    let cancel = CancellationToken::new();
    let weak = Arc::downgrade(target);
    let task = tokio::spawn(run_sweep_loop(weak, interval, cancel.clone()));
    SweepHandle {
        cancel,
        task: Some(task),
        interval,
    }
}

/// Run the sweep loop until cancelled or the target is dropped.
async fn run_sweep_loop<T: SweepTarget>(target: Weak<T>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_ms = interval.as_millis() as u64, "redelivery sweep timer started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("redelivery sweep timer stopped");
                break;
            }
            _ = ticker.tick() => {
                let Some(target) = target.upgrade() else {
                    debug!("sweep target dropped, stopping timer");
                    break;
                };
                let report = target.run_sweep_tick(target.now_ms()).await;
                if !report.is_empty() {
                    debug!(
                        requested = report.requested.len(),
                        negative_ack_due = report.negative_ack_due,
                        ack_timeout_due = report.ack_timeout_due,
                        failed = report.failed,
                        "sweep tick"
                    );
                }
            }
        }
    }
}
