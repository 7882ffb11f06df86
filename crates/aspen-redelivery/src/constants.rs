//! Tiger Style resource limits for redelivery scheduling.
//!
//! These constants bound the memory and timer work a single consumer can
//! create. All durations are in milliseconds.

/// Default negative acknowledgment redelivery delay in milliseconds (60 seconds).
///
/// Applied when a message is negatively acknowledged without an explicit delay
/// and no backoff policy is configured.
pub const DEFAULT_NEGATIVE_ACK_DELAY_MS: u64 = 60_000;

/// Maximum negative acknowledgment redelivery delay in milliseconds (1 hour).
pub const MAX_NEGATIVE_ACK_DELAY_MS: u64 = 3_600_000;

/// Minimum non-zero ack timeout in milliseconds (1 second).
///
/// An ack timeout of 0 disables the unacked message tracker entirely.
/// Anything below one second would redeliver messages that are still
/// being processed under normal load.
pub const MIN_ACK_TIMEOUT_MS: u64 = 1_000;

/// Maximum ack timeout in milliseconds (1 hour).
pub const MAX_ACK_TIMEOUT_MS: u64 = 3_600_000;

/// Default floor for the sweep tick in milliseconds.
///
/// Keeps the sweep timer from busy-looping when the configured delays are
/// tiny or zero.
pub const DEFAULT_MIN_SWEEP_TICK_MS: u64 = 10;

/// Hard floor for the sweep tick in milliseconds.
pub const MIN_SWEEP_TICK_MS: u64 = 1;

/// Ceiling for the sweep tick in milliseconds.
///
/// Bounds how late a due message can be requested when delays are long.
pub const MAX_SWEEP_TICK_MS: u64 = 1_000;

/// Fraction of the smallest configured delay used as the sweep interval.
pub const SWEEP_TICK_DIVISOR: u64 = 3;

/// Maximum identities carried by one redelivery request.
///
/// Larger sweeps are split into several requests.
pub const MAX_REDELIVERY_BATCH_SIZE: usize = 1_000;

/// Maximum logical messages in one batched wire entry.
pub const MAX_BATCH_SIZE: u32 = 65_536;

/// Maximum partitions a single partitioned consumer may fan out to.
pub const MAX_PARTITIONS: u32 = 4_096;

/// Maximum backoff multiplier for negative acknowledgment redelivery.
pub const MAX_BACKOFF_MULTIPLIER: u32 = 16;

/// Number of fully acknowledged entries remembered per consumer.
///
/// Lets duplicate acknowledgments for recently retired batch entries be
/// recognised as no-ops without growing without bound.
pub const MAX_RETIRED_ENTRIES: usize = 10_000;
