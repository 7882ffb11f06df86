//! Error types for redelivery scheduling.
//!
//! Uses snafu for structured error handling with context. Only configuration
//! errors surface to callers: acknowledgment calls are best-effort and never
//! fail, and transport failures are retried on the next sweep tick.

use snafu::Snafu;

use crate::constants::MAX_ACK_TIMEOUT_MS;
use crate::constants::MAX_BACKOFF_MULTIPLIER;
use crate::constants::MAX_NEGATIVE_ACK_DELAY_MS;
use crate::constants::MAX_PARTITIONS;
use crate::constants::MAX_SWEEP_TICK_MS;
use crate::constants::MIN_ACK_TIMEOUT_MS;
use crate::constants::MIN_SWEEP_TICK_MS;

/// Result type for redelivery configuration and construction.
pub type Result<T, E = RedeliveryError> = std::result::Result<T, E>;

/// Errors raised while building redelivery components.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RedeliveryError {
    /// Negative acknowledgment delay out of range.
    #[snafu(display("negative ack redelivery delay {delay_ms}ms exceeds maximum of {MAX_NEGATIVE_ACK_DELAY_MS}ms"))]
    InvalidDelay {
        /// Requested delay in milliseconds.
        delay_ms: u64,
    },

    /// Ack timeout is neither disabled (0) nor within bounds.
    #[snafu(display(
        "ack timeout {timeout_ms}ms must be 0 (disabled) or between {MIN_ACK_TIMEOUT_MS}ms and {MAX_ACK_TIMEOUT_MS}ms"
    ))]
    InvalidAckTimeout {
        /// Requested timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Minimum sweep tick out of range.
    #[snafu(display("sweep tick {tick_ms}ms must be between {MIN_SWEEP_TICK_MS}ms and {MAX_SWEEP_TICK_MS}ms"))]
    InvalidTick {
        /// Requested tick in milliseconds.
        tick_ms: u64,
    },

    /// Backoff policy is inconsistent.
    #[snafu(display("invalid negative ack backoff: {reason} (multiplier max {MAX_BACKOFF_MULTIPLIER})"))]
    InvalidBackoff {
        /// Why the backoff was rejected.
        reason: String,
    },

    /// Partition count out of range.
    #[snafu(display("partition count {count} must be between 1 and {MAX_PARTITIONS}"))]
    InvalidPartitionCount {
        /// Requested partition count.
        count: u32,
    },

    /// Configuration text could not be parsed.
    #[snafu(display("failed to parse redelivery configuration: {source}"))]
    ConfigParse {
        /// The underlying TOML error.
        source: toml::de::Error,
    },

    /// Configuration validation failed.
    #[snafu(display("configuration invalid: {message}"))]
    ConfigInvalid {
        /// Error message.
        message: String,
    },
}

/// Errors reported by a [`RedeliveryTransport`](crate::RedeliveryTransport).
///
/// Never fatal to the trackers: the affected identities are retried on the
/// next sweep tick.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// The broker connection is not currently available.
    #[snafu(display("connection to broker unavailable for consumer {consumer_id}"))]
    Disconnected {
        /// Consumer whose connection is down.
        consumer_id: u64,
    },

    /// The send was attempted and failed.
    #[snafu(display("send failed: {message}"))]
    SendFailed {
        /// Error message.
        message: String,
    },
}
