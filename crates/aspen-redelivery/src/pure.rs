//! Pure scheduling arithmetic.
//!
//! Deterministic, side-effect free helpers shared by the trackers and the
//! coordinator.
//!
//! # Tiger Style
//!
//! - Saturating arithmetic everywhere
//! - Time is passed explicitly (no clock reads)

use crate::constants::MAX_SWEEP_TICK_MS;
use crate::constants::SWEEP_TICK_DIVISOR;

// ============================================================================
// Deadlines
// ============================================================================

/// Start of the `granularity_ms` wide bucket holding `deadline_ms`.
///
/// A bucket starts at or before every deadline it holds. A granularity of 0
/// is treated as 1.
///
/// # Example
///
/// ```ignore
/// assert_eq!(bucket_start(100, 30), 90);
/// assert_eq!(bucket_start(120, 30), 120);
/// ```
#[inline]
pub fn bucket_start(deadline_ms: u64, granularity_ms: u64) -> u64 {
    deadline_ms - deadline_ms % granularity_ms.max(1)
}

/// Whether a record delivered at `delivered_at_ms` has exceeded its ack timeout.
#[inline]
pub fn is_ack_timeout_expired(delivered_at_ms: u64, ack_timeout_ms: u64, now_ms: u64) -> bool {
    delivered_at_ms.saturating_add(ack_timeout_ms) <= now_ms
}

// ============================================================================
// Tick Computation
// ============================================================================

/// Bucket granularity for the negative ack tracker.
///
/// One third of the delay, floored at `min_tick_ms` and capped at
/// [`MAX_SWEEP_TICK_MS`].
#[inline]
pub fn nack_bucket_granularity(delay_ms: u64, min_tick_ms: u64) -> u64 {
    (delay_ms / SWEEP_TICK_DIVISOR).clamp(min_tick_ms.max(1), MAX_SWEEP_TICK_MS.max(min_tick_ms))
}

/// Sweep interval for a consumer.
///
/// One third of the smallest enabled delay, floored at `min_tick_ms` and
/// capped at [`MAX_SWEEP_TICK_MS`]. An `ack_timeout_ms` of 0 is disabled and
/// does not participate.
#[inline]
pub fn sweep_tick(nack_delay_ms: u64, ack_timeout_ms: u64, min_tick_ms: u64) -> u64 {
    let smallest = if ack_timeout_ms > 0 {
        nack_delay_ms.min(ack_timeout_ms)
    } else {
        nack_delay_ms
    };
    nack_bucket_granularity(smallest, min_tick_ms)
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential redelivery delay for a message redelivered `redelivery_count` times.
///
/// Returns `min(max_delay_ms, min_delay_ms * multiplier^redelivery_count)`.
///
/// # Example
///
/// ```ignore
/// assert_eq!(backoff_delay(100, 1_000, 2, 0), 100);
/// assert_eq!(backoff_delay(100, 1_000, 2, 3), 800);
/// assert_eq!(backoff_delay(100, 1_000, 2, 4), 1_000);
/// ```
#[inline]
pub fn backoff_delay(min_delay_ms: u64, max_delay_ms: u64, multiplier: u32, redelivery_count: u32) -> u64 {
    let factor = u64::from(multiplier).saturating_pow(redelivery_count);
    min_delay_ms.saturating_mul(factor).min(max_delay_ms)
}
