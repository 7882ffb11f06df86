//! Redelivery configuration.
//!
//! Supports configuration via TOML with validation. Validation runs before
//! any tracker is created, so a bad value fails consumer construction rather
//! than surfacing later as a scheduling anomaly.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::constants::DEFAULT_MIN_SWEEP_TICK_MS;
use crate::constants::DEFAULT_NEGATIVE_ACK_DELAY_MS;
use crate::constants::MAX_ACK_TIMEOUT_MS;
use crate::constants::MAX_BACKOFF_MULTIPLIER;
use crate::constants::MAX_NEGATIVE_ACK_DELAY_MS;
use crate::constants::MAX_SWEEP_TICK_MS;
use crate::constants::MIN_ACK_TIMEOUT_MS;
use crate::constants::MIN_SWEEP_TICK_MS;
use crate::error::ConfigInvalidSnafu;
use crate::error::ConfigParseSnafu;
use crate::error::InvalidAckTimeoutSnafu;
use crate::error::InvalidBackoffSnafu;
use crate::error::InvalidDelaySnafu;
use crate::error::InvalidTickSnafu;
use crate::error::Result;
use crate::pure;

/// Subscription type of the consumer.
///
/// Resolved entirely by the broker when it receives a redelivery request:
/// `Shared` and `KeyShared` may resend to any live consumer of the
/// subscription, `Failover` and `Exclusive` only to the active one. The
/// redelivery core carries the value for the transport and never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    /// Single consumer attached to the subscription.
    #[default]
    Exclusive,
    /// Messages are load-balanced across all consumers.
    Shared,
    /// One active consumer with standbys.
    Failover,
    /// Load-balanced with per-key ordering.
    KeyShared,
}

/// Exponential backoff for negative acknowledgment redelivery.
///
/// The delay for a message already redelivered `n` times is
/// `min(max_delay_ms, min_delay_ms * multiplier^n)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay for the first negative acknowledgment.
    pub min_delay_ms: u64,
    /// Upper bound on the delay.
    pub max_delay_ms: u64,
    /// Growth factor per redelivery.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

impl BackoffConfig {
    /// Validate the backoff policy.
    pub fn validate(&self) -> Result<()> {
        if self.min_delay_ms > self.max_delay_ms {
            return InvalidBackoffSnafu {
                reason: format!("min delay {}ms exceeds max delay {}ms", self.min_delay_ms, self.max_delay_ms),
            }
            .fail();
        }
        if self.max_delay_ms > MAX_NEGATIVE_ACK_DELAY_MS {
            return InvalidDelaySnafu {
                delay_ms: self.max_delay_ms,
            }
            .fail();
        }
        if self.multiplier == 0 || self.multiplier > MAX_BACKOFF_MULTIPLIER {
            return InvalidBackoffSnafu {
                reason: format!("multiplier {} out of range", self.multiplier),
            }
            .fail();
        }
        Ok(())
    }

    /// Delay for a message that has been redelivered `redelivery_count` times.
    pub fn delay_for(&self, redelivery_count: u32) -> Duration {
        Duration::from_millis(pure::backoff_delay(
            self.min_delay_ms,
            self.max_delay_ms,
            self.multiplier,
            redelivery_count,
        ))
    }
}

/// Redelivery settings for one consumer.
///
/// # Example TOML
///
/// ```toml
/// subscription_type = "shared"
/// negative_ack_redelivery_delay_ms = 100
/// ack_timeout_ms = 1000
///
/// [negative_ack_backoff]
/// min_delay_ms = 100
/// max_delay_ms = 10000
/// multiplier = 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeliveryConfig {
    /// Subscription type, forwarded to the transport.
    #[serde(default)]
    pub subscription_type: SubscriptionType,

    /// Delay before a negatively acknowledged message is redelivered.
    #[serde(default = "default_negative_ack_delay_ms")]
    pub negative_ack_redelivery_delay_ms: u64,

    /// Ack timeout. 0 disables the unacked message tracker.
    #[serde(default)]
    pub ack_timeout_ms: u64,

    /// How long acknowledgments are grouped before reaching this core.
    ///
    /// Consumed by the acknowledgment grouper in front of the coordinator.
    #[serde(default)]
    pub acknowledgment_group_time_ms: u64,

    /// Floor for the sweep interval.
    #[serde(default = "default_min_sweep_tick_ms")]
    pub min_sweep_tick_ms: u64,

    /// Optional exponential backoff replacing the fixed negative ack delay.
    #[serde(default)]
    pub negative_ack_backoff: Option<BackoffConfig>,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            subscription_type: SubscriptionType::default(),
            negative_ack_redelivery_delay_ms: default_negative_ack_delay_ms(),
            ack_timeout_ms: 0,
            acknowledgment_group_time_ms: 0,
            min_sweep_tick_ms: default_min_sweep_tick_ms(),
            negative_ack_backoff: None,
        }
    }
}

impl RedeliveryConfig {
    /// Parse and validate a configuration from TOML text.
    ///
    /// Negative or non-integer durations fail to parse and are reported as
    /// [`ConfigParse`](crate::RedeliveryError::ConfigParse).
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context(ConfigParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the subscription type.
    pub fn with_subscription_type(mut self, subscription_type: SubscriptionType) -> Self {
        self.subscription_type = subscription_type;
        self
    }

    /// Set the negative ack redelivery delay.
    pub fn with_negative_ack_delay(mut self, delay: Duration) -> Self {
        self.negative_ack_redelivery_delay_ms = duration_ms(delay);
        self
    }

    /// Set the ack timeout. [`Duration::ZERO`] disables it.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the sweep interval floor.
    pub fn with_min_sweep_tick(mut self, tick: Duration) -> Self {
        self.min_sweep_tick_ms = duration_ms(tick);
        self
    }

    /// Set the negative ack backoff policy.
    pub fn with_negative_ack_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.negative_ack_backoff = Some(backoff);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.negative_ack_redelivery_delay_ms > MAX_NEGATIVE_ACK_DELAY_MS {
            return InvalidDelaySnafu {
                delay_ms: self.negative_ack_redelivery_delay_ms,
            }
            .fail();
        }

        if self.ack_timeout_ms != 0 && !(MIN_ACK_TIMEOUT_MS..=MAX_ACK_TIMEOUT_MS).contains(&self.ack_timeout_ms) {
            return InvalidAckTimeoutSnafu {
                timeout_ms: self.ack_timeout_ms,
            }
            .fail();
        }

        if !(MIN_SWEEP_TICK_MS..=MAX_SWEEP_TICK_MS).contains(&self.min_sweep_tick_ms) {
            return InvalidTickSnafu {
                tick_ms: self.min_sweep_tick_ms,
            }
            .fail();
        }

        if self.is_ack_timeout_enabled() && self.acknowledgment_group_time_ms >= self.ack_timeout_ms {
            return ConfigInvalidSnafu {
                message: format!(
                    "acknowledgment group time {}ms must be shorter than ack timeout {}ms",
                    self.acknowledgment_group_time_ms, self.ack_timeout_ms
                ),
            }
            .fail();
        }

        if let Some(backoff) = &self.negative_ack_backoff {
            backoff.validate()?;
        }

        Ok(())
    }

    /// Whether the unacked message tracker is active.
    #[inline]
    pub fn is_ack_timeout_enabled(&self) -> bool {
        self.ack_timeout_ms > 0
    }

    /// Fixed negative ack delay.
    pub fn negative_ack_delay(&self) -> Duration {
        Duration::from_millis(self.negative_ack_redelivery_delay_ms)
    }

    /// Ack timeout, `None` when disabled.
    pub fn ack_timeout(&self) -> Option<Duration> {
        self.is_ack_timeout_enabled().then(|| Duration::from_millis(self.ack_timeout_ms))
    }

    /// Delay to apply to a message nacked after `redelivery_count` redeliveries.
    pub fn negative_ack_delay_for(&self, redelivery_count: u32) -> Duration {
        match &self.negative_ack_backoff {
            Some(backoff) => backoff.delay_for(redelivery_count),
            None => self.negative_ack_delay(),
        }
    }

    /// Smallest delay the negative ack tracker will schedule.
    fn smallest_negative_ack_delay_ms(&self) -> u64 {
        match &self.negative_ack_backoff {
            Some(backoff) => backoff.min_delay_ms.min(self.negative_ack_redelivery_delay_ms),
            None => self.negative_ack_redelivery_delay_ms,
        }
    }

    /// Bucket granularity for the negative ack tracker.
    pub fn nack_bucket_granularity_ms(&self) -> u64 {
        pure::nack_bucket_granularity(self.smallest_negative_ack_delay_ms(), self.min_sweep_tick_ms)
    }

    /// Interval between sweep ticks.
    pub fn sweep_tick(&self) -> Duration {
        Duration::from_millis(pure::sweep_tick(
            self.smallest_negative_ack_delay_ms(),
            self.ack_timeout_ms,
            self.min_sweep_tick_ms,
        ))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_negative_ack_delay_ms() -> u64 {
    DEFAULT_NEGATIVE_ACK_DELAY_MS
}

fn default_min_sweep_tick_ms() -> u64 {
    DEFAULT_MIN_SWEEP_TICK_MS
}

fn default_multiplier() -> u32 {
    2
}
