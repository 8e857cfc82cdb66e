//! Reconnect delays.

use rand::Rng;
use std::time::Duration;
use voicelink_core::RetryConfig;

/// Delay policy between reconnect attempts.
///
/// Without jitter the wait before attempt `k + 1` is `min(base * 2^k, max)`
/// (or just `base` when exponential growth is off). Jitter scales that by a
/// random factor in `[0.5, 1.0)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    exponential: bool,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            exponential: true,
            jitter: true,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: config.retry_interval,
            max: config.max_retry_interval,
            exponential: config.exponential_backoff,
            jitter: config.jitter,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_exponential(mut self, exponential: bool) -> Self {
        self.exponential = exponential;
        self
    }

    /// Delay after `attempt` failed attempts, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base.min(self.max);
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    /// Delay after `attempt` failed attempts, jitter applied if enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter {
            delay.mul_f64(rand::rng().random_range(0.5..1.0))
        } else {
            delay
        }
    }
}
