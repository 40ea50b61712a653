//! Retry policy for publish attempts

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff with jitter for retryable publish failures.
///
/// Attempt `n` (1-based) that fails retryably is re-dispatched after
/// `base * 2^(n-1)`, capped at `max_delay`, with up to 20% random jitter
/// added so a burst of rate-limited targets does not retry in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }

    /// Whether a target that has already made `attempt_count` attempts may
    /// be retried.
    pub fn attempts_remain(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Delay before re-dispatching after failed attempt number `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);

        let jitter_max = base.as_millis() as u64 / 5;
        let jitter = if jitter_max > 0 {
            rand::thread_rng().gen_range(0..=jitter_max)
        } else {
            0
        };

        base + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
