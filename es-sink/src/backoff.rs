//! Exponential backoff used between attempts of a failed bulk call.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

const BACKOFF_FACTOR: f64 = 2.0;

/// Yields the delay before each retry: `base_interval * 2^(retry - 1)`, optionally jittered.
/// The iterator is exhausted after `max_retries` delays, at which point the caller gives up.
#[derive(Debug, Clone)]
pub(crate) struct ExponentialBackoff {
    base_interval: Duration,
    jitter: f64,
    max_retries: u16,
    current_retry: u16,
}

impl ExponentialBackoff {
    pub(crate) fn new(config: &BackoffConfig) -> Self {
        Self {
            base_interval: config.base_interval,
            jitter: config.jitter,
            max_retries: config.max_retries,
            current_retry: 0,
        }
    }

    /// Number of delays handed out so far.
    pub(crate) fn retries(&self) -> u16 {
        self.current_retry
    }

    fn delay_for(&self, retry: u16) -> Duration {
        // retry starts at 1
        let exponent = i32::from(retry.max(1) - 1);
        let base_ms = self.base_interval.as_millis() as f64 * BACKOFF_FACTOR.powi(exponent);

        if self.jitter == 0.0 {
            return Duration::from_millis(base_ms as u64);
        }

        let jitter_factor: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((base_ms * jitter_factor).max(0.0) as u64)
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_retry >= self.max_retries {
            return None;
        }
        self.current_retry += 1;
        Some(self.delay_for(self.current_retry))
    }
}
