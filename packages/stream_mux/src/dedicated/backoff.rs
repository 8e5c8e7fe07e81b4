use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential reconnect backoff with a retry bound.
///
/// The delay before retry `n` (zero-based) is `min(base * 2^n, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    retry_count: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            retry_count: 0,
        }
    }

    /// Delay for a given zero-based retry number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let max = self.config.max_delay;
        let Some(factor) = 1u32.checked_shl(attempt) else {
            return max;
        };
        self.config
            .base_delay
            .checked_mul(factor)
            .map_or(max, |delay| delay.min(max))
    }

    /// Consume one retry. `None` once the retry budget is spent.
    pub fn next(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let delay = self.delay_for(self.retry_count);
        self.retry_count += 1;
        Some(delay)
    }

    pub fn exhausted(&self) -> bool {
        self.retry_count >= self.config.max_retries
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}
