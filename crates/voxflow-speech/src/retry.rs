//! Bounded reconnect policy with exponential backoff.

use std::time::Duration;

use rand::Rng;

use voxflow_core::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether reconnect number `attempt` (1-based) is within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.config.max_attempts
    }

    /// Delay before reconnect number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let delay = delay.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(delay as u64)
    }

    /// Delay before reconnect number `attempt`, plus up to 25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.config.jitter || base.is_zero() {
            return base;
        }
        let range = base.as_secs_f64() * 0.25;
        base + Duration::from_secs_f64(rand::rng().random_range(0.0..=range))
    }
}
