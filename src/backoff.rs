//! Restart and reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with bounded random jitter.
///
/// The delay before attempt `n` (0-based) is `min_backoff * 2^n`, capped at
/// `max_backoff`, then stretched by a random fraction of up to
/// `random_factor` so that many identities failing together do not retry in
/// lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub min_backoff: Duration,
    /// Upper bound on the un-jittered delay.
    pub max_backoff: Duration,
    /// Maximum extra fraction added as jitter (`0.1` = up to 10%).
    pub random_factor: f64,
    /// Attempts allowed before giving up. `None` retries forever.
    pub max_restarts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            random_factor: 0.1,
            max_restarts: Some(10),
        }
    }
}

impl RetryPolicy {
    /// Set the attempt limit.
    pub fn with_max_restarts(mut self, max_restarts: Option<u32>) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Set the delay bounds.
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }

    /// Whether attempt number `attempt` (0-based) is still allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_restarts.is_none_or(|max| attempt < max)
    }

    /// Un-jittered delay for `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.min_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Jittered delay for `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.random_factor <= 0.0 {
            return base;
        }
        let jitter = rand::rng().random_range(0.0..=self.random_factor);
        base.mul_f64(1.0 + jitter)
    }
}
