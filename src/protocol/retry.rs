//! Retry policy with exponential backoff

use crate::config::RetryConfig;
use std::time::Duration;

/// Longest sleep between two attempts, whatever the schedule says
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Attempts budget and backoff schedule for a single `send`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_attempts: u32, initial_backoff: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
        }
    }

    /// Total attempts, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep before the attempt following `attempt` (1-based).
    ///
    /// With the defaults: 100 ms after attempt 1, 200 ms after attempt 2.
    /// Never longer than [`MAX_BACKOFF`].
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map(|backoff| backoff.min(MAX_BACKOFF))
            .unwrap_or(MAX_BACKOFF)
    }

    /// Whether another attempt is allowed after `attempt`
    pub fn has_attempts_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            config.multiplier,
        )
    }
}
