//! Per-target circuit breaker
//!
//! Transitions are driven only by call outcomes:
//! - Closed -> Open when consecutive failures reach the threshold
//! - Open -> HalfOpen once the open duration elapsed, admitting one trial call
//! - HalfOpen -> Closed on success, HalfOpen -> Open on failure

use crate::config::CircuitBreakerConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_transition: Instant,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one target agent
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    failure_threshold: u32,
    open_duration: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(target: impl Into<String>, failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            target: target.into(),
            failure_threshold: failure_threshold.max(1),
            open_duration,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_transition: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    /// Create a breaker from configuration
    pub fn from_config(target: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(target, config.failure_threshold, config.open_duration())
    }

    /// Ask permission for one attempt. `false` means fail fast.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        let cooled_down = inner.last_transition.elapsed() >= self.open_duration;

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open if cooled_down => {
                inner.state = CircuitState::HalfOpen;
                inner.last_transition = Instant::now();
                inner.trial_in_flight = true;
                tracing::info!(agent = %self.target, "Circuit half-open, admitting trial call");
                true
            }
            CircuitState::Open => false,
            // a trial abandoned without an outcome must not wedge the breaker
            CircuitState::HalfOpen if !inner.trial_in_flight || cooled_down => {
                inner.trial_in_flight = true;
                inner.last_transition = Instant::now();
                true
            }
            CircuitState::HalfOpen => false,
        }
    }

    /// Record a successful attempt
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        // a call admitted before the breaker opened does not close it
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.last_transition = Instant::now();
            tracing::info!(agent = %self.target, "Circuit closed");
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = false;

        let should_open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            inner.state = CircuitState::Open;
            inner.last_transition = Instant::now();
            tracing::warn!(
                "Circuit for agent {} opened after {} consecutive failures",
                self.target,
                inner.consecutive_failures
            );
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Current consecutive-failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Target agent guarded by this breaker
    pub fn target(&self) -> &str {
        &self.target
    }
}
