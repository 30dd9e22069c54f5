//! Process-wide circuit breaker.
//!
//! Independent of rate-limiter keys: while open, every request is rejected
//! uniformly with a short fixed retry-after. Closed → open when the error
//! counter reaches the threshold; open → half-open once the open timeout
//! has elapsed (observed on the next state check); half-open → closed after
//! the configured number of consecutive successes. Any failure while
//! half-open reopens immediately.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Errors in the closed state before tripping open.
    pub error_threshold: u64,
    /// Seconds to stay open before allowing half-open probes.
    pub open_timeout_secs: u64,
    /// Consecutive successes in half-open required to close.
    pub half_open_successes: u64,
    /// Retry-after reported while open.
    pub retry_after_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 50,
            open_timeout_secs: 30,
            half_open_successes: 5,
            retry_after_secs: 5,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    error_count: u64,
    success_count: u64,
    tripped_at_millis: u64,
    updated_at_millis: u64,
}

/// Circuit breaker handle. Clones share state, so every part of the
/// process observes the same circuit lifecycle.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<BreakerState>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                error_count: 0,
                success_count: 0,
                tripped_at_millis: 0,
                updated_at_millis: 0,
            })),
            config,
            clock,
        }
    }

    /// Current state, applying the time-driven open → half-open transition.
    pub async fn current_state(&self) -> CircuitState {
        let now = self.clock.now_millis();
        let mut st = self.state.lock().await;
        if st.state == CircuitState::Open
            && now >= st.tripped_at_millis + self.config.open_timeout_secs * 1000
        {
            st.state = CircuitState::HalfOpen;
            st.success_count = 0;
            st.updated_at_millis = now;
            info!("Circuit breaker open -> half-open");
        }
        st.state
    }

    /// Whether a request may proceed. `None` when admitted, otherwise the
    /// retry-after to report.
    pub async fn check(&self) -> Option<u64> {
        match self.current_state().await {
            CircuitState::Open => Some(self.config.retry_after_secs),
            CircuitState::Closed | CircuitState::HalfOpen => None,
        }
    }

    pub async fn record_success(&self) {
        let now = self.clock.now_millis();
        let mut st = self.state.lock().await;
        st.updated_at_millis = now;
        match st.state {
            CircuitState::Closed => {
                st.error_count = 0;
            }
            CircuitState::HalfOpen => {
                st.success_count += 1;
                if st.success_count >= self.config.half_open_successes {
                    st.state = CircuitState::Closed;
                    st.error_count = 0;
                    st.success_count = 0;
                    st.tripped_at_millis = 0;
                    info!("Circuit breaker half-open -> closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let now = self.clock.now_millis();
        let mut st = self.state.lock().await;
        st.updated_at_millis = now;
        match st.state {
            CircuitState::Closed => {
                st.error_count += 1;
                if st.error_count >= self.config.error_threshold {
                    st.state = CircuitState::Open;
                    st.tripped_at_millis = now;
                    st.success_count = 0;
                    warn!(errors = st.error_count, "Circuit breaker tripped open");
                }
            }
            CircuitState::HalfOpen => {
                // A half-open failure reopens immediately; the probe window
                // restarts from now.
                st.state = CircuitState::Open;
                st.tripped_at_millis = now;
                st.success_count = 0;
                warn!("Circuit breaker half-open probe failed, reopening");
            }
            CircuitState::Open => {}
        }
    }

    pub async fn error_count(&self) -> u64 {
        self.state.lock().await.error_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker() -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let config = BreakerConfig {
            error_threshold: 3,
            open_timeout_secs: 30,
            half_open_successes: 2,
            retry_after_secs: 5,
        };
        (
            CircuitBreaker::new(config, Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn test_full_cycle() {
        let (cb, clock) = breaker();
        assert_eq!(cb.current_state().await, CircuitState::Closed);

        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert_eq!(cb.current_state().await, CircuitState::Open);
        assert_eq!(cb.check().await, Some(5));

        // Open -> half-open after the timeout, observed on a state check.
        clock.advance_secs(30);
        assert_eq!(cb.current_state().await, CircuitState::HalfOpen);
        assert_eq!(cb.check().await, None);

        cb.record_success().await;
        cb.record_success().await;
        assert_eq!(cb.current_state().await, CircuitState::Closed);
        assert_eq!(cb.error_count().await, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (cb, clock) = breaker();
        for _ in 0..3 {
            cb.record_failure().await;
        }
        clock.advance_secs(30);
        assert_eq!(cb.current_state().await, CircuitState::HalfOpen);

        cb.record_failure().await;
        assert_eq!(cb.current_state().await, CircuitState::Open);

        // The reopened window starts from the failed probe, not the
        // original trip.
        clock.advance_secs(29);
        assert_eq!(cb.current_state().await, CircuitState::Open);
        clock.advance_secs(1);
        assert_eq!(cb.current_state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_closed_success_resets_errors() {
        let (cb, _clock) = breaker();
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        // F-F-S-F never reaches the threshold of 3 consecutive errors.
        assert_eq!(cb.current_state().await, CircuitState::Closed);
    }
}
