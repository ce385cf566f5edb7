//! Circuit breaker for calls to downstream targets.
//!
//! Three states: Closed (calls flow), Open (calls fail fast) and HalfOpen
//! (a single trial call is let through to test recovery). The breaker never blocks
//! and never runs the protected call itself; callers consult
//! [`CircuitBreaker::can_attempt`] and report the outcome with
//! [`CircuitBreaker::record_success`] / [`CircuitBreaker::record_failure`].

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, calls are allowed through
    Closed,
    /// Failing fast until the timeout elapses
    Open,
    /// Testing recovery with one trial call at a time
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Thresholds controlling state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Half-open successes needed to close it again.
    pub success_threshold: u32,
    /// Time spent open before a trial call is allowed.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
}

/// Point-in-time view of a breaker, for dashboards and logs.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
}

/// Per-target failure classifier.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: MetricsCollector,
}

impl CircuitBreaker {
    /// Create a closed breaker for the named target.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            component = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            timeout_secs = config.timeout.as_secs(),
            "Circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                trial_in_flight: false,
            }),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose timeout has elapsed still reports
    /// Open until a caller asks to attempt.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a protected call may be issued now.
    ///
    /// Moving from Open to HalfOpen happens here once the timeout has
    /// elapsed. While HalfOpen, exactly one caller is let through until its
    /// outcome is recorded.
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|at| at.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if elapsed {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful protected call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                debug!(component = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    /// Record a failed protected call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed, clearing all counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.last_failure_time = None;
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            timeout_secs: self.config.timeout.as_secs(),
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.success_count = 0;
        inner.trial_in_flight = false;
        if to == CircuitState::Closed {
            inner.failure_count = 0;
        }

        match to {
            CircuitState::Open => warn!(
                component = %self.name,
                from = %from,
                failure_count = inner.failure_count,
                timeout_secs = self.config.timeout.as_secs(),
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(
                component = %self.name,
                "Circuit breaker half-open, allowing trial call"
            ),
            CircuitState::Closed => info!(
                component = %self.name,
                from = %from,
                "Circuit breaker closed"
            ),
        }
        self.metrics.record_circuit_transition(&self.name, to.as_str());
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_timeout(Duration::from_millis(timeout_ms)),
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 1, 10_000);
        assert!(cb.can_attempt());

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_attempt());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_attempt());
    }

    #[test]
    fn test_success_resets_failure_count_when_closed() {
        let cb = breaker(2, 1, 10_000);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_single_trial_call_after_timeout() {
        let cb = breaker(2, 1, 50);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.can_attempt());

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.can_attempt(), "only one trial call may be in flight");

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_attempt(), "timeout clock restarts on reopen");
    }

    #[tokio::test]
    async fn test_closes_after_success_threshold() {
        let cb = breaker(1, 2, 30);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cb.can_attempt());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.can_attempt());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_reset_and_snapshot() {
        let cb = breaker(1, 1, 10_000);
        cb.record_failure();
        assert_eq!(cb.snapshot().state, CircuitState::Open);

        cb.reset();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.name, "test");
    }
}
