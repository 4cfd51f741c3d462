//! Circuit breaker for the broker HTTP API.
//!
//! Fails fast while the broker is unavailable instead of stacking retries
//! on a dead dependency.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN (consecutive failures >= threshold)
//! OPEN → HALF_OPEN (cooldown elapsed; next call is the trial)
//! HALF_OPEN → CLOSED (trial succeeds, failures reset to 0)
//! HALF_OPEN → OPEN (trial fails, cooldown clock restarts)
//! ```
//!
//! # Configuration
//!
//! - `failure_threshold`: Consecutive failures that trip the breaker (default: 5)
//! - `cooldown`: Time to stay open before a trial call (default: 60s)
//!
//! # Example
//!
//! ```rust,ignore
//! use breeze_gateway::infrastructure::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("breeze", CircuitBreakerConfig::default());
//! let body = breaker.execute(|| async { call_broker().await }).await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::infrastructure::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Circuit is closed, calls flow normally.
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Cooldown elapsed, one trial call is permitted.
    HalfOpen,
}

impl CircuitBreakerState {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Duration to stay in `OPEN` state.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitBreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

/// Circuit breaker for external service calls.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Service name for logging and metrics labels.
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                failures: 0,
                last_failure: None,
                opened_at: None,
                trial_started: None,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    /// Get the service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state, applying the time-based `OPEN -> HALF_OPEN` move.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        let mut inner = self.inner.lock();
        self.check_cooldown(&mut inner);
        inner.state
    }

    /// Consecutive failures recorded since the last success.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Run `call` through the breaker.
    ///
    /// Rejected calls never invoke `call`. Only errors for which
    /// [`GatewayError::counts_as_failure`] holds count against the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CircuitOpen`] while open, otherwise the error
    /// produced by `call`.
    pub async fn execute<T, F, Fut>(&self, call: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.acquire()?;

        match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) if err.counts_as_failure() => {
                self.record_failure();
                Err(err)
            }
            Err(err) => {
                self.record_success();
                Err(err)
            }
        }
    }

    /// Check whether a call may proceed, marking a half-open trial if so.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CircuitOpen`] with the remaining cooldown.
    pub fn acquire(&self) -> GatewayResult<()> {
        let mut inner = self.inner.lock();
        self.check_cooldown(&mut inner);

        match inner.state {
            CircuitBreakerState::Closed => Ok(()),
            CircuitBreakerState::HalfOpen => {
                // One trial at a time; a trial abandoned mid-flight frees the
                // slot after another cooldown.
                let busy = inner
                    .trial_started
                    .is_some_and(|started| started.elapsed() < self.config.cooldown);
                if busy {
                    drop(inner);
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    return Err(GatewayError::CircuitOpen {
                        retry_in: Duration::ZERO,
                    });
                }
                inner.trial_started = Some(Instant::now());
                Ok(())
            }
            CircuitBreakerState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                drop(inner);
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::CircuitOpen {
                    retry_in: self.config.cooldown.saturating_sub(elapsed),
                })
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        inner.failures = 0;
        inner.trial_started = None;
        if inner.state != CircuitBreakerState::Closed {
            self.transition(&mut inner, CircuitBreakerState::Closed);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitBreakerState::Closed if inner.failures >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitBreakerState::Open);
            }
            CircuitBreakerState::HalfOpen => {
                self.transition(&mut inner, CircuitBreakerState::Open);
            }
            CircuitBreakerState::Closed | CircuitBreakerState::Open => {}
        }
    }

    fn check_cooldown(&self, inner: &mut Inner) {
        if inner.state == CircuitBreakerState::Open
            && inner
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.config.cooldown)
        {
            self.transition(inner, CircuitBreakerState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitBreakerState) {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitBreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.trial_started = None;
                tracing::warn!(
                    name = %self.name,
                    from = %from,
                    to = %to,
                    failures = inner.failures,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit breaker opened"
                );
            }
            CircuitBreakerState::HalfOpen => {
                inner.trial_started = None;
                tracing::info!(name = %self.name, from = %from, to = %to, "Circuit breaker testing");
            }
            CircuitBreakerState::Closed => {
                inner.opened_at = None;
                inner.failures = 0;
                tracing::info!(name = %self.name, from = %from, to = %to, "Circuit breaker closed");
            }
        }

        metrics::set_circuit_state(&self.name, to);
    }

    /// Get metrics for this circuit breaker.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state();
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state,
            failures: inner.failures,
            last_failure_age: inner.last_failure.map(|t| t.elapsed()),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    /// Force the circuit breaker to open (for testing or emergency).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Open);
    }

    /// Force the circuit breaker to close (for testing or recovery).
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Closed);
    }
}

/// Snapshot of a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// Service name.
    pub name: String,
    /// Current state.
    pub state: CircuitBreakerState,
    /// Consecutive failures.
    pub failures: u32,
    /// Time since the last failure.
    pub last_failure_age: Option<Duration>,
    /// Calls that ran to completion.
    pub total_calls: u64,
    /// Calls that counted as failures.
    pub total_failures: u64,
    /// Calls rejected without running.
    pub rejected_calls: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn config(threshold: u32, cooldown: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown,
        }
    }

    fn upstream() -> GatewayError {
        GatewayError::UpstreamUnavailable {
            status: Some(503),
            message: "down".to_string(),
        }
    }

    #[test]
    fn default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(60));
    }

    #[test]
    fn initial_state_is_closed() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert!(breaker.acquire().is_ok());
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", config(3, Duration::from_secs(60)));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        assert!(matches!(
            breaker.acquire(),
            Err(GatewayError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new("test", config(3, Duration::from_secs(60)));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert_eq!(breaker.failures(), 2);
    }

    #[tokio::test]
    async fn open_circuit_does_not_invoke_call() {
        let breaker = CircuitBreaker::new("test", config(1, Duration::from_secs(60)));
        breaker.record_failure();

        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(GatewayError::CircuitOpen { retry_in }) if retry_in > Duration::from_secs(50)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn open_to_half_open_transition() {
        let breaker = CircuitBreaker::new("test", config(2, Duration::from_millis(10)));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
        assert!(breaker.acquire().is_ok());
    }

    #[test]
    fn half_open_allows_a_single_trial() {
        let breaker = CircuitBreaker::new("test", config(1, Duration::from_millis(10)));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(breaker.acquire().is_ok());
        assert!(matches!(
            breaker.acquire(),
            Err(GatewayError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn half_open_to_closed_on_success() {
        let breaker = CircuitBreaker::new("test", config(2, Duration::from_millis(1)));
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.acquire().is_ok());

        breaker.record_success();

        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn half_open_to_open_on_failure() {
        let breaker = CircuitBreaker::new("test", config(2, Duration::from_millis(30)));
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.acquire().is_ok());

        breaker.record_failure();

        // Cooldown restarted, so the breaker stays open for another window.
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn business_errors_do_not_trip_the_breaker() {
        let breaker = CircuitBreaker::new("test", config(2, Duration::from_secs(60)));

        for _ in 0..5 {
            let result: GatewayResult<()> = breaker
                .execute(|| async {
                    Err(GatewayError::BrokerRejected {
                        status: 400,
                        message: "bad order".to_string(),
                    })
                })
                .await;
            assert!(matches!(result, Err(GatewayError::BrokerRejected { .. })));
        }

        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn transient_errors_trip_the_breaker() {
        let breaker = CircuitBreaker::new("test", config(2, Duration::from_secs(60)));

        for _ in 0..2 {
            let result: GatewayResult<()> = breaker.execute(|| async { Err(upstream()) }).await;
            assert!(result.is_err());
        }

        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        let metrics = breaker.metrics();
        assert_eq!(metrics.total_failures, 2);
        assert!(metrics.last_failure_age.is_some());
    }

    #[test]
    fn force_open_and_close() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        breaker.force_close();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }
}
