//! Retry policy with exponential backoff for broker API calls.
//!
//! Transient failures are re-run with exponentially growing delays;
//! everything else propagates on the first attempt.
//!
//! # Retryable Errors
//!
//! | Retryable | Non-Retryable |
//! |-----------|---------------|
//! | HTTP 5xx (`UpstreamUnavailable`) | HTTP 400/422 (`BrokerRejected`) |
//! | HTTP 408 / local timeout (`Timeout`) | HTTP 401 (`SessionExpiredRemote`) |
//! | Connection reset / refused | HTTP 403 (`AccessDenied`) |
//! | DNS failures | HTTP 429 (`RateLimitExceeded`) |
//!
//! # Example
//!
//! ```rust,ignore
//! use breeze_gateway::infrastructure::resilience::RetryPolicy;
//!
//! let policy = RetryPolicy::default();
//! let body = policy.run("funds", || async { call_broker().await }).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::GatewayResult;
use crate::infrastructure::metrics;

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total invocations including the first one (default: 3).
    pub max_attempts: u32,
    /// Delay before the first retry (default: 1s).
    pub base_delay: Duration,
    /// Upper bound on any single delay (default: 30s).
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the base, in `[0, 1)` (default: 0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt cap and base delay.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Set the jitter factor (clamped to `[0, 1)`).
    #[must_use]
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 0.99);
        self
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    ///
    /// `base * 2^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt`, with jitter applied.
    ///
    /// Jitter only ever adds, and stays below one base step, so successive
    /// delays remain strictly increasing until the cap.
    #[must_use]
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if self.jitter_factor <= 0.0 {
            return base;
        }

        let mut rng = rand::rng();
        let extra = rng.random_range(0.0..self.jitter_factor);
        base.mul_f64(1.0 + extra).min(self.max_delay)
    }

    /// Run `call`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient error
    /// once `max_attempts` invocations have failed.
    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.jittered_delay_for(attempt);
                    attempt += 1;

                    tracing::warn!(
                        endpoint = label,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Transient broker failure, retrying"
                    );
                    metrics::record_retry();

                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::GatewayError;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert!(policy.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn exponential_backoff_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn max_delay_cap() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn jittered_delays_strictly_increase() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).with_jitter(0.5);
        for _ in 0..50 {
            let delays: Vec<_> = (0..4).map(|a| policy.jittered_delay_for(a)).collect();
            assert!(delays.windows(2).all(|w| w[0] < w[1]), "{delays:?}");
        }
    }

    #[tokio::test]
    async fn non_transient_error_runs_once() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = fast(3)
            .run("orders", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::BrokerRejected {
                    status: 400,
                    message: "bad request".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(GatewayError::BrokerRejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_runs_up_to_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = fast(3)
            .run("funds", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::UpstreamUnavailable {
                    status: None,
                    message: "connection reset".to_string(),
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::UpstreamUnavailable { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("funds", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(GatewayError::Timeout {
                        detail: "local".to_string(),
                    })
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.ok(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..fast(1)
        };
        let calls = AtomicU32::new(0);
        let _: GatewayResult<()> = policy
            .run("funds", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Timeout {
                    detail: "local".to_string(),
                })
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
