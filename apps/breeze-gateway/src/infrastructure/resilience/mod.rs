//! Resilience primitives wrapped around every broker call.
//!
//! - [`RateLimiter`]: per-user fixed window, checked before any I/O
//! - [`RetryPolicy`]: exponential backoff over transient failures
//! - [`CircuitBreaker`]: fails fast while the broker is down

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerState,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::RetryPolicy;
