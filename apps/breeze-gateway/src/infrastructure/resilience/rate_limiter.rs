//! Per-user fixed-window rate limiter.
//!
//! Each user gets a window of `max_calls` calls lasting `window`. The first
//! call after the window resets opens a fresh window with count 1.
//! State is process-local and lost on restart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::domain::session::UserId;
use crate::error::{GatewayError, GatewayResult};
use crate::infrastructure::metrics;

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Calls allowed per window.
    pub max_calls: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_calls: 100,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window limiter keyed by user.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<UserId, RateLimitWindow>>,
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one call for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RateLimitExceeded`] once the window's quota
    /// is used up.
    pub fn check(&self, user_id: &UserId) -> GatewayResult<()> {
        self.check_at(user_id, Instant::now())
    }

    fn check_at(&self, user_id: &UserId, now: Instant) -> GatewayResult<()> {
        let mut windows = self.windows.lock();

        match windows.get_mut(user_id) {
            Some(window) if now < window.reset_at => {
                if window.count >= self.config.max_calls {
                    let retry_after = window.reset_at.saturating_duration_since(now);
                    drop(windows);
                    tracing::warn!(
                        user_id = %user_id,
                        retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                        "Rate limit exceeded"
                    );
                    metrics::record_rate_limited();
                    return Err(GatewayError::RateLimitExceeded { retry_after });
                }
                window.count += 1;
            }
            _ => {
                windows.insert(
                    user_id.clone(),
                    RateLimitWindow {
                        count: 1,
                        reset_at: now + self.config.window,
                    },
                );
            }
        }

        Ok(())
    }

    /// Calls counted in the user's current window (0 if none or expired).
    #[must_use]
    pub fn current_count(&self, user_id: &UserId) -> u32 {
        let now = Instant::now();
        self.windows
            .lock()
            .get(user_id)
            .filter(|w| now < w.reset_at)
            .map_or(0, |w| w.count)
    }

    /// Drop windows whose reset time has passed. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now < w.reset_at);
        before - windows.len()
    }
}
