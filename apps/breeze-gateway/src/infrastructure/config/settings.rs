//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.
//! Malformed numeric values fall back to their defaults.

use std::time::Duration;

use crate::application::services::session_fsm::SessionFsmConfig;
use crate::application::services::stream_manager::StreamManagerConfig;
use crate::infrastructure::breeze::{BreezeHttpConfig, HeartbeatConfig, ReconnectConfig};
use crate::infrastructure::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryPolicy};

/// Broker endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// REST base URL.
    pub api_base_url: String,
    /// Realtime feed URL.
    pub stream_url: String,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.icicidirect.com/breezeapi/api/v1".to_string(),
            stream_url: "wss://livestream.icicidirect.com/".to_string(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Session cache entry lifetime.
    pub cache_ttl: Duration,
    /// Lock length after repeated auth failures.
    pub lock_duration: Duration,
    /// Consecutive auth failures that lock the session.
    pub max_auth_failures: u32,
    /// Lifetime of a fresh session token (`None` = never expires).
    pub session_lifetime: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            lock_duration: Duration::from_secs(30 * 60),
            max_auth_failures: 3,
            session_lifetime: Some(Duration::from_secs(24 * 3600)),
        }
    }
}

/// Realtime stream settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSettings {
    /// Heartbeat interval and timeout.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Resend the subscription set after a reconnect.
    pub replay_subscriptions: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            replay_subscriptions: true,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// HTTP port for the API, health and metrics.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8080 }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Broker endpoints.
    pub broker: BrokerSettings,
    /// Per-user rate limit.
    pub rate_limit: RateLimiterConfig,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Session lifecycle.
    pub session: SessionSettings,
    /// Realtime streams.
    pub stream: StreamSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required URL is empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a required URL is empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let broker = BrokerSettings {
            api_base_url: env.string("BREEZE_API_BASE_URL", &defaults.broker.api_base_url)?,
            stream_url: env.string("BREEZE_STREAM_URL", &defaults.broker.stream_url)?,
            http_timeout: env.duration_secs("BREEZE_HTTP_TIMEOUT_SECS", defaults.broker.http_timeout),
        };

        let rate_limit = RateLimiterConfig {
            max_calls: env.u32("BREEZE_RATE_LIMIT_MAX_CALLS", defaults.rate_limit.max_calls),
            window: env.duration_secs("BREEZE_RATE_LIMIT_WINDOW_SECS", defaults.rate_limit.window),
        };

        let retry = RetryPolicy {
            max_attempts: env
                .u32("BREEZE_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)
                .max(1),
            base_delay: env.duration_millis("BREEZE_RETRY_BASE_DELAY_MS", defaults.retry.base_delay),
            ..defaults.retry
        };

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: env
                .u32(
                    "BREEZE_CIRCUIT_FAILURE_THRESHOLD",
                    defaults.circuit_breaker.failure_threshold,
                )
                .max(1),
            cooldown: env.duration_secs("BREEZE_CIRCUIT_COOLDOWN_SECS", defaults.circuit_breaker.cooldown),
        };

        let lifetime_hours = env.u64("BREEZE_SESSION_LIFETIME_HOURS", 24);
        let session = SessionSettings {
            cache_ttl: env.duration_secs("BREEZE_SESSION_CACHE_TTL_SECS", defaults.session.cache_ttl),
            lock_duration: Duration::from_secs(env.u64("BREEZE_SESSION_LOCK_MINUTES", 30) * 60),
            max_auth_failures: env
                .u32("BREEZE_MAX_AUTH_FAILURES", defaults.session.max_auth_failures)
                .max(1),
            session_lifetime: (lifetime_hours > 0).then(|| Duration::from_secs(lifetime_hours * 3600)),
        };

        let stream = StreamSettings {
            heartbeat: HeartbeatConfig::new(
                env.duration_secs(
                    "BREEZE_HEARTBEAT_INTERVAL_SECS",
                    defaults.stream.heartbeat.ping_interval,
                ),
                env.duration_secs(
                    "BREEZE_HEARTBEAT_TIMEOUT_SECS",
                    defaults.stream.heartbeat.pong_timeout,
                ),
            ),
            reconnect: ReconnectConfig {
                initial_delay: env.duration_millis(
                    "BREEZE_RECONNECT_BASE_DELAY_MS",
                    defaults.stream.reconnect.initial_delay,
                ),
                max_attempts: env.u32(
                    "BREEZE_RECONNECT_MAX_ATTEMPTS",
                    defaults.stream.reconnect.max_attempts,
                ),
                ..defaults.stream.reconnect
            },
            replay_subscriptions: env.bool(
                "BREEZE_REPLAY_SUBSCRIPTIONS",
                defaults.stream.replay_subscriptions,
            ),
        };

        let server = ServerSettings {
            http_port: env.u16("BREEZE_GATEWAY_HTTP_PORT", defaults.server.http_port),
        };

        Ok(Self {
            server,
            broker,
            rate_limit,
            retry,
            circuit_breaker,
            session,
            stream,
        })
    }

    /// HTTP transport settings.
    #[must_use]
    pub fn http_config(&self) -> BreezeHttpConfig {
        BreezeHttpConfig {
            base_url: self.broker.api_base_url.clone(),
            timeout: self.broker.http_timeout,
        }
    }

    /// Session FSM settings.
    #[must_use]
    pub const fn fsm_config(&self) -> SessionFsmConfig {
        SessionFsmConfig {
            lock_duration: self.session.lock_duration,
            max_auth_failures: self.session.max_auth_failures,
        }
    }

    /// Stream manager settings.
    #[must_use]
    pub fn stream_config(&self) -> StreamManagerConfig {
        StreamManagerConfig {
            stream_url: self.broker.stream_url.clone(),
            heartbeat: self.stream.heartbeat,
            reconnect: self.stream.reconnect,
            replay_subscriptions: self.stream.replay_subscriptions,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            Some(value) if value.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(value) => Ok(value.trim().to_string()),
            None => Ok(default.to_string()),
        }
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        (self.0)(key).and_then(|v| v.trim().parse().ok())
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parsed(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parsed(key).unwrap_or(default)
    }

    fn u64(&self, key: &str, default: u64) -> u64 {
        self.parsed(key).unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        (self.0)(key)
            .map(|v| v.trim().to_ascii_lowercase())
            .and_then(|v| match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            })
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key).map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key).map_or(default, Duration::from_millis)
    }
}
