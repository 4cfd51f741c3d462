//! Gateway Error Taxonomy
//!
//! Every caller-visible failure of the session and gateway layer is a
//! [`GatewayError`]. Each variant maps to a stable [`ErrorKind`] code that
//! the route layer translates into an HTTP status; the human-readable
//! message never echoes raw broker payloads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::session::SessionState;

/// Stable, machine-checkable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No broker session row exists for the user.
    NotConnected,
    /// The session row lacks required credential fields.
    InvalidSession,
    /// Local per-user call quota exhausted.
    RateLimitExceeded,
    /// Broker answered 401 for the session token.
    SessionExpiredRemote,
    /// Broker answered 403.
    AccessDenied,
    /// Broker or local timeout.
    Timeout,
    /// Broker 5xx or transport failure.
    UpstreamUnavailable,
    /// Circuit breaker is open.
    CircuitOpen,
    /// Transition not in the allowed table.
    IllegalTransition,
    /// User is locked out until a future instant.
    SessionLocked,
    /// Request requires an active session.
    SessionNotActive,
    /// Broker rejected the request (non-transient).
    BrokerRejected,
    /// Broker returned a body that is not valid JSON.
    MalformedResponse,
    /// Realtime feed could not be opened.
    StreamUnavailable,
    /// Credential store failure.
    Store,
    /// Invalid configuration.
    Configuration,
}

impl ErrorKind {
    /// Stable code used in API responses and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotConnected => "NOT_CONNECTED",
            Self::InvalidSession => "INVALID_SESSION",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::SessionExpiredRemote => "SESSION_EXPIRED_REMOTE",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::Timeout => "TIMEOUT",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::IllegalTransition => "ILLEGAL_TRANSITION",
            Self::SessionLocked => "SESSION_LOCKED",
            Self::SessionNotActive => "SESSION_NOT_ACTIVE",
            Self::BrokerRejected => "BROKER_REJECTED",
            Self::MalformedResponse => "MALFORMED_RESPONSE",
            Self::StreamUnavailable => "STREAM_UNAVAILABLE",
            Self::Store => "STORE_ERROR",
            Self::Configuration => "CONFIGURATION_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the session FSM, the broker gateway and the stream manager.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// No session row for the user.
    #[error("broker not connected for user {user_id}; connect your broker account first")]
    NotConnected {
        /// User that has no session.
        user_id: String,
    },

    /// Session is missing credential fields.
    #[error("broker session is invalid: {reason}; reconnect your broker account")]
    InvalidSession {
        /// Which field is missing.
        reason: String,
    },

    /// Local rate limit exhausted.
    #[error("rate limit exceeded, retry after {}s", .retry_after.as_secs())]
    RateLimitExceeded {
        /// Time until the current window resets.
        retry_after: Duration,
    },

    /// Broker rejected the session token.
    #[error("broker session expired; reconnect required")]
    SessionExpiredRemote,

    /// Broker answered 403.
    #[error(
        "broker denied access: {message}. Check the IP whitelist, API key/secret, request checksum and session validity"
    )]
    AccessDenied {
        /// Sanitised broker message.
        message: String,
    },

    /// Request timed out locally or the broker answered 408.
    #[error("broker request timed out ({detail}); check network and system clock skew")]
    Timeout {
        /// Where the timeout was observed.
        detail: String,
    },

    /// Broker 5xx or transport failure after retries.
    #[error("broker temporarily unavailable{}: {message}; try again later", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    UpstreamUnavailable {
        /// HTTP status when one was received.
        status: Option<u16>,
        /// Short description.
        message: String,
    },

    /// Circuit breaker rejected the call without touching the network.
    #[error("broker circuit open; calls resume automatically in {}s", .retry_in.as_secs())]
    CircuitOpen {
        /// Remaining cooldown.
        retry_in: Duration,
    },

    /// Transition not in the allowed table.
    #[error("illegal session transition {from} -> {to}")]
    IllegalTransition {
        /// Source state.
        from: SessionState,
        /// Requested target state.
        to: SessionState,
    },

    /// User is locked out.
    #[error("broker session locked until {locked_until}")]
    SessionLocked {
        /// Instant the lock clears.
        locked_until: DateTime<Utc>,
    },

    /// Handler requires an active session.
    #[error("session not active, current state={state}")]
    SessionNotActive {
        /// State observed by the guard.
        state: SessionState,
    },

    /// Broker rejected the request with a business error.
    #[error("broker rejected request (status {status}): {message}")]
    BrokerRejected {
        /// HTTP status or embedded broker status.
        status: u16,
        /// Broker error text.
        message: String,
    },

    /// Broker body was not JSON.
    #[error("malformed broker response: {0}")]
    MalformedResponse(String),

    /// Realtime feed connection failed.
    #[error("realtime stream unavailable: {0}")]
    StreamUnavailable(String),

    /// Credential store failure.
    #[error("credential store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Stable kind for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::InvalidSession { .. } => ErrorKind::InvalidSession,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::SessionExpiredRemote => ErrorKind::SessionExpiredRemote,
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Self::SessionLocked { .. } => ErrorKind::SessionLocked,
            Self::SessionNotActive { .. } => ErrorKind::SessionNotActive,
            Self::BrokerRejected { .. } => ErrorKind::BrokerRejected,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Self::StreamUnavailable(_) => ErrorKind::StreamUnavailable,
            Self::Store(_) => ErrorKind::Store,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the retry policy may re-run the call.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::UpstreamUnavailable { .. })
    }

    /// Whether the outcome counts against the circuit breaker.
    ///
    /// Business errors (4xx) prove the broker is reachable and do not trip it.
    #[must_use]
    pub const fn counts_as_failure(&self) -> bool {
        self.is_transient()
    }

    /// Convenience constructor for [`GatewayError::NotConnected`].
    #[must_use]
    pub fn not_connected(user_id: impl std::fmt::Display) -> Self {
        Self::NotConnected {
            user_id: user_id.to_string(),
        }
    }

    /// Convenience constructor for [`GatewayError::InvalidSession`].
    #[must_use]
    pub fn invalid_session(reason: impl Into<String>) -> Self {
        Self::InvalidSession {
            reason: reason.into(),
        }
    }
}

/// Result alias used across the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(
            GatewayError::Timeout {
                detail: "local".to_string()
            }
            .is_transient()
        );
        assert!(
            GatewayError::UpstreamUnavailable {
                status: Some(503),
                message: "down".to_string()
            }
            .is_transient()
        );
        assert!(!GatewayError::SessionExpiredRemote.is_transient());
        assert!(
            !GatewayError::BrokerRejected {
                status: 400,
                message: "bad".to_string()
            }
            .is_transient()
        );
        assert!(
            !GatewayError::CircuitOpen {
                retry_in: Duration::from_secs(1)
            }
            .counts_as_failure()
        );
    }

    #[test]
    fn kinds_have_stable_codes() {
        assert_eq!(
            GatewayError::not_connected("u1").kind().as_str(),
            "NOT_CONNECTED"
        );
        assert_eq!(
            GatewayError::RateLimitExceeded {
                retry_after: Duration::from_secs(3)
            }
            .kind()
            .to_string(),
            "RATE_LIMIT_EXCEEDED"
        );
    }

    #[test]
    fn messages_are_human_readable() {
        let err = GatewayError::SessionNotActive {
            state: SessionState::CredentialsSaved,
        };
        assert_eq!(
            err.to_string(),
            "session not active, current state=CREDENTIALS_SAVED"
        );

        let err = GatewayError::UpstreamUnavailable {
            status: Some(502),
            message: "bad gateway".to_string(),
        };
        assert!(err.to_string().contains("HTTP 502"));
    }
}
