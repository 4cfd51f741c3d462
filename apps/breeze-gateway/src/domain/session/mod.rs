//! Broker Session Types
//!
//! Domain types for a user's connection to the external broker and the
//! finite-state machine that governs it.
//!
//! # State Derivation
//!
//! [`SessionState`] is never stored. It is recomputed from the persisted
//! [`BrokerSession`] fields by [`derive_state`], in this precedence:
//!
//! ```text
//! lockedUntil in the future  -> LOCKED
//! no session row             -> NONE
//! no sessionToken            -> CREDENTIALS_SAVED
//! expiresAt in the past      -> SESSION_EXPIRED
//! otherwise                  -> SESSION_ACTIVE
//! ```
//!
//! # Transition Table
//!
//! ```text
//! NONE              -> CREDENTIALS_SAVED
//! CREDENTIALS_SAVED -> AUTH_IN_PROGRESS
//! AUTH_IN_PROGRESS  -> SESSION_ACTIVE | LOCKED
//! SESSION_ACTIVE    -> SESSION_EXPIRED
//! SESSION_EXPIRED   -> AUTH_IN_PROGRESS | LOCKED
//! LOCKED            -> (none; clears by time only)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque identifier of an application user (owning key of a session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a new user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Broker application key/secret pair supplied by the user.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    /// Broker application key.
    pub api_key: String,
    /// Broker application secret.
    pub api_secret: String,
}

impl BrokerCredentials {
    /// Create a credential pair.
    #[must_use]
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a user's broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No credentials stored.
    None,
    /// API key/secret stored, no session token.
    CredentialsSaved,
    /// Login handshake started.
    AuthInProgress,
    /// Session token valid.
    SessionActive,
    /// Session token expired or rejected by the broker.
    SessionExpired,
    /// Operations blocked until `locked_until`.
    Locked,
}

impl SessionState {
    /// Stable name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::CredentialsSaved => "CREDENTIALS_SAVED",
            Self::AuthInProgress => "AUTH_IN_PROGRESS",
            Self::SessionActive => "SESSION_ACTIVE",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Locked => "LOCKED",
        }
    }

    /// All states, in declaration order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::None,
            Self::CredentialsSaved,
            Self::AuthInProgress,
            Self::SessionActive,
            Self::SessionExpired,
            Self::Locked,
        ]
    }

    /// Whether `self -> to` appears in the transition table.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::None, Self::CredentialsSaved)
                | (Self::CredentialsSaved, Self::AuthInProgress)
                | (Self::AuthInProgress, Self::SessionActive | Self::Locked)
                | (Self::SessionActive, Self::SessionExpired)
                | (Self::SessionExpired, Self::AuthInProgress | Self::Locked)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Broker Session
// =============================================================================

/// Persisted broker connection for one user.
///
/// `session_token` is only set while the session is active; every path that
/// leaves the active state clears it.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerSession {
    /// Owning user.
    pub user_id: UserId,
    /// Broker application key.
    pub api_key: String,
    /// Broker application secret (checksum signing).
    pub api_secret: String,
    /// Token issued by the broker after the login handshake.
    pub session_token: Option<String>,
    /// Token expiry; `None` means it never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Lockout end; while in the future every operation is blocked.
    pub locked_until: Option<DateTime<Utc>>,
    /// When the most recent login handshake started.
    pub auth_started_at: Option<DateTime<Utc>>,
    /// Consecutive failed handshakes since the last success.
    pub failed_auth_attempts: u32,
}

impl BrokerSession {
    /// Create a session row holding only credentials.
    #[must_use]
    pub fn new(user_id: UserId, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            user_id,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            session_token: None,
            expires_at: None,
            locked_until: None,
            auth_started_at: None,
            failed_auth_attempts: 0,
        }
    }

    /// Attach an active session token.
    #[must_use]
    pub fn with_token(
        mut self,
        session_token: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.session_token = Some(session_token.into());
        self.expires_at = expires_at;
        self
    }

    /// Check whether the lock is still in force at `now`.
    #[must_use]
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Drop the token and its expiry.
    pub fn clear_token(&mut self) {
        self.session_token = None;
        self.expires_at = None;
    }

    /// Build a credentials-only row from a key/secret pair.
    #[must_use]
    pub fn from_credentials(user_id: UserId, credentials: BrokerCredentials) -> Self {
        Self::new(user_id, credentials.api_key, credentials.api_secret)
    }

    /// Check that both credential fields are present.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("user_id", &self.user_id)
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("locked_until", &self.locked_until)
            .field("auth_started_at", &self.auth_started_at)
            .field("failed_auth_attempts", &self.failed_auth_attempts)
            .finish()
    }
}

/// Derive the session state from persisted fields at `now`.
///
/// Pure: identical inputs always yield the identical state.
#[must_use]
pub fn derive_state(session: Option<&BrokerSession>, now: DateTime<Utc>) -> SessionState {
    let Some(session) = session else {
        return SessionState::None;
    };

    if session.is_locked_at(now) {
        return SessionState::Locked;
    }

    if session.session_token.is_none() {
        return SessionState::CredentialsSaved;
    }

    match session.expires_at {
        Some(expires_at) if expires_at <= now => SessionState::SessionExpired,
        _ => SessionState::SessionActive,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use test_case::test_case;

    use super::*;

    fn session() -> BrokerSession {
        BrokerSession::new(UserId::new("user-1"), "key", "secret")
    }

    #[test]
    fn no_row_is_none() {
        assert_eq!(derive_state(None, Utc::now()), SessionState::None);
    }

    #[test]
    fn credentials_only_is_saved() {
        assert_eq!(
            derive_state(Some(&session()), Utc::now()),
            SessionState::CredentialsSaved
        );
    }

    #[test]
    fn token_without_expiry_is_active() {
        let s = session().with_token("tok", None);
        assert_eq!(derive_state(Some(&s), Utc::now()), SessionState::SessionActive);
    }

    #[test]
    fn past_expiry_is_expired() {
        let now = Utc::now();
        let s = session().with_token("tok", Some(now - Duration::minutes(1)));
        assert_eq!(derive_state(Some(&s), now), SessionState::SessionExpired);

        let s = session().with_token("tok", Some(now + Duration::minutes(1)));
        assert_eq!(derive_state(Some(&s), now), SessionState::SessionActive);
    }

    #[test]
    fn lock_takes_precedence_over_everything() {
        let now = Utc::now();
        let mut s = session().with_token("tok", Some(now + Duration::hours(1)));
        s.locked_until = Some(now + Duration::minutes(5));
        assert_eq!(derive_state(Some(&s), now), SessionState::Locked);

        s.clear_token();
        assert_eq!(derive_state(Some(&s), now), SessionState::Locked);
    }

    #[test]
    fn elapsed_lock_falls_through_to_field_values() {
        let now = Utc::now();
        let mut s = session();
        s.locked_until = Some(now - Duration::seconds(1));
        assert_eq!(derive_state(Some(&s), now), SessionState::CredentialsSaved);
    }

    #[test]
    fn derivation_is_repeatable() {
        let now = Utc::now();
        let s = session().with_token("tok", Some(now + Duration::hours(1)));
        assert_eq!(derive_state(Some(&s), now), derive_state(Some(&s), now));
    }

    #[test_case(SessionState::None, SessionState::CredentialsSaved ; "none to saved")]
    #[test_case(SessionState::CredentialsSaved, SessionState::AuthInProgress ; "saved to auth")]
    #[test_case(SessionState::AuthInProgress, SessionState::SessionActive ; "auth to active")]
    #[test_case(SessionState::AuthInProgress, SessionState::Locked ; "auth to locked")]
    #[test_case(SessionState::SessionActive, SessionState::SessionExpired ; "active to expired")]
    #[test_case(SessionState::SessionExpired, SessionState::AuthInProgress ; "expired to auth")]
    #[test_case(SessionState::SessionExpired, SessionState::Locked ; "expired to locked")]
    fn allowed_transitions(from: SessionState, to: SessionState) {
        assert!(from.can_transition_to(to));
    }

    #[test]
    fn exactly_seven_transitions_allowed() {
        let allowed = SessionState::all()
            .iter()
            .flat_map(|from| SessionState::all().iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .count();
        assert_eq!(allowed, 7);
    }

    #[test_case(SessionState::None, SessionState::SessionActive ; "none to active")]
    #[test_case(SessionState::Locked, SessionState::CredentialsSaved ; "locked to saved")]
    #[test_case(SessionState::Locked, SessionState::AuthInProgress ; "locked to auth")]
    #[test_case(SessionState::SessionActive, SessionState::SessionActive ; "active self loop")]
    #[test_case(SessionState::SessionActive, SessionState::Locked ; "active to locked")]
    fn rejected_transitions(from: SessionState, to: SessionState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn debug_redacts_secrets() {
        let s = session().with_token("tok-123", None);
        let debug = format!("{s:?}");
        assert!(!debug.contains("secret"));
        assert!(!debug.contains("tok-123"));
        assert!(debug.contains("[REDACTED]"));
    }
}
