//! Session FSM Service
//!
//! Reads the derived session state, applies transitions with their
//! persistence side effects, and guards broker-touching handlers.
//!
//! State is never stored: every read derives it from the session row via
//! [`derive_state`]. A transition therefore only ever writes row fields.
//!
//! | Entering            | Side effect                                        |
//! |---------------------|----------------------------------------------------|
//! | `CREDENTIALS_SAVED` | store key/secret (new row)                         |
//! | `AUTH_IN_PROGRESS`  | stamp `auth_started_at`                            |
//! | `SESSION_ACTIVE`    | store token + expiry, reset failure counter, unlock |
//! | `SESSION_EXPIRED`   | clear token + expiry                               |
//! | `LOCKED`            | `locked_until = now + lock`, clear token, reset counter |
//!
//! A lock consumes the failure count, so once it lapses the user gets the
//! full allowance of handshake attempts again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::application::ports::{SessionLifecycle, TransitionOptions};
use crate::application::services::session_repository::SessionRepository;
use crate::domain::session::{BrokerSession, SessionState, UserId, derive_state};
use crate::error::{GatewayError, GatewayResult};
use crate::infrastructure::metrics;

/// Default lockout length.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30 * 60);

/// Default number of consecutive failed handshakes before locking.
pub const DEFAULT_MAX_AUTH_FAILURES: u32 = 3;

/// Session FSM configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFsmConfig {
    /// Lock length applied on entering `LOCKED` (default: 30 minutes).
    pub lock_duration: Duration,
    /// Failed handshakes that trigger a lock (default: 3).
    pub max_auth_failures: u32,
}

impl Default for SessionFsmConfig {
    fn default() -> Self {
        Self {
            lock_duration: DEFAULT_LOCK_DURATION,
            max_auth_failures: DEFAULT_MAX_AUTH_FAILURES,
        }
    }
}

/// `now + duration`, saturating at the latest representable instant.
#[must_use]
pub fn deadline_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Session lifecycle service.
#[derive(Debug, Clone)]
pub struct SessionFsm {
    repo: SessionRepository,
    config: SessionFsmConfig,
}

impl SessionFsm {
    /// Create a new FSM over the given repository.
    #[must_use]
    pub const fn new(repo: SessionRepository, config: SessionFsmConfig) -> Self {
        Self { repo, config }
    }

    /// Shared repository.
    #[must_use]
    pub const fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> SessionFsmConfig {
        self.config
    }

    async fn load(&self, user_id: &UserId) -> GatewayResult<(Option<BrokerSession>, SessionState)> {
        let session = self.repo.resolve(user_id).await?;
        let state = derive_state(session.as_ref(), Utc::now());
        Ok((session, state))
    }

    async fn require_row(&self, user_id: &UserId) -> GatewayResult<BrokerSession> {
        self.repo
            .resolve(user_id)
            .await?
            .ok_or_else(|| GatewayError::not_connected(user_id))
    }

    /// Count a failed login handshake, locking once the limit is reached.
    ///
    /// `from` is the state the handshake ran in (`AUTH_IN_PROGRESS` or
    /// `SESSION_EXPIRED`). Returns `true` when the session was locked.
    ///
    /// # Errors
    ///
    /// `NotConnected` if there is no row, or a store failure.
    pub async fn record_auth_failure(
        &self,
        user_id: &UserId,
        from: SessionState,
    ) -> GatewayResult<bool> {
        let mut session = self.require_row(user_id).await?;
        session.failed_auth_attempts = session.failed_auth_attempts.saturating_add(1);
        let attempts = session.failed_auth_attempts;

        if attempts >= self.config.max_auth_failures && from.can_transition_to(SessionState::Locked) {
            let locked_until = deadline_after(Utc::now(), self.config.lock_duration);
            session.locked_until = Some(locked_until);
            session.failed_auth_attempts = 0;
            session.clear_token();
            self.repo.save(&session).await?;

            metrics::record_session_transition(from, SessionState::Locked);
            tracing::warn!(
                user_id = %user_id,
                attempts,
                locked_until = %locked_until,
                "Broker login failed repeatedly, session locked"
            );
            return Ok(true);
        }

        self.repo.save(&session).await?;
        tracing::info!(
            user_id = %user_id,
            attempts,
            max_attempts = self.config.max_auth_failures,
            "Broker login failed"
        );
        Ok(false)
    }

    /// Apply the entry side effect of `to` to the stored row.
    async fn apply(
        &self,
        user_id: &UserId,
        to: SessionState,
        options: TransitionOptions,
    ) -> GatewayResult<BrokerSession> {
        let now = Utc::now();

        match to {
            SessionState::CredentialsSaved => {
                let credentials = options
                    .credentials
                    .ok_or_else(|| GatewayError::invalid_session("credentials required"))?;
                let session = BrokerSession::from_credentials(user_id.clone(), credentials);
                if !session.has_credentials() {
                    return Err(GatewayError::invalid_session("api key and secret required"));
                }
                Ok(session)
            }
            SessionState::AuthInProgress => {
                let mut session = self.require_row(user_id).await?;
                session.auth_started_at = Some(now);
                Ok(session)
            }
            SessionState::SessionActive => {
                let token = options
                    .session_token
                    .filter(|token| !token.is_empty())
                    .ok_or_else(|| GatewayError::invalid_session("session token required"))?;
                let mut session = self.require_row(user_id).await?;
                session.session_token = Some(token);
                session.expires_at = options.expires_at;
                session.failed_auth_attempts = 0;
                session.locked_until = None;
                Ok(session)
            }
            SessionState::SessionExpired => {
                let mut session = self.require_row(user_id).await?;
                session.clear_token();
                Ok(session)
            }
            SessionState::Locked => {
                let mut session = self.require_row(user_id).await?;
                let lock = options.lock_duration.unwrap_or(self.config.lock_duration);
                session.locked_until = Some(deadline_after(now, lock));
                session.failed_auth_attempts = 0;
                session.clear_token();
                Ok(session)
            }
            // Nothing transitions into NONE; the table check rejects it first.
            SessionState::None => Err(GatewayError::IllegalTransition {
                from: SessionState::None,
                to,
            }),
        }
    }
}

#[async_trait]
impl SessionLifecycle for SessionFsm {
    async fn get_state(&self, user_id: &UserId) -> GatewayResult<SessionState> {
        self.load(user_id).await.map(|(_, state)| state)
    }

    async fn transition(
        &self,
        user_id: &UserId,
        from: SessionState,
        to: SessionState,
        options: TransitionOptions,
    ) -> GatewayResult<()> {
        // 1. Check the transition table
        if !from.can_transition_to(to) {
            tracing::error!(user_id = %user_id, from = %from, to = %to, "Illegal session transition");
            return Err(GatewayError::IllegalTransition { from, to });
        }

        // 2. Apply the entry side effect and persist it
        let session = self.apply(user_id, to, options).await?;
        self.repo.save(&session).await?;

        // 3. Record
        metrics::record_session_transition(from, to);
        tracing::info!(user_id = %user_id, from = %from, to = %to, "Session transition");

        Ok(())
    }

    async fn require_active(
        &self,
        user_id: &UserId,
        allow_expired: bool,
    ) -> GatewayResult<SessionState> {
        let (session, state) = self.load(user_id).await?;

        match state {
            SessionState::Locked => Err(GatewayError::SessionLocked {
                locked_until: session
                    .and_then(|s| s.locked_until)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            }),
            SessionState::SessionActive => Ok(state),
            SessionState::SessionExpired if allow_expired => Ok(state),
            _ => {
                tracing::debug!(user_id = %user_id, state = %state, "Rejected by session guard");
                Err(GatewayError::SessionNotActive { state })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockall::predicate::always;
    use test_case::test_case;

    use super::*;
    use crate::application::ports::MockCredentialStore;
    use crate::domain::session::BrokerCredentials;
    use crate::infrastructure::cache::SessionCache;
    use crate::infrastructure::persistence::InMemoryCredentialStore;

    fn fsm_with(store: Arc<InMemoryCredentialStore>) -> SessionFsm {
        let repo = SessionRepository::new(store, Arc::new(SessionCache::default()));
        SessionFsm::new(repo, SessionFsmConfig::default())
    }

    fn user() -> UserId {
        UserId::new("user-1")
    }

    fn saved() -> BrokerSession {
        BrokerSession::new(user(), "key", "secret")
    }

    #[tokio::test]
    async fn missing_row_is_none() {
        let fsm = fsm_with(Arc::new(InMemoryCredentialStore::new()));
        assert_eq!(fsm.get_state(&user()).await.unwrap(), SessionState::None);
    }

    #[tokio::test]
    async fn get_state_is_repeatable() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.add(saved().with_token("tok", None));
        let fsm = fsm_with(store);

        let first = fsm.get_state(&user()).await.unwrap();
        let second = fsm.get_state(&user()).await.unwrap();
        assert_eq!(first, SessionState::SessionActive);
        assert_eq!(first, second);
    }

    #[test_case(SessionState::None, SessionState::SessionActive)]
    #[test_case(SessionState::CredentialsSaved, SessionState::SessionActive)]
    #[test_case(SessionState::Locked, SessionState::AuthInProgress)]
    #[test_case(SessionState::SessionActive, SessionState::Locked)]
    #[tokio::test]
    async fn illegal_transition_touches_nothing(from: SessionState, to: SessionState) {
        // No expectations: any store call would panic.
        let store = MockCredentialStore::new();
        let repo = SessionRepository::new(Arc::new(store), Arc::new(SessionCache::default()));
        let fsm = SessionFsm::new(repo, SessionFsmConfig::default());

        let result = fsm
            .transition(&user(), from, to, TransitionOptions::session("tok", None))
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::IllegalTransition { from: f, to: t }) if f == from && t == to
        ));
    }

    #[tokio::test]
    async fn full_login_walk() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let fsm = fsm_with(store.clone());
        let u = user();

        fsm.transition(
            &u,
            SessionState::None,
            SessionState::CredentialsSaved,
            TransitionOptions::credentials(BrokerCredentials::new("key", "secret")),
        )
        .await
        .unwrap();
        assert_eq!(fsm.get_state(&u).await.unwrap(), SessionState::CredentialsSaved);

        fsm.transition(
            &u,
            SessionState::CredentialsSaved,
            SessionState::AuthInProgress,
            TransitionOptions::default(),
        )
        .await
        .unwrap();
        assert!(store.snapshot(&u).unwrap().auth_started_at.is_some());

        let expires = Utc::now() + TimeDelta::hours(1);
        fsm.transition(
            &u,
            SessionState::AuthInProgress,
            SessionState::SessionActive,
            TransitionOptions::session("tok", Some(expires)),
        )
        .await
        .unwrap();
        assert_eq!(fsm.get_state(&u).await.unwrap(), SessionState::SessionActive);
        assert_eq!(store.snapshot(&u).unwrap().expires_at, Some(expires));

        fsm.transition(
            &u,
            SessionState::SessionActive,
            SessionState::SessionExpired,
            TransitionOptions::default(),
        )
        .await
        .unwrap();
        let row = store.snapshot(&u).unwrap();
        assert!(row.session_token.is_none());
        assert_ne!(fsm.get_state(&u).await.unwrap(), SessionState::SessionActive);
    }

    #[tokio::test]
    async fn entering_active_requires_token() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.add(saved());
        let fsm = fsm_with(store);

        let result = fsm
            .transition(
                &user(),
                SessionState::AuthInProgress,
                SessionState::SessionActive,
                TransitionOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidSession { .. })));
    }

    #[tokio::test]
    async fn entering_locked_uses_configured_duration() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.add(saved().with_token("tok", Some(Utc::now() - TimeDelta::minutes(1))));
        let fsm = fsm_with(store.clone());

        let before = Utc::now();
        fsm.transition(
            &user(),
            SessionState::SessionExpired,
            SessionState::Locked,
            TransitionOptions::default(),
        )
        .await
        .unwrap();

        let row = store.snapshot(&user()).unwrap();
        let until = row.locked_until.unwrap();
        assert!(until >= before + TimeDelta::minutes(30));
        assert!(until <= Utc::now() + TimeDelta::minutes(30));
        assert!(row.session_token.is_none());
        assert_eq!(fsm.get_state(&user()).await.unwrap(), SessionState::Locked);
    }

    #[tokio::test]
    async fn lock_takes_precedence_in_guard() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let mut row = saved().with_token("tok", None);
        row.locked_until = Some(Utc::now() + TimeDelta::minutes(5));
        store.add(row);
        let fsm = fsm_with(store);

        let result = fsm.require_active(&user(), false).await;
        assert!(matches!(result, Err(GatewayError::SessionLocked { .. })));
    }

    #[tokio::test]
    async fn guard_allows_expired_only_when_asked() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.add(saved().with_token("tok", Some(Utc::now() - TimeDelta::seconds(1))));
        let fsm = fsm_with(store);

        let strict = fsm.require_active(&user(), false).await;
        assert!(matches!(
            strict,
            Err(GatewayError::SessionNotActive {
                state: SessionState::SessionExpired
            })
        ));
        assert_eq!(
            fsm.require_active(&user(), true).await.unwrap(),
            SessionState::SessionExpired
        );
    }

    #[tokio::test]
    async fn guard_message_names_state() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.add(saved());
        let fsm = fsm_with(store);

        let err = fsm.require_active(&user(), false).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "session not active, current state=CREDENTIALS_SAVED"
        );
    }

    #[tokio::test]
    async fn auth_failures_lock_at_limit() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.add(saved());
        let fsm = fsm_with(store.clone());

        assert!(!fsm.record_auth_failure(&user(), SessionState::AuthInProgress).await.unwrap());
        assert!(!fsm.record_auth_failure(&user(), SessionState::AuthInProgress).await.unwrap());
        assert!(fsm.record_auth_failure(&user(), SessionState::AuthInProgress).await.unwrap());

        assert_eq!(store.snapshot(&user()).unwrap().failed_auth_attempts, 0);
        assert_eq!(fsm.get_state(&user()).await.unwrap(), SessionState::Locked);
    }

    #[tokio::test]
    async fn lapsed_lock_grants_a_fresh_allowance() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.add(saved());
        let fsm = fsm_with(store.clone());

        for _ in 0..3 {
            fsm.record_auth_failure(&user(), SessionState::AuthInProgress)
                .await
                .unwrap();
        }
        let mut row = store.snapshot(&user()).unwrap();
        row.locked_until = Some(Utc::now() - TimeDelta::seconds(1));
        store.add(row);
        let fsm = fsm_with(store.clone());

        assert!(!fsm.record_auth_failure(&user(), SessionState::AuthInProgress).await.unwrap());
        assert_eq!(store.snapshot(&user()).unwrap().failed_auth_attempts, 1);
        assert_ne!(fsm.get_state(&user()).await.unwrap(), SessionState::Locked);
    }

    #[tokio::test]
    async fn entering_locked_clears_failure_counter() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let mut row = saved();
        row.failed_auth_attempts = 2;
        store.add(row);
        let fsm = fsm_with(store.clone());

        fsm.transition(
            &user(),
            SessionState::AuthInProgress,
            SessionState::Locked,
            TransitionOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(store.snapshot(&user()).unwrap().failed_auth_attempts, 0);
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let mut row = saved();
        row.failed_auth_attempts = 2;
        store.add(row);
        let fsm = fsm_with(store.clone());

        fsm.transition(
            &user(),
            SessionState::AuthInProgress,
            SessionState::SessionActive,
            TransitionOptions::session("tok", None),
        )
        .await
        .unwrap();
        assert_eq!(store.snapshot(&user()).unwrap().failed_auth_attempts, 0);
    }

    #[tokio::test]
    async fn store_failure_propagates_from_transition() {
        let mut store = MockCredentialStore::new();
        store.expect_get().returning(|_| Ok(Some(saved())));
        store
            .expect_put()
            .with(always())
            .returning(|_| Err(GatewayError::Store("write failed".to_string())));

        let repo = SessionRepository::new(Arc::new(store), Arc::new(SessionCache::default()));
        let fsm = SessionFsm::new(repo, SessionFsmConfig::default());

        let result = fsm
            .transition(
                &user(),
                SessionState::CredentialsSaved,
                SessionState::AuthInProgress,
                TransitionOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(GatewayError::Store(_))));
    }

    #[test]
    fn deadline_saturates() {
        let now = Utc::now();
        assert_eq!(deadline_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            deadline_after(now, Duration::from_secs(60)),
            now + TimeDelta::seconds(60)
        );
    }
}
