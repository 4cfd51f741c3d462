//! Login Service
//!
//! Drives the session FSM through the broker's customer-details handshake:
//! stored credentials plus the `apisession` value from the broker's login
//! redirect are exchanged for a session token.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::application::ports::{BrokerApi, SessionLifecycle, TransitionOptions};
use crate::application::services::session_fsm::{SessionFsm, deadline_after};
use crate::domain::session::{BrokerCredentials, SessionState, UserId};
use crate::error::{GatewayError, GatewayResult};
use crate::infrastructure::breeze::BrokerMethod;
use crate::infrastructure::breeze::codec::{CUSTOMER_DETAILS_ENDPOINT, customer_session_token};

/// Login and credential management.
pub struct LoginService {
    fsm: Arc<SessionFsm>,
    gateway: Arc<dyn BrokerApi>,
    session_lifetime: Option<Duration>,
}

impl std::fmt::Debug for LoginService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginService")
            .field("session_lifetime", &self.session_lifetime)
            .finish_non_exhaustive()
    }
}

impl LoginService {
    /// Create a login service. `session_lifetime = None` issues tokens that never expire.
    #[must_use]
    pub fn new(
        fsm: Arc<SessionFsm>,
        gateway: Arc<dyn BrokerApi>,
        session_lifetime: Option<Duration>,
    ) -> Self {
        Self {
            fsm,
            gateway,
            session_lifetime,
        }
    }

    async fn locked_error(&self, user_id: &UserId) -> GatewayResult<GatewayError> {
        let session = self.fsm.repository().resolve(user_id).await?;
        Ok(GatewayError::SessionLocked {
            locked_until: session
                .and_then(|s| s.locked_until)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        })
    }

    /// Store the user's broker key/secret.
    ///
    /// A new user moves `NONE -> CREDENTIALS_SAVED`. An existing row gets
    /// its credentials replaced and any session token dropped.
    ///
    /// # Errors
    ///
    /// `InvalidSession` for empty values, `SessionLocked` while locked, or a
    /// store failure.
    pub async fn save_credentials(
        &self,
        user_id: &UserId,
        credentials: BrokerCredentials,
    ) -> GatewayResult<()> {
        if credentials.api_key.is_empty() || credentials.api_secret.is_empty() {
            return Err(GatewayError::invalid_session("api key and secret required"));
        }

        match self.fsm.get_state(user_id).await? {
            SessionState::None => {
                self.fsm
                    .transition(
                        user_id,
                        SessionState::None,
                        SessionState::CredentialsSaved,
                        TransitionOptions::credentials(credentials),
                    )
                    .await
            }
            SessionState::Locked => Err(self.locked_error(user_id).await?),
            _ => {
                let repo = self.fsm.repository();
                let Some(mut session) = repo.resolve(user_id).await? else {
                    return Err(GatewayError::not_connected(user_id));
                };
                session.api_key = credentials.api_key;
                session.api_secret = credentials.api_secret;
                session.clear_token();
                repo.save(&session).await?;
                tracing::info!(user_id = %user_id, "Broker credentials replaced");
                Ok(())
            }
        }
    }

    /// Exchange `api_session` for a broker session token.
    ///
    /// Returns the new token's expiry (`None` = never expires).
    ///
    /// # Errors
    ///
    /// `SessionLocked` / `SessionNotActive` if the current state cannot
    /// start a login, otherwise the gateway error or `MalformedResponse`
    /// when the broker returns no token. Failed handshakes count towards
    /// the lockout.
    pub async fn complete_login(
        &self,
        user_id: &UserId,
        api_session: &str,
    ) -> GatewayResult<Option<DateTime<Utc>>> {
        if api_session.trim().is_empty() {
            return Err(GatewayError::invalid_session("api session value required"));
        }

        // 1. Only a saved or expired session may start a handshake
        let from = self.fsm.get_state(user_id).await?;
        match from {
            SessionState::CredentialsSaved | SessionState::SessionExpired => {}
            SessionState::Locked => return Err(self.locked_error(user_id).await?),
            state => return Err(GatewayError::SessionNotActive { state }),
        }

        // 2. Mark the handshake
        self.fsm
            .transition(
                user_id,
                from,
                SessionState::AuthInProgress,
                TransitionOptions::default(),
            )
            .await?;

        // 3. Exchange and activate
        match self.exchange(user_id, api_session).await {
            Ok(expires_at) => {
                tracing::info!(user_id = %user_id, expires_at = ?expires_at, "Broker login complete");
                Ok(expires_at)
            }
            Err(err) => {
                // Local fast-fail errors never reached the broker.
                if !matches!(
                    err,
                    GatewayError::RateLimitExceeded { .. } | GatewayError::CircuitOpen { .. }
                ) {
                    self.fsm
                        .record_auth_failure(user_id, SessionState::AuthInProgress)
                        .await?;
                }
                Err(err)
            }
        }
    }

    async fn exchange(
        &self,
        user_id: &UserId,
        api_session: &str,
    ) -> GatewayResult<Option<DateTime<Utc>>> {
        let body = self
            .gateway
            .request(
                user_id,
                BrokerMethod::Get,
                CUSTOMER_DETAILS_ENDPOINT,
                json!({ "SessionToken": api_session }),
            )
            .await?;

        let token = customer_session_token(&body).ok_or_else(|| {
            GatewayError::MalformedResponse("customer details carried no session token".to_string())
        })?;
        let expires_at = self
            .session_lifetime
            .map(|lifetime| deadline_after(Utc::now(), lifetime));

        self.fsm
            .transition(
                user_id,
                SessionState::AuthInProgress,
                SessionState::SessionActive,
                TransitionOptions::session(token, expires_at),
            )
            .await?;

        Ok(expires_at)
    }
}
