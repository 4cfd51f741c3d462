//! Port Interfaces
//!
//! Contracts between the services and their collaborators.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CredentialStore`: authoritative storage of broker session rows
//!
//! ## Driver Ports (Inbound)
//!
//! - `BrokerApi`: signed, throttled broker requests
//! - `SessionLifecycle`: session FSM reads, transitions and the request guard
//! - `TickStreaming`: per-user realtime tick streams

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::application::services::stream_manager::TickSubscription;
use crate::domain::session::{BrokerCredentials, BrokerSession, SessionState, UserId};
use crate::domain::streaming::Tick;
use crate::error::GatewayResult;
use crate::infrastructure::breeze::BrokerMethod;

// =============================================================================
// Driven Ports
// =============================================================================

/// Authoritative store of broker session rows.
///
/// Encryption at rest belongs to the implementation; callers only ever
/// see plaintext [`BrokerSession`] values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the row for `user_id`.
    async fn get(&self, user_id: &UserId) -> GatewayResult<Option<BrokerSession>>;

    /// Insert or replace a row.
    async fn put(&self, session: &BrokerSession) -> GatewayResult<()>;

    /// Clear `session_token` and `expires_at`, keeping credentials.
    async fn invalidate(&self, user_id: &UserId) -> GatewayResult<()>;

    /// Remove the row entirely.
    async fn delete(&self, user_id: &UserId) -> GatewayResult<()>;
}

// =============================================================================
// Driver Ports
// =============================================================================

/// Signed and throttled access to the broker REST API.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Perform one broker request on behalf of `user_id`.
    async fn request(
        &self,
        user_id: &UserId,
        method: BrokerMethod,
        endpoint: &str,
        payload: Value,
    ) -> GatewayResult<Value>;
}

/// Side-effect inputs for a session transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    /// Credentials to store on entering `CREDENTIALS_SAVED`.
    pub credentials: Option<BrokerCredentials>,
    /// Token to store on entering `SESSION_ACTIVE`.
    pub session_token: Option<String>,
    /// Expiry to store on entering `SESSION_ACTIVE` (`None` = never).
    pub expires_at: Option<DateTime<Utc>>,
    /// Lock length on entering `LOCKED` (defaults to the configured value).
    pub lock_duration: Option<Duration>,
}

impl TransitionOptions {
    /// Options carrying credentials.
    #[must_use]
    pub fn credentials(credentials: BrokerCredentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..Self::default()
        }
    }

    /// Options carrying a session token and expiry.
    #[must_use]
    pub fn session(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            session_token: Some(token.into()),
            expires_at,
            ..Self::default()
        }
    }
}

/// Session FSM as seen by request handlers.
#[async_trait]
pub trait SessionLifecycle: Send + Sync {
    /// Current derived state.
    async fn get_state(&self, user_id: &UserId) -> GatewayResult<SessionState>;

    /// Perform `from -> to` with its persistence side effect.
    async fn transition(
        &self,
        user_id: &UserId,
        from: SessionState,
        to: SessionState,
        options: TransitionOptions,
    ) -> GatewayResult<()>;

    /// Guard for broker-touching handlers. Returns the observed state.
    async fn require_active(&self, user_id: &UserId, allow_expired: bool)
    -> GatewayResult<SessionState>;
}

/// Callback receiving ticks for one user, in socket order.
pub type TickSink = Arc<dyn Fn(&Tick) + Send + Sync>;

/// Per-user realtime tick streams.
#[async_trait]
pub trait TickStreaming: Send + Sync {
    /// Open (or attach to) the user's stream.
    async fn start_user_stream(&self, user_id: &UserId, sink: TickSink)
    -> GatewayResult<TickSubscription>;

    /// Close the user's stream. Idempotent.
    async fn stop_user_stream(&self, user_id: &UserId);

    /// Subscribe to an instrument. No-op if already subscribed or not connected.
    async fn subscribe(&self, user_id: &UserId, symbol: &str, exchange: &str)
    -> GatewayResult<()>;

    /// Unsubscribe from an instrument. No-op if not subscribed or not connected.
    async fn unsubscribe(&self, user_id: &UserId, symbol: &str, exchange: &str)
    -> GatewayResult<()>;
}
