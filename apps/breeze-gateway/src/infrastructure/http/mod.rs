//! HTTP Surface
//!
//! Health, metrics and a thin set of session/broker routes in front of the
//! service interfaces. Every broker-touching route runs the session guard
//! before the gateway is called.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /v1/sessions/{user_id}` - derived session state
//! - `POST /v1/sessions/{user_id}/credentials` - store broker key/secret
//! - `POST /v1/sessions/{user_id}/login` - complete the broker handshake
//! - `POST /v1/broker/{user_id}/request` - guarded broker call
//!
//! Errors render as `{"kind": "...", "message": "..."}`.
//!
//! Tick streams have no routes: a stream needs an in-process [`TickSink`],
//! so the embedding application starts and subscribes streams through
//! `TickStreaming` and hands the manager here only for `/health` counts.
//!
//! [`TickSink`]: crate::TickSink

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{BrokerApi, SessionLifecycle};
use crate::application::services::login::LoginService;
use crate::application::services::stream_manager::RealtimeStreamManager;
use crate::domain::session::{BrokerCredentials, SessionState, UserId};
use crate::error::{ErrorKind, GatewayError};
use crate::infrastructure::breeze::BrokerMethod;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::resilience::{CircuitBreaker, CircuitBreakerState};

// =============================================================================
// Response Types
// =============================================================================

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Broker reachable.
    Healthy,
    /// Breaker probing the broker.
    Degraded,
    /// Breaker open.
    Unhealthy,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// REST circuit state, when a breaker is attached.
    pub circuit: Option<CircuitBreakerState>,
    /// Open user streams.
    pub active_streams: usize,
}

/// Session state response.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStateResponse {
    /// User the state belongs to.
    pub user_id: UserId,
    /// Derived state.
    pub state: SessionState,
}

/// Body of `POST /v1/broker/{user_id}/request`.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerRequestBody {
    /// HTTP method of the broker call.
    pub method: BrokerMethod,
    /// Endpoint relative to the broker base URL.
    pub endpoint: String,
    /// JSON payload (signed as sent).
    #[serde(default)]
    pub payload: Value,
}

/// Body of `POST /v1/sessions/{user_id}/credentials`.
#[derive(Clone, Deserialize)]
pub struct CredentialsBody {
    /// Broker application key.
    pub api_key: String,
    /// Broker application secret.
    pub api_secret: String,
}

/// Body of `POST /v1/sessions/{user_id}/login`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginBody {
    /// Value from the broker's login redirect.
    pub api_session: String,
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP status for an error kind.
#[must_use]
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotConnected => StatusCode::NOT_FOUND,
        ErrorKind::InvalidSession => StatusCode::BAD_REQUEST,
        ErrorKind::RateLimitExceeded | ErrorKind::SessionLocked => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::SessionExpiredRemote | ErrorKind::SessionNotActive => StatusCode::UNAUTHORIZED,
        ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::UpstreamUnavailable
        | ErrorKind::BrokerRejected
        | ErrorKind::MalformedResponse
        | ErrorKind::StreamUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::IllegalTransition | ErrorKind::Store | ErrorKind::Configuration => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Gateway error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!(kind = %kind, error = %self.0, "Request failed");
        }

        let body = Json(json!({ "kind": kind.as_str(), "message": self.0.to_string() }));
        let mut response = (status, body).into_response();

        let retry_after = match &self.0 {
            GatewayError::RateLimitExceeded { retry_after } => Some(*retry_after),
            GatewayError::CircuitOpen { retry_in } => Some(*retry_in),
            _ => None,
        };
        if let Some(wait) = retry_after {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(wait.as_secs().max(1)),
            );
        }
        response
    }
}

// =============================================================================
// App State
// =============================================================================

/// Shared state for the HTTP surface.
pub struct AppState {
    version: String,
    started_at: Instant,
    sessions: Arc<dyn SessionLifecycle>,
    broker: Arc<dyn BrokerApi>,
    login: Option<Arc<LoginService>>,
    breaker: Option<Arc<CircuitBreaker>>,
    streams: Option<RealtimeStreamManager>,
}

impl AppState {
    /// Create state over the session and broker interfaces.
    #[must_use]
    pub fn new(
        version: impl Into<String>,
        sessions: Arc<dyn SessionLifecycle>,
        broker: Arc<dyn BrokerApi>,
    ) -> Self {
        Self {
            version: version.into(),
            started_at: Instant::now(),
            sessions,
            broker,
            login: None,
            breaker: None,
            streams: None,
        }
    }

    /// Enable the credential and login routes.
    #[must_use]
    pub fn with_login(mut self, login: Arc<LoginService>) -> Self {
        self.login = Some(login);
        self
    }

    /// Report this breaker in `/health`.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Report stream counts in `/health`.
    #[must_use]
    pub fn with_stream_manager(mut self, streams: RealtimeStreamManager) -> Self {
        self.streams = Some(streams);
        self
    }

    fn login(&self) -> Result<&LoginService, ApiError> {
        self.login.as_deref().ok_or_else(|| {
            ApiError(GatewayError::Configuration(
                "login service not configured".to_string(),
            ))
        })
    }
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/sessions/{user_id}", get(session_state_handler))
        .route("/v1/sessions/{user_id}/credentials", post(credentials_handler))
        .route("/v1/sessions/{user_id}/login", post(login_handler))
        .route("/v1/broker/{user_id}/request", post(broker_request_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Server
// =============================================================================

/// HTTP server for the gateway.
pub struct HttpServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the server stops with
    /// a fatal error.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn session_state_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<SessionStateResponse>, ApiError> {
    let user_id = UserId::new(user_id);
    let session_state = state.sessions.get_state(&user_id).await?;
    Ok(Json(SessionStateResponse {
        user_id,
        state: session_state,
    }))
}

async fn credentials_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(body): Json<CredentialsBody>,
) -> Result<StatusCode, ApiError> {
    let user_id = UserId::new(user_id);
    state
        .login()?
        .save_credentials(&user_id, BrokerCredentials::new(body.api_key, body.api_secret))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(body): Json<LoginBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = UserId::new(user_id);
    let expires_at = state
        .login()?
        .complete_login(&user_id, &body.api_session)
        .await?;
    Ok(Json(json!({
        "state": SessionState::SessionActive,
        "expires_at": expires_at,
    })))
}

async fn broker_request_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(body): Json<BrokerRequestBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = UserId::new(user_id);
    state.sessions.require_active(&user_id, false).await?;

    let value = state
        .broker
        .request(&user_id, body.method, &body.endpoint, body.payload)
        .await?;
    Ok(Json(value))
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let circuit = state.breaker.as_ref().map(|breaker| breaker.state());
    let status = match circuit {
        None | Some(CircuitBreakerState::Closed) => HealthStatus::Healthy,
        Some(CircuitBreakerState::HalfOpen) => HealthStatus::Degraded,
        Some(CircuitBreakerState::Open) => HealthStatus::Unhealthy,
    };

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        circuit,
        active_streams: state
            .streams
            .as_ref()
            .map_or(0, RealtimeStreamManager::active_streams),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(ErrorKind::NotConnected), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(ErrorKind::SessionLocked),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(ErrorKind::SessionNotActive),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(ErrorKind::CircuitOpen),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(ErrorKind::IllegalTransition),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn rate_limit_sets_retry_after() {
        let response = ApiError(GatewayError::RateLimitExceeded {
            retry_after: Duration::from_secs(12),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "12");
    }

    #[test]
    fn broker_body_defaults_payload() {
        let body: BrokerRequestBody =
            serde_json::from_str(r#"{"method":"GET","endpoint":"funds"}"#).unwrap();
        assert_eq!(body.method, BrokerMethod::Get);
        assert!(body.payload.is_null());
    }
}
