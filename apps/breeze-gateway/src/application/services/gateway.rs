//! Broker Gateway
//!
//! The only path by which application code talks to the Breeze REST API.
//!
//! # Request Pipeline
//!
//! ```text
//! rate limit -> resolve session -> sign -> breaker(retry(http)) -> classify
//! ```
//!
//! Rate limiting and session resolution never wait on the network. A broker
//! 401 invalidates the stored session before the error is surfaced.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::Instrument;
use uuid::Uuid;

use crate::application::ports::BrokerApi;
use crate::application::services::session_repository::SessionRepository;
use crate::domain::session::{BrokerSession, UserId};
use crate::error::{GatewayError, GatewayResult};
use crate::infrastructure::breeze::codec::is_customer_details;
use crate::infrastructure::breeze::{
    BreezeHttpClient, BrokerMethod, ChecksumSigner, RequestAuth, checksum::compact_json,
};
use crate::infrastructure::config::GatewayConfig;
use crate::infrastructure::metrics;
use crate::infrastructure::resilience::{CircuitBreaker, RateLimiter, RetryPolicy};

/// Name of the breaker guarding the REST API.
pub const BREAKER_NAME: &str = "breeze_rest";

/// Gateway to the Breeze REST API.
#[derive(Debug, Clone)]
pub struct BrokerGateway {
    limiter: Arc<RateLimiter>,
    repo: SessionRepository,
    http: BreezeHttpClient,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    signer: ChecksumSigner,
}

impl BrokerGateway {
    /// Assemble a gateway from its collaborators.
    #[must_use]
    pub const fn new(
        repo: SessionRepository,
        http: BreezeHttpClient,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            limiter,
            repo,
            http,
            retry,
            breaker,
            signer: ChecksumSigner,
        }
    }

    /// Build a gateway with fresh resilience state from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Configuration`] if the HTTP client cannot be built.
    pub fn from_config(config: &GatewayConfig, repo: SessionRepository) -> GatewayResult<Self> {
        let http = BreezeHttpClient::new(&config.http_config())?;
        Ok(Self::new(
            repo,
            http,
            Arc::new(RateLimiter::new(config.rate_limit)),
            config.retry,
            Arc::new(CircuitBreaker::new(BREAKER_NAME, config.circuit_breaker)),
        ))
    }

    /// Shared rate limiter (for maintenance).
    #[must_use]
    pub const fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Shared circuit breaker.
    #[must_use]
    pub const fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn resolve_session(&self, user_id: &UserId) -> GatewayResult<BrokerSession> {
        let session = self
            .repo
            .resolve(user_id)
            .await?
            .ok_or_else(|| GatewayError::not_connected(user_id))?;

        if session.api_key.is_empty() {
            return Err(GatewayError::invalid_session("api key missing"));
        }
        if session.api_secret.is_empty() {
            return Err(GatewayError::invalid_session("api secret missing"));
        }
        Ok(session)
    }

    async fn dispatch(
        &self,
        user_id: &UserId,
        method: BrokerMethod,
        endpoint: &str,
        payload: Value,
    ) -> GatewayResult<Value> {
        // 1. Local quota, no network
        self.limiter.check(user_id)?;

        // 2. Session
        let session = self.resolve_session(user_id).await?;

        // 3. Customer-details handshake: credentials in the body, no checksum
        if is_customer_details(endpoint) {
            let token = payload
                .get("SessionToken")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| session.session_token.clone())
                .ok_or_else(|| GatewayError::invalid_session("session token missing"))?;
            let body = json!({ "SessionToken": token, "AppKey": session.api_key }).to_string();

            return self
                .breaker
                .execute(|| {
                    self.retry.run(endpoint, || {
                        self.http
                            .send(method, endpoint, body.clone(), &RequestAuth::Handshake)
                    })
                })
                .await;
        }

        // 4. Standard call: signed per attempt so the timestamp stays fresh
        let session_token = session
            .session_token
            .as_deref()
            .ok_or_else(|| GatewayError::invalid_session("session token missing"))?;
        let body = compact_json(&payload);
        let http = &self.http;
        let signer = self.signer;
        let app_key = session.api_key.as_str();
        let api_secret = session.api_secret.as_str();

        // 5. Breaker around retry around one HTTP exchange
        self.breaker
            .execute(|| {
                self.retry.run(endpoint, || {
                    let signature = signer.sign(&payload, api_secret, Utc::now());
                    let body = body.clone();
                    async move {
                        let auth = RequestAuth::Signed {
                            app_key,
                            session_token,
                            signature: &signature,
                        };
                        http.send(method, endpoint, body, &auth).await
                    }
                })
            })
            .await
    }
}

#[async_trait]
impl BrokerApi for BrokerGateway {
    async fn request(
        &self,
        user_id: &UserId,
        method: BrokerMethod,
        endpoint: &str,
        payload: Value,
    ) -> GatewayResult<Value> {
        let span = tracing::info_span!(
            "broker_request",
            request_id = %Uuid::new_v4(),
            user_id = %user_id,
            method = %method,
            endpoint,
        );

        async {
            let result = self.dispatch(user_id, method, endpoint, payload).await;

            match &result {
                Ok(_) => {
                    metrics::record_request(endpoint, "ok");
                    tracing::debug!("Broker request succeeded");
                }
                Err(err) => {
                    metrics::record_request(endpoint, err.kind().as_str());
                    tracing::warn!(kind = %err.kind(), error = %err, "Broker request failed");

                    if matches!(err, GatewayError::SessionExpiredRemote) {
                        if let Err(invalidate_err) = self.repo.invalidate(user_id).await {
                            tracing::error!(
                                error = %invalidate_err,
                                "Failed to invalidate session after broker 401"
                            );
                        }
                    }
                }
            }

            result
        }
        .instrument(span)
        .await
    }
}
