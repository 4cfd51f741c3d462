//! Pooled HTTP transport for the Breeze REST API.
//!
//! One `reqwest::Client` is shared by all users so connections are reused.
//! The client performs exactly one HTTP exchange per call; retry and
//! circuit breaking are layered on top by the gateway.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::checksum::Signature;
use super::codec::{BrokerMethod, classify_status, embedded_failure, error_message};
use crate::error::{GatewayError, GatewayResult};

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreezeHttpConfig {
    /// Base URL all endpoints are joined onto.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for BreezeHttpConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.icicidirect.com/breezeapi/api/v1".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Authentication headers of one call.
#[derive(Clone)]
pub enum RequestAuth<'a> {
    /// Standard call: app key, session token, timestamp and checksum.
    Signed {
        /// `X-AppKey`.
        app_key: &'a str,
        /// `X-SessionToken`.
        session_token: &'a str,
        /// `X-Timestamp` / `X-Checksum`.
        signature: &'a Signature,
    },
    /// Customer-details handshake: credentials travel in the JSON body.
    Handshake,
}

impl std::fmt::Debug for RequestAuth<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signed { signature, .. } => f
                .debug_struct("Signed")
                .field("timestamp", &signature.timestamp)
                .finish_non_exhaustive(),
            Self::Handshake => f.write_str("Handshake"),
        }
    }
}

/// HTTP client for the Breeze API.
#[derive(Debug, Clone)]
pub struct BreezeHttpClient {
    client: Client,
    base_url: String,
}

impl BreezeHttpClient {
    /// Create a new HTTP client from config.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Configuration`] if the base URL is empty or
    /// the TLS backend cannot be initialised.
    pub fn new(config: &BreezeHttpConfig) -> GatewayResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "broker base URL must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Full URL of `endpoint`.
    #[must_use]
    pub fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// Perform one HTTP exchange and classify the outcome.
    ///
    /// # Errors
    ///
    /// Returns the taxonomy error for the HTTP status, the embedded broker
    /// status, a transport failure or a non-JSON body.
    pub async fn send(
        &self,
        method: BrokerMethod,
        endpoint: &str,
        body: String,
        auth: &RequestAuth<'_>,
    ) -> GatewayResult<Value> {
        let headers = build_headers(auth)?;

        let response = self
            .client
            .request(method.into(), self.url(endpoint))
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| transport_error(&e))?;

        if status.is_success() {
            let value = parse_body(&text)?;
            if let Some((embedded, message)) = embedded_failure(&value) {
                return Err(classify_status(embedded, message));
            }
            return Ok(value);
        }

        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .as_ref()
            .and_then(error_message)
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            });

        Err(classify_http_status(status, message))
    }
}

fn build_headers(auth: &RequestAuth<'_>) -> GatewayResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let RequestAuth::Signed {
        app_key,
        session_token,
        signature,
    } = auth
    {
        headers.insert("X-AppKey", header_value(app_key)?);
        headers.insert("X-SessionToken", header_value(session_token)?);
        headers.insert("X-Timestamp", header_value(&signature.timestamp)?);
        headers.insert("X-Checksum", header_value(&signature.header_value())?);
    }

    Ok(headers)
}

fn header_value(value: &str) -> GatewayResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| GatewayError::invalid_session("credential contains characters not allowed in headers"))
}

fn parse_body(text: &str) -> GatewayResult<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| GatewayError::MalformedResponse(e.to_string()))
}

fn classify_http_status(status: StatusCode, message: String) -> GatewayError {
    classify_status(status.as_u16(), message)
}

fn transport_error(err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        return GatewayError::Timeout {
            detail: "no response within the request timeout".to_string(),
        };
    }

    let message = if err.is_connect() {
        "connection failed".to_string()
    } else {
        "transport error".to_string()
    };
    tracing::debug!(error = %err, "Broker transport error");

    GatewayError::UpstreamUnavailable {
        status: err.status().map(|s| s.as_u16()),
        message,
    }
}
