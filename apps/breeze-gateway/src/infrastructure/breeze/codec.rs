//! Breeze wire formats.
//!
//! REST envelopes (`{Success, Status, Error}`), status classification and
//! the realtime feed's control and tick frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::streaming::{InstrumentKey, Tick};
use crate::error::GatewayError;

// =============================================================================
// REST
// =============================================================================

/// Endpoint of the customer-details handshake.
pub const CUSTOMER_DETAILS_ENDPOINT: &str = "customerdetails";

/// Whether `endpoint` uses the handshake header shape (no checksum).
#[must_use]
pub fn is_customer_details(endpoint: &str) -> bool {
    endpoint.trim_matches('/').eq_ignore_ascii_case(CUSTOMER_DETAILS_ENDPOINT)
}

/// HTTP method of a broker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BrokerMethod {
    /// GET (the broker accepts a JSON body on GET).
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// DELETE.
    Delete,
}

impl BrokerMethod {
    /// Upper-case method name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for BrokerMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BrokerMethod {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            other => Err(GatewayError::BrokerRejected {
                status: 405,
                message: format!("unsupported method {other}"),
            }),
        }
    }
}

impl From<BrokerMethod> for reqwest::Method {
    fn from(method: BrokerMethod) -> Self {
        match method {
            BrokerMethod::Get => Self::GET,
            BrokerMethod::Post => Self::POST,
            BrokerMethod::Put => Self::PUT,
            BrokerMethod::Delete => Self::DELETE,
        }
    }
}

/// Longest broker message echoed into an error.
const MAX_MESSAGE_LEN: usize = 200;

/// Pull a short error message out of a broker body.
#[must_use]
pub fn error_message(body: &Value) -> Option<String> {
    let message = ["Error", "error", "message", "Message"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .filter(|m| !m.is_empty())?;
    Some(truncate(message))
}

fn truncate(message: &str) -> String {
    message.chars().take(MAX_MESSAGE_LEN).collect()
}

/// Embedded broker status of a 2xx body, when it signals an error.
///
/// The broker reports domain errors inside HTTP 200 responses through a
/// `Status` field.
#[must_use]
pub fn embedded_failure(body: &Value) -> Option<(u16, String)> {
    let status = body.get("Status").and_then(|s| {
        s.as_u64()
            .or_else(|| s.as_str().and_then(|v| v.trim().parse().ok()))
    })?;
    if status == 200 {
        return None;
    }
    let status = u16::try_from(status).unwrap_or(500);
    let message = error_message(body).unwrap_or_else(|| format!("broker status {status}"));
    Some((status, message))
}

/// Map a broker status (HTTP or embedded) to the error taxonomy.
#[must_use]
pub fn classify_status(status: u16, message: String) -> GatewayError {
    match status {
        401 => GatewayError::SessionExpiredRemote,
        403 => GatewayError::AccessDenied { message },
        408 => GatewayError::Timeout {
            detail: format!("broker returned 408: {message}"),
        },
        429 => GatewayError::RateLimitExceeded {
            retry_after: std::time::Duration::from_secs(60),
        },
        500..=599 => GatewayError::UpstreamUnavailable {
            status: Some(status),
            message,
        },
        _ => GatewayError::BrokerRejected { status, message },
    }
}

/// Session token returned by the customer-details handshake.
#[must_use]
pub fn customer_session_token(body: &Value) -> Option<String> {
    body.get("Success")
        .and_then(|s| s.get("session_token"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

// =============================================================================
// Realtime feed
// =============================================================================

/// Subscribe / unsubscribe action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Start receiving ticks for a symbol.
    Subscribe,
    /// Stop receiving ticks for a symbol.
    Unsubscribe,
}

/// Client → server control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    /// Requested action.
    pub action: ControlAction,
    /// `EXCHANGE|SYMBOL`.
    pub symbol: String,
}

impl ControlFrame {
    /// Build a frame for an instrument.
    #[must_use]
    pub fn new(action: ControlAction, key: &InstrumentKey) -> Self {
        Self {
            action,
            symbol: key.wire_symbol(),
        }
    }

    /// JSON text of the frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Literal text the server sends in reply to a ping.
pub const PONG_TEXT: &str = "pong";
/// Literal text sent as an application ping.
pub const PING_TEXT: &str = "ping";

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Heartbeat reply.
    Pong,
    /// Price update.
    Tick(Tick),
    /// Unparseable or unexpected payload.
    Malformed(String),
}

/// Decode one text frame from the feed. Never fails; bad input is
/// reported as [`InboundFrame::Malformed`].
#[must_use]
pub fn decode_text(text: &str) -> InboundFrame {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case(PONG_TEXT) || trimmed == "\"pong\"" {
        return InboundFrame::Pong;
    }

    match serde_json::from_str::<Tick>(trimmed) {
        Ok(tick) if !tick.symbol.is_empty() => InboundFrame::Tick(tick),
        Ok(_) => InboundFrame::Malformed("empty symbol".to_string()),
        Err(e) => InboundFrame::Malformed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;

    #[test]
    fn embedded_status_other_than_200_is_a_failure() {
        let body = json!({"Success": null, "Status": 500, "Error": "Internal error"});
        assert_eq!(
            embedded_failure(&body),
            Some((500, "Internal error".to_string()))
        );

        let ok = json!({"Success": {"funds": 1}, "Status": 200, "Error": null});
        assert_eq!(embedded_failure(&ok), None);

        assert_eq!(embedded_failure(&json!({"data": []})), None);
    }

    #[test]
    fn embedded_status_accepts_strings() {
        let body = json!({"Status": "401", "Error": "Session key is expired"});
        assert_eq!(embedded_failure(&body).map(|(s, _)| s), Some(401));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(401, String::new()),
            GatewayError::SessionExpiredRemote
        ));
        assert!(matches!(
            classify_status(403, String::new()),
            GatewayError::AccessDenied { .. }
        ));
        assert!(matches!(
            classify_status(408, String::new()),
            GatewayError::Timeout { .. }
        ));
        assert!(matches!(
            classify_status(429, String::new()),
            GatewayError::RateLimitExceeded { .. }
        ));
        assert!(matches!(
            classify_status(503, String::new()),
            GatewayError::UpstreamUnavailable { status: Some(503), .. }
        ));
        assert!(matches!(
            classify_status(422, String::new()),
            GatewayError::BrokerRejected { status: 422, .. }
        ));
    }

    #[test]
    fn long_broker_messages_are_truncated() {
        let body = json!({"Error": "x".repeat(1000)});
        assert_eq!(error_message(&body).map(|m| m.len()), Some(MAX_MESSAGE_LEN));
    }

    #[test]
    fn customer_details_detection() {
        assert!(is_customer_details("customerdetails"));
        assert!(is_customer_details("/CustomerDetails"));
        assert!(!is_customer_details("funds"));
    }

    #[test]
    fn session_token_extraction() {
        let body = json!({"Success": {"session_token": "abc"}, "Status": 200});
        assert_eq!(customer_session_token(&body).as_deref(), Some("abc"));
        assert_eq!(customer_session_token(&json!({"Success": {}})), None);
    }

    #[test]
    fn method_parsing() {
        assert_eq!("get".parse::<BrokerMethod>().ok(), Some(BrokerMethod::Get));
        assert!("PATCH".parse::<BrokerMethod>().is_err());
    }

    #[test]
    fn control_frame_shape() {
        let frame = ControlFrame::new(ControlAction::Subscribe, &InstrumentKey::new("NSE", "INFY"));
        assert_eq!(
            frame.to_text().ok().as_deref(),
            Some(r#"{"action":"subscribe","symbol":"NSE|INFY"}"#)
        );
    }

    #[test]
    fn decodes_pong_and_ticks() {
        assert_eq!(decode_text("pong"), InboundFrame::Pong);

        match decode_text(r#"{"symbol":"NSE|INFY","ltp":1523.45,"volume":100}"#) {
            InboundFrame::Tick(tick) => {
                assert_eq!(tick.symbol, "NSE|INFY");
                assert_eq!(tick.ltp, dec!(1523.45));
                assert_eq!(tick.extra.get("volume"), Some(&json!(100)));
            }
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payloads_are_reported_not_raised() {
        assert!(matches!(decode_text("{not json"), InboundFrame::Malformed(_)));
        assert!(matches!(
            decode_text(r#"{"symbol":"NSE|INFY"}"#),
            InboundFrame::Malformed(_)
        ));
        assert!(matches!(
            decode_text(r#"{"symbol":"","ltp":1}"#),
            InboundFrame::Malformed(_)
        ));
    }
}
