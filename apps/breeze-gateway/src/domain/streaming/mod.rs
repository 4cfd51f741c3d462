//! Realtime Streaming Types
//!
//! Instrument keys, ticks and the per-user stream state used by the
//! realtime tick feed.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Instrument Key
// =============================================================================

/// Exchange + symbol pair identifying one subscribable instrument.
///
/// Rendered on the wire as `EXCHANGE|SYMBOL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentKey {
    /// Exchange code (e.g. `NSE`).
    pub exchange: String,
    /// Instrument symbol (e.g. `INFY`).
    pub symbol: String,
}

impl InstrumentKey {
    /// Create a key. Exchange codes are upper-cased.
    #[must_use]
    pub fn new(exchange: impl AsRef<str>, symbol: impl Into<String>) -> Self {
        Self {
            exchange: exchange.as_ref().to_ascii_uppercase(),
            symbol: symbol.into(),
        }
    }

    /// Wire form, `EXCHANGE|SYMBOL`.
    #[must_use]
    pub fn wire_symbol(&self) -> String {
        format!("{}|{}", self.exchange, self.symbol)
    }

    /// Parse a wire symbol. Returns `None` without a `|` separator.
    #[must_use]
    pub fn parse(wire: &str) -> Option<Self> {
        let (exchange, symbol) = wire.split_once('|')?;
        if exchange.is_empty() || symbol.is_empty() {
            return None;
        }
        Some(Self::new(exchange, symbol))
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.exchange, self.symbol)
    }
}

// =============================================================================
// Tick
// =============================================================================

/// A single realtime price update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Symbol as sent by the broker.
    pub symbol: String,
    /// Last traded price.
    pub ltp: Decimal,
    /// Any other fields the broker included.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Local receive time.
    #[serde(skip, default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

// =============================================================================
// Stream State
// =============================================================================

/// Lifecycle of one user's stream.
///
/// `DISCONNECTED -> CONNECTING -> CONNECTED -> (RECONNECTING -> CONNECTING)* -> DISCONNECTED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    /// No socket.
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Socket open; subscribe/unsubscribe/heartbeat active.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

impl StreamState {
    /// Whether control frames may be sent.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_symbol_joins_with_pipe() {
        let key = InstrumentKey::new("nse", "INFY");
        assert_eq!(key.wire_symbol(), "NSE|INFY");
        assert_eq!(key.to_string(), "NSE|INFY");
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert_eq!(
            InstrumentKey::parse("BSE|SENSEX"),
            Some(InstrumentKey::new("BSE", "SENSEX"))
        );
        assert!(InstrumentKey::parse("INFY").is_none());
        assert!(InstrumentKey::parse("|INFY").is_none());
    }

    #[test]
    fn only_connected_accepts_control_frames() {
        assert!(StreamState::Connected.is_connected());
        assert!(!StreamState::Connecting.is_connected());
        assert!(!StreamState::Reconnecting.is_connected());
        assert!(!StreamState::Disconnected.is_connected());
    }
}
