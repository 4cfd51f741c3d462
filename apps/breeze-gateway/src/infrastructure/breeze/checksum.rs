//! Request signing for the Breeze REST API.
//!
//! Standard calls carry `X-Checksum: token <hex>` where the hex digest is
//! `sha256(timestamp + compact_json(payload) + api_secret)`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Timestamp layout expected in `X-Timestamp` (UTC, second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.000Z";

/// Format `now` the way the broker expects in `X-Timestamp`.
#[must_use]
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Compact JSON rendering of a payload. `Null` renders as `{}`.
#[must_use]
pub fn compact_json(payload: &Value) -> String {
    if payload.is_null() {
        return "{}".to_string();
    }
    payload.to_string()
}

/// Compute the request checksum as lowercase hex.
#[must_use]
pub fn calculate_checksum(timestamp: &str, payload: &Value, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(compact_json(payload).as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Timestamp + checksum pair attached to one signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Value of `X-Timestamp`.
    pub timestamp: String,
    /// Hex digest (without the `token ` prefix).
    pub checksum: String,
}

impl Signature {
    /// Value of the `X-Checksum` header.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("token {}", self.checksum)
    }
}

/// Signs payloads with a user's API secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumSigner;

impl ChecksumSigner {
    /// Sign `payload` at `now`.
    #[must_use]
    pub fn sign(self, payload: &Value, api_secret: &str, now: DateTime<Utc>) -> Signature {
        let timestamp = format_timestamp(now);
        let checksum = calculate_checksum(&timestamp, payload, api_secret);
        Signature {
            timestamp,
            checksum,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn timestamp_has_fixed_millis() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 9, 15, 7).single();
        assert_eq!(
            now.map(format_timestamp).as_deref(),
            Some("2024-03-05T09:15:07.000Z")
        );
    }

    #[test]
    fn checksum_matches_reference_digest() {
        // sha256("2024-01-01T00:00:00.000Z" + "{}" + "secret")
        let mut hasher = Sha256::new();
        hasher.update(b"2024-01-01T00:00:00.000Z{}secret");
        let expected = hex::encode(hasher.finalize());

        assert_eq!(
            calculate_checksum("2024-01-01T00:00:00.000Z", &json!({}), "secret"),
            expected
        );
        assert_eq!(
            calculate_checksum("2024-01-01T00:00:00.000Z", &Value::Null, "secret"),
            expected
        );
    }

    #[test]
    fn checksum_changes_with_every_input() {
        let payload = json!({"stock_code": "INFY", "quantity": "1"});
        let base = calculate_checksum("t1", &payload, "s1");

        assert_eq!(base, calculate_checksum("t1", &payload, "s1"));
        assert_ne!(base, calculate_checksum("t2", &payload, "s1"));
        assert_ne!(base, calculate_checksum("t1", &payload, "s2"));
        assert_ne!(
            base,
            calculate_checksum("t1", &json!({"stock_code": "INFY", "quantity": "2"}), "s1")
        );
    }

    #[test]
    fn header_value_is_prefixed() {
        let sig = ChecksumSigner.sign(&json!({}), "secret", Utc::now());
        assert!(sig.header_value().starts_with("token "));
        assert_eq!(sig.checksum.len(), 64);
    }

    proptest! {
        #[test]
        fn whitespace_in_payload_text_does_not_change_checksum(
            fields in prop::collection::btree_map("[a-z_]{1,8}", "[A-Za-z0-9 ]{0,12}", 0..6),
            secret in "[a-zA-Z0-9]{1,16}",
        ) {
            let value = serde_json::to_value(&fields).unwrap();
            let compact: Value = serde_json::from_str(&serde_json::to_string(&value).unwrap()).unwrap();
            let pretty: Value = serde_json::from_str(&serde_json::to_string_pretty(&value).unwrap()).unwrap();

            prop_assert_eq!(
                calculate_checksum("2024-01-01T00:00:00.000Z", &compact, &secret),
                calculate_checksum("2024-01-01T00:00:00.000Z", &pretty, &secret)
            );
        }
    }
}
