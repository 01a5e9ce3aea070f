//! Payload types carried inside envelopes.
//!
//! These shapes are fixed by the deployed network: field names, base64
//! encoding (standard alphabet, padded), and millisecond ISO-8601
//! timestamps must not change. Envelope tags identify the carrying
//! context; payloads themselves are untagged objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::b64;

/// A peer's published key material, as stored by the relay and handed out
/// on join and lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Unique display name. One live session per username.
    pub username: String,

    /// Ed25519 verifying key (32 bytes).
    #[serde(rename = "identityKey", with = "b64")]
    pub identity_key: Vec<u8>,

    /// ML-KEM-768 encapsulation key (1184 bytes). Fresh per session.
    #[serde(rename = "kemKey", with = "b64")]
    pub kem_key: Vec<u8>,
}

/// A signed KEM encapsulation, offering the sender's half of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeOffer {
    /// Recipient username.
    pub to: String,

    /// Sender username.
    pub from: String,

    /// ML-KEM-768 ciphertext (1088 bytes).
    #[serde(rename = "cipherText", with = "b64")]
    pub cipher_text: Vec<u8>,

    /// Ed25519 signature over the raw ciphertext bytes (64 bytes).
    ///
    /// Receivers MUST verify this against the sender's published identity
    /// key before decapsulating.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

/// An AEAD-sealed chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// Recipient username.
    pub to: String,

    /// Sender username.
    pub from: String,

    /// XChaCha20-Poly1305 nonce (24 bytes), fresh per message.
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,

    /// Ciphertext with trailing Poly1305 tag.
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,

    /// Sender wall-clock send time. Serialized as ISO-8601 with
    /// milliseconds and a `Z` suffix (`2024-01-01T00:00:00.000Z`).
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

/// Serde adapter pinning timestamps to millisecond ISO-8601 UTC.
///
/// Deserialization accepts any RFC 3339 offset and normalizes to UTC;
/// serialization always emits exactly three fractional digits and `Z`.
mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_at(millis: i64) -> EncryptedMessage {
        EncryptedMessage {
            to: "bob".into(),
            from: "alice".into(),
            nonce: vec![0x01; 3],
            ciphertext: vec![0xFF; 3],
            timestamp: DateTime::from_timestamp_millis(millis).unwrap(),
        }
    }

    #[test]
    fn handshake_offer_wire_shape() {
        let offer = HandshakeOffer {
            to: "bob".into(),
            from: "alice".into(),
            cipher_text: vec![0x01, 0x02, 0x03],
            signature: vec![0xAA, 0xBB],
        };

        let json = serde_json::to_string(&offer).unwrap();
        assert_eq!(
            json,
            r#"{"to":"bob","from":"alice","cipherText":"AQID","signature":"qrs="}"#
        );
    }

    #[test]
    fn peer_record_wire_shape() {
        let record = PeerRecord {
            username: "carol".into(),
            identity_key: vec![0x00, 0x01],
            kem_key: vec![0x02, 0x03],
        };

        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"username":"carol","identityKey":"AAE=","kemKey":"AgM="}"#);
    }

    #[test]
    fn encrypted_message_wire_shape() {
        // 2024-01-01T00:00:00.000Z
        let json = serde_json::to_string(&message_at(1_704_067_200_000)).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"to":"bob","from":"alice","nonce":"AQEB","ciphertext":"////","#,
                r#""timestamp":"2024-01-01T00:00:00.000Z"}"#
            )
        );
    }

    #[test]
    fn timestamp_always_carries_milliseconds() {
        // Whole-second instants still serialize with `.000`.
        let json = serde_json::to_string(&message_at(1_700_000_000_000)).unwrap();
        assert!(json.contains("2023-11-14T22:13:20.000Z"), "got {json}");

        let json = serde_json::to_string(&message_at(1_700_000_000_123)).unwrap();
        assert!(json.contains("2023-11-14T22:13:20.123Z"), "got {json}");
    }

    #[test]
    fn timestamp_offsets_normalize_to_utc() {
        let json = concat!(
            r#"{"to":"bob","from":"alice","nonce":"AQEB","ciphertext":"////","#,
            r#""timestamp":"2024-01-01T01:30:00.000+01:30"}"#
        );

        let message: EncryptedMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.timestamp, DateTime::from_timestamp_millis(1_704_067_200_000).unwrap());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let json = r#"{"username":"carol","identityKey":"not base64!","kemKey":"AgM="}"#;
        assert!(serde_json::from_str::<PeerRecord>(json).is_err());
    }

    #[test]
    fn invalid_timestamp_is_rejected() {
        let json = concat!(
            r#"{"to":"bob","from":"alice","nonce":"AQEB","ciphertext":"////","#,
            r#""timestamp":"yesterday"}"#
        );
        assert!(serde_json::from_str::<EncryptedMessage>(json).is_err());
    }

    #[test]
    fn missing_field_is_rejected() {
        let json = r#"{"to":"bob","cipherText":"AQID","signature":"qrs="}"#;
        assert!(serde_json::from_str::<HandshakeOffer>(json).is_err());
    }
}
