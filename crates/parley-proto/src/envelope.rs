//! Tagged envelopes exchanged between clients and the relay.
//!
//! Every envelope is one JSON object on one line, discriminated by a
//! `type` field. Clients open a bidirectional stream per request and read
//! exactly one receipt back; the relay pushes events over a single
//! relay-opened unidirectional stream.
//!
//! # Security
//!
//! Envelopes are validated here, at the transport boundary, before
//! anything reaches session logic: unknown tags, missing fields, bad
//! base64, and oversized lines are all rejected by [`decode_slice`].

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::ProtoError,
    payloads::{EncryptedMessage, HandshakeOffer, PeerRecord},
};

/// Maximum size of one encoded envelope, in bytes.
///
/// Generous for the largest legitimate envelope (a handshake offer with a
/// 1088-byte ciphertext is ~1.6 KiB encoded) while bounding what a peer
/// can make the decoder chew on.
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Client-to-relay requests.
///
/// Each request travels alone on a client-opened bidirectional stream and
/// is answered by exactly one [`RelayEnvelope::Receipt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Publish the local peer record and enter the roster.
    Join {
        /// The joining peer's username and public keys.
        record: PeerRecord,
    },

    /// Ask for a peer's published record.
    Lookup {
        /// Username to resolve.
        username: String,
    },

    /// Forward a handshake offer to `offer.to`.
    Handshake {
        /// The signed encapsulation to deliver.
        offer: HandshakeOffer,
    },

    /// Forward an encrypted message to `message.to`.
    Message {
        /// The sealed payload to deliver.
        message: EncryptedMessage,
    },

    /// End-to-end outcome of a handshake delivery, sent by the recipient.
    HandshakeReceipt {
        /// The relay-assigned id from the corresponding delivery.
        delivery: u64,
        /// Whether the recipient accepted the offer.
        success: bool,
        /// Failure reason when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// End-to-end outcome of a message delivery, sent by the recipient.
    MessageReceipt {
        /// The relay-assigned id from the corresponding delivery.
        delivery: u64,
        /// Whether the recipient decrypted the message.
        success: bool,
        /// Failure reason when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Relay-to-client envelopes: request receipts and pushed events.
///
/// `Receipt` answers a request on its bidirectional stream; every other
/// variant arrives on the persistent event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEnvelope {
    /// Outcome of the request carried on the same stream.
    Receipt {
        /// Whether the request was accepted (and, for forwards, delivered).
        success: bool,
        /// Failure reason when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// The record a successful `lookup` resolved to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<PeerRecord>,
    },

    /// Full roster snapshot, sent once immediately after a successful join.
    Roster {
        /// Every currently-registered peer, including the receiver.
        peers: Vec<PeerRecord>,
    },

    /// A new peer entered the roster.
    PeerJoined {
        /// The new peer's record.
        peer: PeerRecord,
    },

    /// A peer disconnected or logged out.
    PeerLeft {
        /// The departed peer's username.
        username: String,
    },

    /// A handshake offer forwarded to this client.
    HandshakeDelivery {
        /// Id to echo back in the handshake receipt.
        delivery: u64,
        /// The forwarded offer.
        offer: HandshakeOffer,
    },

    /// An encrypted message forwarded to this client.
    MessageDelivery {
        /// Id to echo back in the message receipt.
        delivery: u64,
        /// The forwarded message.
        message: EncryptedMessage,
    },
}

impl RelayEnvelope {
    /// A receipt reporting plain success.
    #[must_use]
    pub fn accepted() -> Self {
        Self::Receipt { success: true, error: None, peer: None }
    }

    /// A successful lookup receipt carrying the resolved record.
    #[must_use]
    pub fn resolved(peer: PeerRecord) -> Self {
        Self::Receipt { success: true, error: None, peer: Some(peer) }
    }

    /// A receipt reporting failure with a reason.
    #[must_use]
    pub fn rejected(error: impl Into<String>) -> Self {
        Self::Receipt { success: false, error: Some(error.into()), peer: None }
    }
}

/// Encode an envelope as one newline-terminated JSON line.
///
/// JSON string escaping guarantees the body itself never contains a raw
/// newline, so the trailing `\n` is an unambiguous frame delimiter.
///
/// # Errors
///
/// `ProtoError::Encode` if serialization fails.
pub fn encode_line<T: Serialize>(envelope: &T) -> Result<Vec<u8>, ProtoError> {
    let mut line = serde_json::to_vec(envelope).map_err(|e| ProtoError::Encode(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one envelope from a line's bytes.
///
/// The size check runs before the parser touches the input. A trailing
/// newline is tolerated.
///
/// # Errors
///
/// - `ProtoError::EnvelopeTooLarge` if `bytes` exceeds [`MAX_ENVELOPE_SIZE`]
/// - `ProtoError::Decode` if the bytes are not a valid envelope
pub fn decode_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtoError> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtoError::EnvelopeTooLarge { size: bytes.len(), max: MAX_ENVELOPE_SIZE });
    }
    serde_json::from_slice(bytes).map_err(|e| ProtoError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> PeerRecord {
        PeerRecord { username: "alice".into(), identity_key: vec![1; 4], kem_key: vec![2; 4] }
    }

    #[test]
    fn requests_are_tagged_snake_case() {
        let json = serde_json::to_string(&ClientRequest::Lookup { username: "bob".into() })
            .unwrap();
        assert_eq!(json, r#"{"type":"lookup","username":"bob"}"#);

        let json = serde_json::to_string(&ClientRequest::HandshakeReceipt {
            delivery: 7,
            success: true,
            error: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"handshake_receipt","delivery":7,"success":true}"#);
    }

    #[test]
    fn join_nests_the_record_payload() {
        let json =
            serde_json::to_string(&ClientRequest::Join { record: sample_record() }).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"type":"join","record":{"username":"alice","#,
                r#""identityKey":"AQEBAQ==","kemKey":"AgICAg=="}}"#
            )
        );
    }

    #[test]
    fn receipt_omits_empty_fields() {
        let json = serde_json::to_string(&RelayEnvelope::accepted()).unwrap();
        assert_eq!(json, r#"{"type":"receipt","success":true}"#);

        let json = serde_json::to_string(&RelayEnvelope::rejected("username taken")).unwrap();
        assert_eq!(json, r#"{"type":"receipt","success":false,"error":"username taken"}"#);
    }

    #[test]
    fn lookup_receipt_carries_the_record() {
        let envelope = RelayEnvelope::resolved(sample_record());
        let line = encode_line(&envelope).unwrap();
        let decoded: RelayEnvelope = decode_slice(&line).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = decode_slice::<ClientRequest>(br#"{"type":"shutdown"}"#).unwrap_err();
        assert!(matches!(err, ProtoError::Decode(_)));
    }

    #[test]
    fn missing_tag_is_rejected() {
        let err = decode_slice::<ClientRequest>(br#"{"username":"bob"}"#).unwrap_err();
        assert!(matches!(err, ProtoError::Decode(_)));
    }

    #[test]
    fn oversized_envelope_is_rejected_before_parsing() {
        let huge = vec![b'x'; MAX_ENVELOPE_SIZE + 1];
        let err = decode_slice::<RelayEnvelope>(&huge).unwrap_err();
        assert!(matches!(err, ProtoError::EnvelopeTooLarge { .. }));
    }

    #[test]
    fn encode_line_terminates_with_newline() {
        let line = encode_line(&ClientRequest::Lookup { username: "bob".into() }).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn decode_tolerates_trailing_newline() {
        let line = encode_line(&RelayEnvelope::PeerLeft { username: "bob".into() }).unwrap();
        let decoded: RelayEnvelope = decode_slice(&line).unwrap();
        assert_eq!(decoded, RelayEnvelope::PeerLeft { username: "bob".into() });
    }
}
