//! Wire protocol for Parley clients and relays.
//!
//! Everything on the wire is newline-delimited JSON: a tagged envelope
//! ([`ClientRequest`] or [`RelayEnvelope`]) wrapping untagged payload
//! objects ([`PeerRecord`], [`HandshakeOffer`], [`EncryptedMessage`]).
//! Payload shapes are network-frozen; see [`payloads`] for the rules.
//!
//! This crate does no I/O and no cryptography. It parses, validates, and
//! serializes — nothing that fails validation here may reach session
//! logic.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// ALPN protocol identifier negotiated on every QUIC connection.
pub const ALPN_PROTOCOL: &[u8] = b"parley";

mod b64;
pub mod envelope;
mod error;
pub mod payloads;

pub use envelope::{ClientRequest, MAX_ENVELOPE_SIZE, RelayEnvelope, decode_slice, encode_line};
pub use error::ProtoError;
pub use payloads::{EncryptedMessage, HandshakeOffer, PeerRecord};
