//! Wire protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// An envelope could not be serialized.
    #[error("envelope encoding failed: {0}")]
    Encode(String),

    /// Bytes did not parse as a valid envelope.
    ///
    /// Covers malformed JSON, unknown `type` tags, missing fields, and
    /// fields that fail base64 or timestamp validation.
    #[error("envelope decoding failed: {0}")]
    Decode(String),

    /// An envelope exceeded the wire size limit.
    #[error("envelope too large: {size} bytes exceeds maximum {max}")]
    EnvelopeTooLarge {
        /// Size of the offending envelope in bytes.
        size: usize,
        /// The enforced limit.
        max: usize,
    },
}
