//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors produced by the cryptographic primitives.
///
/// Primitive errors are always surfaced to the caller, never downgraded to a
/// default value.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Supplied public-key material failed to parse.
    #[error("invalid key material: {reason}")]
    InvalidKeyMaterial {
        /// What was malformed about the key.
        reason: String,
    },

    /// A signature or AEAD authentication tag failed to verify.
    ///
    /// Always a security event: the input was tampered with, forged, or
    /// keyed with mismatched material. Never corruption to silently ignore.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed {
        /// Which check failed.
        reason: String,
    },

    /// KEM ciphertext is structurally invalid and cannot be decapsulated.
    #[error("invalid ciphertext: {reason}")]
    InvalidCiphertext {
        /// What was malformed about the ciphertext.
        reason: String,
    },

    /// Symmetric key is not exactly the cipher's key size.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required key size in bytes.
        expected: usize,
        /// Size of the key that was supplied.
        actual: usize,
    },
}

impl CryptoError {
    /// Whether this error indicates tampered or forged input.
    ///
    /// Security events must be logged and surfaced; the remaining variants
    /// are local usage errors (malformed material supplied by our own side
    /// or a buggy peer implementation).
    pub fn is_security_event(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}
