//! Engine error types.

use parley_crypto::CryptoError;
use thiserror::Error;

/// Errors returned by [`Engine::handle`](crate::Engine::handle).
///
/// Recoverable trouble (failed decryptions, rejected offers, departed
/// peers) is reported through actions, not errors; an `Err` here means the
/// event itself could not be acted on.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The named peer is not in the roster.
    #[error("unknown peer: {username}")]
    PeerUnknown {
        /// The username that could not be resolved.
        username: String,
    },

    /// A cryptographic operation failed.
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

impl EngineError {
    /// Whether this error indicates possible tampering rather than a
    /// plumbing problem.
    #[must_use]
    pub fn is_security_event(&self) -> bool {
        match self {
            Self::Crypto(e) => e.is_security_event(),
            Self::PeerUnknown { .. } => false,
        }
    }
}
