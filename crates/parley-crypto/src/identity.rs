//! Long-term Ed25519 identity keys.
//!
//! The identity keypair authenticates which user produced a handshake offer,
//! independent of the per-session KEM keypair. It is generated once at login
//! and discarded at logout; the private half never leaves this crate.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::CryptoRngCore;

use crate::error::CryptoError;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Long-term signing identity for the local user.
///
/// The secret half zeroizes on drop and is redacted from `Debug` output.
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity keypair.
    ///
    /// Entropy failure inside the RNG is fatal to the caller; there is no
    /// degraded mode.
    pub fn generate(rng: &mut impl CryptoRngCore) -> Self {
        Self { signing: SigningKey::generate(rng) }
    }

    /// The public half, as transmitted in peer records.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign `message` with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_key())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Verify `signature` over `message` against a peer's identity public key.
///
/// # Errors
///
/// - [`CryptoError::InvalidKeyMaterial`] if `public_key` is not a valid
///   32-byte Ed25519 point
/// - [`CryptoError::AuthenticationFailed`] if the signature is malformed or
///   does not verify
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key_bytes: [u8; PUBLIC_KEY_SIZE] =
        public_key.try_into().map_err(|_| CryptoError::InvalidKeyMaterial {
            reason: format!(
                "identity key must be {PUBLIC_KEY_SIZE} bytes, got {}",
                public_key.len()
            ),
        })?;

    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKeyMaterial {
            reason: "identity key is not a valid ed25519 point".to_string(),
        })?;

    let signature = Signature::from_slice(signature).map_err(|_| {
        CryptoError::AuthenticationFailed { reason: "malformed signature".to_string() }
    })?;

    verifying_key.verify(message, &signature).map_err(|_| CryptoError::AuthenticationFailed {
        reason: "signature verification failed".to_string(),
    })
}
