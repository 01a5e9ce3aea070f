//! ML-KEM-768 key encapsulation, authenticated by identity signatures.
//!
//! A handshake offer carries the KEM ciphertext plus an Ed25519 signature
//! over it, so the receiver knows which identity produced the offer before
//! any secret is derived.
//!
//! # Security
//!
//! [`decapsulate`] verifies the signature BEFORE decapsulating. Acting on
//! unauthenticated ciphertext would let an attacker drive key derivation, so
//! the ordering is mandatory, not an optimization.

use kem::{Decapsulate, Encapsulate};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem768};
use rand_core::CryptoRngCore;
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::{self, IdentityKeyPair, SIGNATURE_SIZE},
};

type DecapsKey = <MlKem768 as KemCore>::DecapsulationKey;
type EncapsKey = <MlKem768 as KemCore>::EncapsulationKey;

/// Size of an encoded ML-KEM-768 encapsulation (public) key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 1184;

/// Size of an ML-KEM-768 ciphertext in bytes.
pub const CIPHERTEXT_SIZE: usize = 1088;

/// Size of the shared secret produced by encapsulation, in bytes.
pub const SHARED_SECRET_SIZE: usize = 32;

/// 32-byte symmetric key material derived via KEM exchange.
///
/// Keys one direction of one peer's message traffic. Zeroized on drop,
/// redacted from `Debug`.
pub struct SharedSecret {
    bytes: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    fn from_key(key: ml_kem::SharedKey<MlKem768>) -> Self {
        Self { bytes: key.into() }
    }

    /// Raw key bytes, for keying the AEAD.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.bytes
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").field("bytes", &"<redacted>").finish()
    }
}

/// Per-session ML-KEM-768 keypair.
///
/// Generated at login, held only in memory, discarded at logout. The secret
/// half zeroizes on drop (via `ml-kem`'s zeroize support) and never leaves
/// this crate.
pub struct KemKeyPair {
    decapsulation: DecapsKey,
    public: Vec<u8>,
}

impl KemKeyPair {
    /// Generate a fresh keypair from a securely-seeded generator.
    pub fn generate(rng: &mut impl CryptoRngCore) -> Self {
        let (decapsulation, encapsulation) = MlKem768::generate(rng);
        Self { decapsulation, public: encapsulation.as_bytes().to_vec() }
    }

    /// The encoded public half, as transmitted in peer records.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }
}

impl std::fmt::Debug for KemKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KemKeyPair")
            .field("public_len", &self.public.len())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Result of encapsulating against a peer's KEM public key.
#[derive(Debug)]
pub struct Encapsulation {
    /// KEM ciphertext the peer decapsulates to recover the secret.
    pub cipher_text: Vec<u8>,
    /// Identity signature over `cipher_text`, authenticating the sender.
    pub signature: [u8; SIGNATURE_SIZE],
    /// The derived secret, usable by the local side immediately.
    pub shared_secret: SharedSecret,
}

/// Encapsulate against `peer_kem_public` and sign the ciphertext.
///
/// # Errors
///
/// [`CryptoError::InvalidKeyMaterial`] if `peer_kem_public` is not an
/// encoded ML-KEM-768 encapsulation key.
pub fn encapsulate(
    peer_kem_public: &[u8],
    identity: &IdentityKeyPair,
    rng: &mut impl CryptoRngCore,
) -> Result<Encapsulation, CryptoError> {
    let encoded =
        Encoded::<EncapsKey>::try_from(peer_kem_public).map_err(|_| {
            CryptoError::InvalidKeyMaterial {
                reason: format!(
                    "KEM public key must be {PUBLIC_KEY_SIZE} bytes, got {}",
                    peer_kem_public.len()
                ),
            }
        })?;
    let encaps_key = EncapsKey::from_bytes(&encoded);

    let Ok((cipher_text, shared_key)) = encaps_key.encapsulate(rng) else {
        unreachable!("ML-KEM encapsulation is infallible for a parsed key");
    };

    let cipher_text = cipher_text.to_vec();
    let signature = identity.sign(&cipher_text);

    Ok(Encapsulation { cipher_text, signature, shared_secret: SharedSecret::from_key(shared_key) })
}

/// Verify `signature` over `cipher_text`, then decapsulate.
///
/// # Errors
///
/// - [`CryptoError::InvalidKeyMaterial`] if `peer_identity_public` is
///   malformed
/// - [`CryptoError::AuthenticationFailed`] if the signature does not verify
///   (the ciphertext is never decapsulated in that case)
/// - [`CryptoError::InvalidCiphertext`] if the authenticated ciphertext is
///   not a well-sized ML-KEM-768 ciphertext
pub fn decapsulate(
    cipher_text: &[u8],
    signature: &[u8],
    keys: &KemKeyPair,
    peer_identity_public: &[u8],
) -> Result<SharedSecret, CryptoError> {
    identity::verify(peer_identity_public, cipher_text, signature)?;

    let ct =
        Ciphertext::<MlKem768>::try_from(cipher_text).map_err(|_| {
            CryptoError::InvalidCiphertext {
                reason: format!(
                    "ciphertext must be {CIPHERTEXT_SIZE} bytes, got {}",
                    cipher_text.len()
                ),
            }
        })?;

    let Ok(shared_key) = keys.decapsulation.decapsulate(&ct) else {
        unreachable!("ML-KEM decapsulation is infallible for a well-sized ciphertext");
    };

    Ok(SharedSecret::from_key(shared_key))
}
