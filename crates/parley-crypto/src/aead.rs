//! Authenticated encryption for channel payloads.
//!
//! XChaCha20-Poly1305 under a KEM-derived shared secret. The 24-byte
//! extended nonce is drawn fresh from the caller's generator for every
//! message, so no counter state survives across messages or sessions.

use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce, aead::Aead};
use rand_core::CryptoRngCore;

use crate::error::CryptoError;

/// Size of the AEAD key in bytes. Matches the KEM shared secret.
pub const KEY_SIZE: usize = 32;

/// Size of the XChaCha20-Poly1305 nonce in bytes.
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 authentication tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// An encrypted payload and the nonce it was sealed under.
///
/// Both halves travel on the wire; neither is secret. The tag lives at the
/// end of `ciphertext`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedMessage {
    /// Random per-message nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext plus authentication tag.
    pub ciphertext: Vec<u8>,
}

impl SealedMessage {
    /// Reassemble a sealed message from wire-decoded parts.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidCiphertext`] if `nonce` is not exactly
    /// [`NONCE_SIZE`] bytes.
    pub fn from_parts(nonce: &[u8], ciphertext: Vec<u8>) -> Result<Self, CryptoError> {
        let nonce = nonce.try_into().map_err(|_| CryptoError::InvalidCiphertext {
            reason: format!("nonce must be {NONCE_SIZE} bytes, got {}", nonce.len()),
        })?;
        Ok(Self { nonce, ciphertext })
    }
}

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: key.len() });
    }
    Ok(XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key)))
}

/// Seal `plaintext` under `key` with a fresh random nonce.
///
/// # Errors
///
/// [`CryptoError::InvalidKeyLength`] if `key` is not [`KEY_SIZE`] bytes.
pub fn encrypt(
    plaintext: &[u8],
    key: &[u8],
    rng: &mut impl CryptoRngCore,
) -> Result<SealedMessage, CryptoError> {
    let cipher = cipher_for(key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption is infallible for in-memory buffers");
    };

    Ok(SealedMessage { nonce, ciphertext })
}

/// Open a sealed message, verifying its authentication tag.
///
/// # Errors
///
/// - [`CryptoError::InvalidKeyLength`] if `key` is not [`KEY_SIZE`] bytes
/// - [`CryptoError::AuthenticationFailed`] if the tag does not verify. The
///   caller must treat this as a security event, never as noise.
pub fn decrypt(sealed: &SealedMessage, key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for(key)?;
    cipher.decrypt(XNonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice()).map_err(|_| {
        CryptoError::AuthenticationFailed { reason: "message failed AEAD authentication".into() }
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn test_rng(seed: u64) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(seed)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let mut rng = test_rng(1);
        let key = [7u8; KEY_SIZE];

        let sealed = encrypt(b"hello bob", &key, &mut rng).unwrap();
        assert_eq!(sealed.ciphertext.len(), b"hello bob".len() + TAG_SIZE);

        let opened = decrypt(&sealed, &key).unwrap();
        assert_eq!(opened, b"hello bob");
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let mut rng = test_rng(2);
        let key = [7u8; KEY_SIZE];

        let sealed = encrypt(b"", &key, &mut rng).unwrap();
        assert_eq!(sealed.ciphertext.len(), TAG_SIZE);
        assert_eq!(decrypt(&sealed, &key).unwrap(), b"");
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let mut rng = test_rng(3);
        let sealed = encrypt(b"secret", &[1u8; KEY_SIZE], &mut rng).unwrap();

        let err = decrypt(&sealed, &[2u8; KEY_SIZE]).unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed { .. }));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let mut rng = test_rng(4);
        let key = [9u8; KEY_SIZE];
        let mut sealed = encrypt(b"secret", &key, &mut rng).unwrap();
        sealed.ciphertext[0] ^= 0x01;

        let err = decrypt(&sealed, &key).unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed { .. }));
    }

    #[test]
    fn tampered_nonce_fails_authentication() {
        let mut rng = test_rng(5);
        let key = [9u8; KEY_SIZE];
        let mut sealed = encrypt(b"secret", &key, &mut rng).unwrap();
        sealed.nonce[0] ^= 0x01;

        let err = decrypt(&sealed, &key).unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed { .. }));
    }

    #[test]
    fn short_key_reports_both_lengths() {
        let mut rng = test_rng(6);
        let err = encrypt(b"x", &[0u8; 16], &mut rng).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: 16 }
        ));

        let sealed = encrypt(b"x", &[0u8; KEY_SIZE], &mut rng).unwrap();
        let err = decrypt(&sealed, &[0u8; 64]).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: 64 }
        ));
    }

    #[test]
    fn from_parts_rejects_bad_nonce_length() {
        let err = SealedMessage::from_parts(&[0u8; 12], vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidCiphertext { .. }));
    }

    #[test]
    fn nonces_are_unique_per_message() {
        let mut rng = test_rng(7);
        let key = [3u8; KEY_SIZE];

        let first = encrypt(b"same plaintext", &key, &mut rng).unwrap();
        let second = encrypt(b"same plaintext", &key, &mut rng).unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary_plaintext(plaintext in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let mut rng = test_rng(8);
            let key = [42u8; KEY_SIZE];
            let sealed = encrypt(&plaintext, &key, &mut rng).unwrap();
            prop_assert_eq!(decrypt(&sealed, &key).unwrap(), plaintext);
        }

        #[test]
        fn any_flipped_bit_is_detected(
            plaintext in proptest::collection::vec(any::<u8>(), 1..512),
            position in any::<usize>(),
            bit in 0u8..8,
        ) {
            let mut rng = test_rng(9);
            let key = [42u8; KEY_SIZE];
            let mut sealed = encrypt(&plaintext, &key, &mut rng).unwrap();
            let index = position % sealed.ciphertext.len();
            sealed.ciphertext[index] ^= 1 << bit;
            prop_assert!(
                matches!(
                    decrypt(&sealed, &key),
                    Err(CryptoError::AuthenticationFailed { .. })
                ),
                "expected Err(CryptoError::AuthenticationFailed)"
            );
        }
    }
}
