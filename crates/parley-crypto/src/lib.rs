//! Parley Cryptographic Primitives
//!
//! Cryptographic building blocks for pairwise secure channels. Pure
//! functions over byte buffers; callers provide the RNG so tests can run
//! deterministically from a seed.
//!
//! # Channel Establishment
//!
//! Each participant holds a long-term Ed25519 identity keypair and a
//! per-session ML-KEM-768 keypair. A channel direction is keyed by
//! encapsulating against the receiving side's KEM public key and signing the
//! resulting ciphertext with the sender's identity key:
//!
//! ```text
//! Identity keypair (Ed25519)      KEM keypair (ML-KEM-768)
//!        │                               │
//!        │ sign(cipher_text)             │ encapsulate / decapsulate
//!        ▼                               ▼
//! Authenticated offer ────────▶ 32-byte shared secret
//!                                        │
//!                                        ▼
//!                        XChaCha20-Poly1305 message traffic
//! ```
//!
//! # Security
//!
//! - Authenticate-then-decapsulate: [`kem::decapsulate`] verifies the offer
//!   signature before touching the ciphertext; unauthenticated input is
//!   never decapsulated.
//! - Fresh nonces: [`aead::encrypt`] draws a random 24-byte nonce from the
//!   caller's CSPRNG on every call; nonces are never derived from counters.
//! - Key hygiene: shared secrets and KEM secret keys are zeroized on drop
//!   and redacted from `Debug` output.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
mod error;
pub mod identity;
pub mod kem;

pub use aead::SealedMessage;
pub use error::CryptoError;
pub use identity::IdentityKeyPair;
pub use kem::{Encapsulation, KemKeyPair, SharedSecret};
