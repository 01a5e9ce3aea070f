//! Fuzz target for relay envelope decoding
//!
//! Feeds arbitrary byte sequences to the wire decoder to find:
//! - Parser crashes or panics in serde_json
//! - Base64 payload fields that decode inconsistently
//! - Timestamps that parse but fail to re-serialize
//!
//! The decoder should NEVER panic. Invalid inputs return an error, and
//! anything that decodes must re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::{RelayEnvelope, envelope};

fuzz_target!(|data: &[u8]| {
    let Ok(decoded) = envelope::decode_slice::<RelayEnvelope>(data) else {
        return;
    };

    // Anything the decoder accepts must survive a round trip.
    let line = envelope::encode_line(&decoded).expect("decoded envelope must re-encode");
    let again = envelope::decode_slice::<RelayEnvelope>(&line)
        .expect("re-encoded envelope must decode");
    assert_eq!(decoded, again);
});
