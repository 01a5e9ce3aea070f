//! Fuzz target for client request decoding
//!
//! The relay decodes every inbound stream with this path before any
//! state is touched, so it must hold up against:
//! - Malformed JSON and truncated lines
//! - Unknown tags and type confusion between variants
//! - Oversized or non-base64 key material
//!
//! The decoder should NEVER panic. Invalid inputs return an error, and
//! anything that decodes must re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::{ClientRequest, envelope};

fuzz_target!(|data: &[u8]| {
    let Ok(decoded) = envelope::decode_slice::<ClientRequest>(data) else {
        return;
    };

    let line = envelope::encode_line(&decoded).expect("decoded request must re-encode");
    let again = envelope::decode_slice::<ClientRequest>(&line)
        .expect("re-encoded request must decode");
    assert_eq!(decoded, again);
});
