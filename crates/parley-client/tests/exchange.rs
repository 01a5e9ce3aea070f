//! End-to-end exchange tests: two engines wired through an in-memory
//! relay that forwards offers and messages and routes acknowledgments
//! back as delivery outcomes.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use parley_client::{Engine, EngineAction, EngineEvent, SessionStatus};
use parley_core::{Environment, MockEnv, MockInstant};
use parley_crypto::KemKeyPair;
use parley_proto::PeerRecord;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

enum ForwardKind {
    Offer,
    Message,
}

struct Forward {
    sender: String,
    kind: ForwardKind,
}

/// Two engines on a shared virtual clock, with a scripted relay between
/// them.
struct World {
    env: MockEnv,
    engines: Vec<(String, Engine<MockEnv>)>,
    inbox: VecDeque<(String, EngineEvent<MockInstant>)>,
    forwards: HashMap<u64, Forward>,
    next_delivery: u64,
    announced: Vec<PeerRecord>,
    /// (recipient, sender, text) in delivery order.
    delivered: Vec<(String, String, String)>,
    offers_forwarded: usize,
}

impl World {
    fn new(names: &[&str]) -> Self {
        let env = MockEnv::with_seed(0xA11CE);
        let mut world = Self {
            env: env.clone(),
            engines: Vec::new(),
            inbox: VecDeque::new(),
            forwards: HashMap::new(),
            next_delivery: 1,
            announced: Vec::new(),
            delivered: Vec::new(),
            offers_forwarded: 0,
        };
        let mut rng = ChaCha20Rng::seed_from_u64(0xBEEF);
        for name in names {
            let mut engine = Engine::new(env.clone(), *name);
            let keys = KemKeyPair::generate(&mut rng);
            let actions = engine.handle(EngineEvent::KemKeysReady { keys }).unwrap();
            world.engines.push((name.to_string(), engine));
            world.dispatch(name, actions);
        }
        world.run();
        world
    }

    fn engine(&self, name: &str) -> &Engine<MockEnv> {
        &self.engines.iter().find(|(n, _)| n == name).unwrap().1
    }

    fn feed(&mut self, name: &str, event: EngineEvent<MockInstant>) {
        self.inbox.push_back((name.to_string(), event));
        self.run();
    }

    /// Hand every engine the full announced roster.
    fn broadcast_roster(&mut self) {
        let peers = self.announced.clone();
        let names: Vec<String> = self.engines.iter().map(|(n, _)| n.clone()).collect();
        for name in names {
            self.inbox.push_back((name, EngineEvent::RosterReceived { peers: peers.clone() }));
        }
        self.run();
    }

    fn advance_and_tick(&mut self, duration: Duration) {
        self.env.advance(duration);
        let now = self.env.now();
        let names: Vec<String> = self.engines.iter().map(|(n, _)| n.clone()).collect();
        for name in names {
            self.inbox.push_back((name, EngineEvent::Tick { now }));
        }
        self.run();
    }

    /// Remove an engine from the world: the relay broadcasts the
    /// departure and eagerly rejects anything still addressed to it.
    fn remove(&mut self, name: &str) {
        self.engines.retain(|(n, _)| n != name);
        self.announced.retain(|record| record.username != name);
        let remaining: Vec<String> = self.engines.iter().map(|(n, _)| n.clone()).collect();
        for peer in remaining {
            self.inbox.push_back((peer, EngineEvent::PeerLeft { username: name.to_string() }));
        }
    }

    fn run(&mut self) {
        while let Some((name, event)) = self.inbox.pop_front() {
            let Some((_, engine)) = self.engines.iter_mut().find(|(n, _)| *n == name) else {
                continue;
            };
            let actions = engine.handle(event).unwrap();
            self.dispatch(&name, actions);
        }
    }

    fn alive(&self, name: &str) -> bool {
        self.engines.iter().any(|(n, _)| n == name)
    }

    fn dispatch(&mut self, origin: &str, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::Announce { record } => self.announced.push(record),
                EngineAction::SendOffer { offer } => {
                    if !self.alive(&offer.to) {
                        self.inbox.push_back((
                            origin.to_string(),
                            EngineEvent::OfferOutcome {
                                username: offer.to.clone(),
                                outcome: parley_client::DeliveryOutcome::Rejected {
                                    reason: "peer disconnected".to_string(),
                                },
                            },
                        ));
                        continue;
                    }
                    self.offers_forwarded += 1;
                    let delivery = self.next_delivery;
                    self.next_delivery += 1;
                    self.forwards.insert(
                        delivery,
                        Forward { sender: origin.to_string(), kind: ForwardKind::Offer },
                    );
                    let target = offer.to.clone();
                    self.inbox.push_back((target, EngineEvent::OfferReceived { delivery, offer }));
                }
                EngineAction::SendMessage { message } => {
                    if !self.alive(&message.to) {
                        self.inbox.push_back((
                            origin.to_string(),
                            EngineEvent::MessageOutcome {
                                username: message.to.clone(),
                                outcome: parley_client::DeliveryOutcome::Rejected {
                                    reason: "peer disconnected".to_string(),
                                },
                            },
                        ));
                        continue;
                    }
                    let delivery = self.next_delivery;
                    self.next_delivery += 1;
                    self.forwards.insert(
                        delivery,
                        Forward { sender: origin.to_string(), kind: ForwardKind::Message },
                    );
                    let target = message.to.clone();
                    self.inbox
                        .push_back((target, EngineEvent::MessageReceived { delivery, message }));
                }
                EngineAction::AckOffer { delivery, success, error }
                | EngineAction::AckMessage { delivery, success, error } => {
                    let Some(forward) = self.forwards.remove(&delivery) else { continue };
                    let outcome = if success {
                        parley_client::DeliveryOutcome::Acknowledged
                    } else {
                        parley_client::DeliveryOutcome::Rejected {
                            reason: error.unwrap_or_else(|| "rejected".to_string()),
                        }
                    };
                    let event = match forward.kind {
                        ForwardKind::Offer => EngineEvent::OfferOutcome {
                            username: origin.to_string(),
                            outcome,
                        },
                        ForwardKind::Message => EngineEvent::MessageOutcome {
                            username: origin.to_string(),
                            outcome,
                        },
                    };
                    self.inbox.push_back((forward.sender, event));
                }
                EngineAction::DeliverText { from, text, .. } => {
                    self.delivered.push((origin.to_string(), from, text));
                }
                EngineAction::LookupPeer { username } => {
                    let peer = self.announced.iter().find(|r| r.username == username).cloned();
                    self.inbox.push_back((
                        origin.to_string(),
                        EngineEvent::LookupResolved { username, peer },
                    ));
                }
                EngineAction::ChannelStatusChanged { .. } | EngineAction::Log { .. } => {}
            }
        }
    }
}

#[test]
fn tie_break_establishes_both_directions() {
    let mut world = World::new(&["alice", "bob"]);
    world.broadcast_roster();

    // Alice's initiator window closes at 1.5s; bob's responder timer is
    // still pending but his fallback later finds the channel established.
    world.advance_and_tick(Duration::from_millis(1500));

    assert_eq!(world.engine("alice").session_status("bob"), SessionStatus::Established);
    assert_eq!(world.engine("bob").session_status("alice"), SessionStatus::Established);

    // One initiation plus one reciprocal, nothing more after the fallback
    // window passes.
    assert_eq!(world.offers_forwarded, 2);
    world.advance_and_tick(Duration::from_secs(10));
    assert_eq!(world.offers_forwarded, 2);
}

#[test]
fn text_flows_both_ways_after_establishment() {
    let mut world = World::new(&["alice", "bob"]);
    world.broadcast_roster();
    world.advance_and_tick(Duration::from_millis(1500));

    world.feed("alice", EngineEvent::SendText { to: "bob".into(), text: "hi bob".into() });
    world.feed("bob", EngineEvent::SendText { to: "alice".into(), text: "hi alice".into() });

    assert_eq!(
        world.delivered,
        vec![
            ("bob".to_string(), "alice".to_string(), "hi bob".to_string()),
            ("alice".to_string(), "bob".to_string(), "hi alice".to_string()),
        ]
    );
}

#[test]
fn messages_sent_before_establishment_arrive_in_order() {
    let mut world = World::new(&["alice", "bob"]);
    world.broadcast_roster();

    // Queue three messages before any tick; the first send triggers the
    // exchange and the acknowledgment flushes the queue.
    for text in ["one", "two", "three"] {
        world
            .inbox
            .push_back(("alice".into(), EngineEvent::SendText { to: "bob".into(), text: text.into() }));
    }
    world.run();

    let texts: Vec<&str> = world
        .delivered
        .iter()
        .filter(|(recipient, _, _)| recipient == "bob")
        .map(|(_, _, text)| text.as_str())
        .collect();
    assert_eq!(texts, ["one", "two", "three"]);
}

#[test]
fn simultaneous_initiation_converges() {
    let mut world = World::new(&["alice", "bob"]);
    world.broadcast_roster();

    // Both sides send before seeing the other's offer: two initiations
    // cross on the wire.
    world
        .inbox
        .push_back(("alice".into(), EngineEvent::SendText { to: "bob".into(), text: "ping".into() }));
    world
        .inbox
        .push_back(("bob".into(), EngineEvent::SendText { to: "alice".into(), text: "pong".into() }));
    world.run();

    assert_eq!(world.engine("alice").session_status("bob"), SessionStatus::Established);
    assert_eq!(world.engine("bob").session_status("alice"), SessionStatus::Established);

    let mut texts: Vec<&str> = world.delivered.iter().map(|(_, _, text)| text.as_str()).collect();
    texts.sort_unstable();
    assert_eq!(texts, ["ping", "pong"]);
}

#[test]
fn broadcast_reaches_every_peer() {
    let mut world = World::new(&["alice", "bob", "carol"]);
    world.broadcast_roster();
    world.advance_and_tick(Duration::from_millis(1500));
    world.advance_and_tick(Duration::from_secs(5));

    world.feed("alice", EngineEvent::Broadcast { text: "hello all".into() });

    let mut recipients: Vec<&str> = world
        .delivered
        .iter()
        .filter(|(_, from, text)| from == "alice" && text == "hello all")
        .map(|(recipient, _, _)| recipient.as_str())
        .collect();
    recipients.sort_unstable();
    assert_eq!(recipients, ["bob", "carol"]);
}

#[test]
fn departure_mid_exchange_discards_cleanly() {
    let mut world = World::new(&["alice", "bob"]);
    world.broadcast_roster();

    // Alice's send starts an exchange, but bob is gone before anything
    // reaches him: the relay rejects the offer and the departure clears
    // alice's session, queue, and retry timer.
    world.inbox.push_back((
        "alice".into(),
        EngineEvent::SendText { to: "bob".into(), text: "anyone there?".into() },
    ));
    world.remove("bob");
    world.run();

    assert_eq!(world.engine("alice").pending_messages("bob"), 0);
    assert_eq!(world.engine("alice").session_status("bob"), SessionStatus::NoSecret);

    // No retries ever fire for the departed peer.
    world.advance_and_tick(Duration::from_secs(30));
    assert_eq!(world.offers_forwarded, 0);
}
