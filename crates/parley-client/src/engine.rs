//! Session-establishment engine.
//!
//! [`Engine`] is a sans-IO state machine: it owns the roster, the session
//! store, and the pending message queues, and advances only through
//! [`Engine::handle`]. Drivers execute the returned actions and feed
//! outcomes back as events; a periodic [`EngineEvent::Tick`] fires deferred
//! initiations and retries.
//!
//! # Exchange protocol
//!
//! When two peers see each other in the roster, both schedule an
//! initiation, but the lexicographically smaller username gets a short
//! jittered delay and the larger a long one, so one side normally initiates
//! and the other's timer is cancelled by the arriving offer. Initiation is
//! optimistic: the sender derives and stores its send secret immediately,
//! and queued plaintext flushes once the offer is acknowledged end to end.
//! Failed deliveries retry with exponential backoff up to
//! [`MAX_ATTEMPTS`] total sends, resending the original signed ciphertext
//! so the stored secret stays valid.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use parley_core::Environment;
use parley_crypto::{IdentityKeyPair, KemKeyPair, SealedMessage, aead, kem};
use parley_proto::{EncryptedMessage, HandshakeOffer, PeerRecord};
use rand_core::{CryptoRng, RngCore};

use crate::{
    error::EngineError,
    event::{ChannelStatus, DeliveryOutcome, EngineAction, EngineEvent, LogLevel},
    queue::{PendingQueue, QueuedMessage},
    session::{InFlight, Scheduled, SessionStatus, SessionStore},
};

/// Maximum handshake sends (first attempt plus retries) before giving up.
pub const MAX_ATTEMPTS: u32 = 3;

// Tie-break delays. Roster arrivals jitter so a crowd of clients joining at
// once does not initiate in lockstep; single-peer join events use fixed
// delays.
const ROSTER_INITIATOR_DELAY: Duration = Duration::from_millis(500);
const ROSTER_INITIATOR_JITTER: Duration = Duration::from_millis(1000);
const ROSTER_RESPONDER_DELAY: Duration = Duration::from_millis(3000);
const ROSTER_RESPONDER_JITTER: Duration = Duration::from_millis(2000);
const JOIN_INITIATOR_DELAY: Duration = Duration::from_millis(1000);
const JOIN_RESPONDER_DELAY: Duration = Duration::from_millis(3500);

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}

/// Where a newly visible peer came from, which picks the delay table.
#[derive(Clone, Copy)]
enum PeerSource {
    Roster,
    Joined,
}

/// Sans-IO session engine for one logged-in user.
pub struct Engine<E: Environment> {
    env: E,
    username: String,
    identity: IdentityKeyPair,
    kem: Option<KemKeyPair>,
    peers: HashMap<String, PeerRecord>,
    sessions: SessionStore<E::Instant>,
    queue: PendingQueue,
    /// Offers that arrived before the KEM keypair was ready, in arrival
    /// order. Not acknowledged until replayed.
    held_offers: Vec<(u64, HandshakeOffer)>,
    /// Offers stalled on a peer-record lookup, keyed by sender.
    pending_lookups: HashMap<String, Vec<(u64, HandshakeOffer)>>,
}

impl<E: Environment> Engine<E> {
    /// Create an engine for `username`, generating a fresh identity
    /// keypair from the environment's entropy.
    pub fn new(env: E, username: impl Into<String>) -> Self {
        let identity = IdentityKeyPair::generate(&mut EnvRng(&env));
        Self {
            env,
            username: username.into(),
            identity,
            kem: None,
            peers: HashMap::new(),
            sessions: SessionStore::new(),
            queue: PendingQueue::new(),
            held_offers: Vec::new(),
            pending_lookups: HashMap::new(),
        }
    }

    /// The local username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether the session KEM keypair is ready.
    #[must_use]
    pub fn has_keys(&self) -> bool {
        self.kem.is_some()
    }

    /// Known peers, in no particular order.
    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Status of the channel to `username`.
    #[must_use]
    pub fn session_status(&self, username: &str) -> SessionStatus {
        self.sessions.get(username).map_or(SessionStatus::NoSecret, |entry| entry.status())
    }

    /// Most recent establishment failure for `username`, if any.
    #[must_use]
    pub fn last_error(&self, username: &str) -> Option<&str> {
        self.sessions.get(username).and_then(|entry| entry.last_error())
    }

    /// Number of messages queued for `username`.
    #[must_use]
    pub fn pending_messages(&self, username: &str) -> usize {
        self.queue.len(username)
    }

    /// Advance the engine by one event.
    ///
    /// # Errors
    ///
    /// [`EngineError::PeerUnknown`] if a [`EngineEvent::SendText`] names a
    /// peer absent from the roster. Wire-level trouble never surfaces as an
    /// error; it is reported through acknowledgment and log actions.
    pub fn handle(
        &mut self,
        event: EngineEvent<E::Instant>,
    ) -> Result<Vec<EngineAction>, EngineError> {
        match event {
            EngineEvent::KemKeysReady { keys } => Ok(self.handle_keys_ready(keys)),
            EngineEvent::RosterReceived { peers } => Ok(self.handle_roster(peers)),
            EngineEvent::PeerJoined { peer } => Ok(self.handle_peer_joined(peer)),
            EngineEvent::PeerLeft { username } => Ok(self.forget_peer(&username, "disconnected")),
            EngineEvent::OfferReceived { delivery, offer } => {
                Ok(self.process_offer(delivery, offer))
            }
            EngineEvent::MessageReceived { delivery, message } => {
                Ok(self.handle_message(delivery, message))
            }
            EngineEvent::LookupResolved { username, peer } => {
                Ok(self.handle_lookup_resolved(&username, peer))
            }
            EngineEvent::OfferOutcome { username, outcome } => {
                Ok(self.handle_offer_outcome(&username, outcome))
            }
            EngineEvent::MessageOutcome { username, outcome } => {
                Ok(self.handle_message_outcome(&username, &outcome))
            }
            EngineEvent::SendText { to, text } => self.handle_send_text(to, &text),
            EngineEvent::Broadcast { text } => Ok(self.handle_broadcast(&text)),
            EngineEvent::Tick { now } => Ok(self.handle_tick(now)),
        }
    }

    fn handle_keys_ready(&mut self, keys: KemKeyPair) -> Vec<EngineAction> {
        let record = PeerRecord {
            username: self.username.clone(),
            identity_key: self.identity.public_key().to_vec(),
            kem_key: keys.public_key().to_vec(),
        };
        self.kem = Some(keys);

        let mut actions = vec![
            EngineAction::log(
                LogLevel::Info,
                format!("session keys ready, joining as {}", self.username),
            ),
            EngineAction::Announce { record },
        ];

        let held = std::mem::take(&mut self.held_offers);
        for (delivery, offer) in held {
            actions.extend(self.process_offer(delivery, offer));
        }
        actions
    }

    fn handle_roster(&mut self, peers: Vec<PeerRecord>) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        let incoming: Vec<&str> = peers.iter().map(|record| record.username.as_str()).collect();
        let departed: Vec<String> = self
            .peers
            .keys()
            .filter(|known| !incoming.contains(&known.as_str()))
            .cloned()
            .collect();
        for username in departed {
            actions.extend(self.forget_peer(&username, "missing from roster"));
        }

        let others = peers.iter().filter(|record| record.username != self.username).count();
        actions.push(EngineAction::log(
            LogLevel::Info,
            format!("roster received: {others} other peer(s)"),
        ));

        for record in peers {
            if record.username == self.username {
                continue;
            }
            actions.extend(self.admit_peer(record, PeerSource::Roster));
        }
        actions
    }

    fn handle_peer_joined(&mut self, peer: PeerRecord) -> Vec<EngineAction> {
        let mut actions =
            vec![EngineAction::log(LogLevel::Info, format!("{} joined", peer.username))];
        actions.extend(self.admit_peer(peer, PeerSource::Joined));
        actions
    }

    /// Record a peer's keys and, unless an exchange already covers the
    /// channel, schedule a tie-broken initiation.
    fn admit_peer(&mut self, record: PeerRecord, source: PeerSource) -> Vec<EngineAction> {
        let username = record.username.clone();
        let initiator = self.username < username;
        self.peers.insert(username.clone(), record);

        let delay = match source {
            PeerSource::Roster if initiator => {
                ROSTER_INITIATOR_DELAY + self.env.random_jitter(ROSTER_INITIATOR_JITTER)
            }
            PeerSource::Roster => {
                ROSTER_RESPONDER_DELAY + self.env.random_jitter(ROSTER_RESPONDER_JITTER)
            }
            PeerSource::Joined if initiator => JOIN_INITIATOR_DELAY,
            PeerSource::Joined => JOIN_RESPONDER_DELAY,
        };
        let at = self.env.now();

        let entry = self.sessions.entry(&username);
        entry.last_error = None;
        if entry.send_secret.is_some() || entry.in_flight.is_some() || entry.scheduled.is_some() {
            return Vec::new();
        }
        entry.scheduled = Some(Scheduled { at, delay, attempt: 0 });

        vec![
            EngineAction::log(
                LogLevel::Debug,
                format!("scheduled key exchange with {username} in {}ms", delay.as_millis()),
            ),
            EngineAction::ChannelStatusChanged { username, status: ChannelStatus::Establishing },
        ]
    }

    /// Drop all state for a departed peer. Queued plaintext is discarded,
    /// secrets zeroize with the session entry, and any stalled deliveries
    /// from the peer are rejected.
    fn forget_peer(&mut self, username: &str, reason: &str) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        let known = self.peers.remove(username).is_some();
        let had_session = self.sessions.clear(username);
        let dropped = self.queue.drop_peer(username);

        if let Some(stalled) = self.pending_lookups.remove(username) {
            for (delivery, _) in stalled {
                actions.push(EngineAction::AckOffer {
                    delivery,
                    success: false,
                    error: Some("peer disconnected".to_string()),
                });
            }
        }
        let mut rejected_held = Vec::new();
        self.held_offers.retain(|(delivery, offer)| {
            if offer.from == username {
                rejected_held.push(*delivery);
                false
            } else {
                true
            }
        });
        for delivery in rejected_held {
            actions.push(EngineAction::AckOffer {
                delivery,
                success: false,
                error: Some("peer disconnected".to_string()),
            });
        }

        if dropped > 0 {
            actions.push(EngineAction::log(
                LogLevel::Warn,
                format!("dropped {dropped} queued message(s) for {username}"),
            ));
        }
        if known || had_session {
            actions.push(EngineAction::log(
                LogLevel::Info,
                format!("{username} {reason}; session state cleared"),
            ));
        }
        actions
    }

    /// Handle an inbound handshake offer, whether fresh or replayed.
    ///
    /// Every exit path except the held and stalled-on-lookup ones emits
    /// exactly one [`EngineAction::AckOffer`].
    fn process_offer(&mut self, delivery: u64, offer: HandshakeOffer) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        if offer.to != self.username {
            return vec![
                EngineAction::log(
                    LogLevel::Warn,
                    format!("discarding offer addressed to {} (from {})", offer.to, offer.from),
                ),
                EngineAction::AckOffer {
                    delivery,
                    success: false,
                    error: Some("offer not addressed to this user".to_string()),
                },
            ];
        }

        let from = offer.from.clone();

        // Idempotence: a channel we can already receive on needs no work,
        // and re-deriving would clobber the secret live traffic uses.
        if self.sessions.get(&from).is_some_and(|entry| entry.recv_secret.is_some()) {
            return vec![
                EngineAction::log(
                    LogLevel::Debug,
                    format!("duplicate offer from {from}, channel already established"),
                ),
                EngineAction::AckOffer { delivery, success: true, error: None },
            ];
        }

        let Some(keys) = self.kem.as_ref() else {
            actions.push(EngineAction::log(
                LogLevel::Info,
                format!("holding offer from {from} until session keys are ready"),
            ));
            self.held_offers.push((delivery, offer));
            return actions;
        };

        let Some(peer) = self.peers.get(&from) else {
            let stalled = self.pending_lookups.entry(from.clone()).or_default();
            let first = stalled.is_empty();
            stalled.push((delivery, offer));
            if first {
                actions.push(EngineAction::log(
                    LogLevel::Debug,
                    format!("offer from unknown peer {from}, requesting their record"),
                ));
                actions.push(EngineAction::LookupPeer { username: from });
            }
            return actions;
        };
        let peer_identity = peer.identity_key.clone();
        let peer_kem = peer.kem_key.clone();

        match kem::decapsulate(&offer.cipher_text, &offer.signature, keys, &peer_identity) {
            Err(e) => {
                let level = if e.is_security_event() { LogLevel::Error } else { LogLevel::Warn };
                actions.push(EngineAction::log(
                    level,
                    format!("rejecting handshake offer from {from}: {e}"),
                ));
                actions.push(EngineAction::AckOffer {
                    delivery,
                    success: false,
                    error: Some(e.to_string()),
                });
            }
            Ok(secret) => {
                let entry = self.sessions.entry(&from);
                entry.recv_secret = Some(secret);
                entry.scheduled = None;
                entry.last_error = None;
                let needs_reciprocal = entry.send_secret.is_none();

                actions
                    .push(EngineAction::log(LogLevel::Info, format!("accepted offer from {from}")));

                if needs_reciprocal {
                    match kem::encapsulate(&peer_kem, &self.identity, &mut EnvRng(&self.env)) {
                        Ok(reply) => {
                            let entry = self.sessions.entry(&from);
                            entry.send_secret = Some(reply.shared_secret);
                            entry.in_flight = Some(InFlight::Reciprocal);
                            actions.push(EngineAction::SendOffer {
                                offer: HandshakeOffer {
                                    to: from.clone(),
                                    from: self.username.clone(),
                                    cipher_text: reply.cipher_text,
                                    signature: reply.signature.to_vec(),
                                },
                            });
                            actions.push(EngineAction::ChannelStatusChanged {
                                username: from.clone(),
                                status: ChannelStatus::Secure,
                            });
                        }
                        // The channel still receives; the peer can retry or
                        // we recover on the next roster.
                        Err(e) => actions.push(EngineAction::log(
                            LogLevel::Warn,
                            format!("reciprocal handshake to {from} failed: {e}"),
                        )),
                    }
                }

                actions.extend(self.flush_queue(&from));
                actions.push(EngineAction::AckOffer { delivery, success: true, error: None });
            }
        }
        actions
    }

    fn handle_lookup_resolved(
        &mut self,
        username: &str,
        peer: Option<PeerRecord>,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let stalled = self.pending_lookups.remove(username).unwrap_or_default();

        match peer {
            Some(record) if record.username == username => {
                self.peers.insert(username.to_string(), record);
                actions.push(EngineAction::log(
                    LogLevel::Debug,
                    format!("resolved record for {username}"),
                ));
                for (delivery, offer) in stalled {
                    actions.extend(self.process_offer(delivery, offer));
                }
            }
            Some(record) => {
                actions.push(EngineAction::log(
                    LogLevel::Warn,
                    format!("lookup for {username} returned record for {}", record.username),
                ));
                for (delivery, _) in stalled {
                    actions.push(EngineAction::AckOffer {
                        delivery,
                        success: false,
                        error: Some("peer record mismatch".to_string()),
                    });
                }
            }
            None => {
                actions.push(EngineAction::log(
                    LogLevel::Warn,
                    format!("relay does not know peer {username}"),
                ));
                for (delivery, _) in stalled {
                    actions.push(EngineAction::AckOffer {
                        delivery,
                        success: false,
                        error: Some("unknown peer".to_string()),
                    });
                }
            }
        }
        actions
    }

    fn handle_message(&mut self, delivery: u64, message: EncryptedMessage) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        if message.to != self.username {
            return vec![
                EngineAction::log(
                    LogLevel::Warn,
                    format!(
                        "discarding message addressed to {} (from {})",
                        message.to, message.from
                    ),
                ),
                EngineAction::AckMessage {
                    delivery,
                    success: false,
                    error: Some("message not addressed to this user".to_string()),
                },
            ];
        }

        let from = message.from.clone();
        let opened = self
            .sessions
            .get(&from)
            .and_then(|entry| entry.recv_secret.as_ref())
            .map(|secret| {
                let sealed = SealedMessage::from_parts(&message.nonce, message.ciphertext.clone())?;
                aead::decrypt(&sealed, secret.as_bytes())
            });

        match opened {
            None => {
                actions.push(EngineAction::log(
                    LogLevel::Warn,
                    format!("no shared secret for {from}, dropping message"),
                ));
                actions.push(EngineAction::AckMessage {
                    delivery,
                    success: false,
                    error: Some("no shared secret".to_string()),
                });
            }
            Some(Ok(plaintext)) => {
                actions.push(EngineAction::DeliverText {
                    from,
                    text: String::from_utf8_lossy(&plaintext).into_owned(),
                    timestamp: message.timestamp,
                });
                actions.push(EngineAction::AckMessage { delivery, success: true, error: None });
            }
            Some(Err(e)) => {
                // A failed tag is either tampering or a key mismatch from a
                // half-completed exchange. Alert loudly either way.
                actions.push(EngineAction::log(
                    LogLevel::Error,
                    format!("failed to decrypt message from {from}: {e}"),
                ));
                actions.push(EngineAction::AckMessage {
                    delivery,
                    success: false,
                    error: Some(e.to_string()),
                });

                let completed =
                    self.sessions.get(&from).is_some_and(|entry| entry.completed());
                if self.username < from && !completed {
                    if let Some(entry) = self.sessions.get_mut(&from) {
                        entry.send_secret = None;
                        entry.recv_secret = None;
                        entry.in_flight = None;
                    }
                    actions.push(EngineAction::log(
                        LogLevel::Warn,
                        format!("restarting key exchange with {from} after decrypt failure"),
                    ));
                    actions.extend(self.initiate_now(&from, 0));
                }
            }
        }
        actions
    }

    fn handle_offer_outcome(
        &mut self,
        username: &str,
        outcome: DeliveryOutcome,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let Some(entry) = self.sessions.get_mut(username) else {
            return vec![EngineAction::log(
                LogLevel::Debug,
                format!("handshake outcome for unknown session {username}"),
            )];
        };

        match outcome {
            DeliveryOutcome::Acknowledged => {
                entry.in_flight = None;
                entry.completed = true;
                entry.last_error = None;
                actions.push(EngineAction::log(
                    LogLevel::Debug,
                    format!("handshake with {username} acknowledged"),
                ));
                actions.extend(self.flush_queue(username));
            }
            DeliveryOutcome::Rejected { .. } | DeliveryOutcome::TimedOut => {
                let reason = match outcome {
                    DeliveryOutcome::Rejected { reason } => reason,
                    _ => "delivery timed out".to_string(),
                };
                match entry.in_flight.take() {
                    None => actions.push(EngineAction::log(
                        LogLevel::Debug,
                        format!("stray handshake outcome for {username}: {reason}"),
                    )),
                    Some(InFlight::Reciprocal) => {
                        // The peer's own retries cover the channel.
                        actions.push(EngineAction::log(
                            LogLevel::Warn,
                            format!("reciprocal handshake to {username} failed: {reason}"),
                        ));
                    }
                    Some(InFlight::Initiation { attempt, cipher_text, signature }) => {
                        let next = attempt + 1;
                        if next < MAX_ATTEMPTS {
                            let delay = backoff(attempt);
                            entry.in_flight =
                                Some(InFlight::Initiation { attempt, cipher_text, signature });
                            entry.scheduled =
                                Some(Scheduled { at: self.env.now(), delay, attempt: next });
                            actions.push(EngineAction::log(
                                LogLevel::Warn,
                                format!(
                                    "handshake with {username} failed ({reason}), retrying in {}s",
                                    delay.as_secs()
                                ),
                            ));
                        } else {
                            // Terminal: drop the unconfirmed secret so a
                            // later send can start a fresh exchange.
                            entry.send_secret = None;
                            entry.scheduled = None;
                            entry.last_error = Some(reason.clone());
                            actions.push(EngineAction::log(
                                LogLevel::Error,
                                format!(
                                    "handshake with {username} failed after {MAX_ATTEMPTS} \
                                     attempts: {reason}"
                                ),
                            ));
                            actions.push(EngineAction::ChannelStatusChanged {
                                username: username.to_string(),
                                status: ChannelStatus::Failed { reason },
                            });
                        }
                    }
                }
            }
        }
        actions
    }

    fn handle_message_outcome(
        &mut self,
        username: &str,
        outcome: &DeliveryOutcome,
    ) -> Vec<EngineAction> {
        match outcome {
            DeliveryOutcome::Acknowledged => vec![EngineAction::log(
                LogLevel::Debug,
                format!("message to {username} delivered"),
            )],
            DeliveryOutcome::Rejected { reason } => vec![EngineAction::log(
                LogLevel::Warn,
                format!("message to {username} rejected: {reason}"),
            )],
            DeliveryOutcome::TimedOut => vec![EngineAction::log(
                LogLevel::Warn,
                format!("message to {username} timed out in delivery"),
            )],
        }
    }

    fn handle_send_text(
        &mut self,
        to: String,
        text: &str,
    ) -> Result<Vec<EngineAction>, EngineError> {
        if !self.peers.contains_key(&to) {
            return Err(EngineError::PeerUnknown { username: to });
        }
        Ok(self.send_to_peer(&to, text))
    }

    fn handle_broadcast(&mut self, text: &str) -> Vec<EngineAction> {
        let mut names: Vec<String> = self.peers.keys().cloned().collect();
        if names.is_empty() {
            return vec![EngineAction::log(LogLevel::Debug, "no peers to broadcast to")];
        }
        names.sort();

        let mut actions = Vec::new();
        for name in names {
            actions.extend(self.send_to_peer(&name, text));
        }
        actions
    }

    /// Seal and send immediately when the channel is up and nothing is
    /// queued ahead; otherwise queue (preserving order) and make sure an
    /// exchange is underway.
    fn send_to_peer(&mut self, to: &str, text: &str) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        if self.queue.is_empty(to) {
            if let Some(secret) =
                self.sessions.get(to).and_then(|entry| entry.send_secret.as_ref())
            {
                match aead::encrypt(text.as_bytes(), secret.as_bytes(), &mut EnvRng(&self.env)) {
                    Ok(sealed) => actions.push(EngineAction::SendMessage {
                        message: EncryptedMessage {
                            to: to.to_string(),
                            from: self.username.clone(),
                            nonce: sealed.nonce.to_vec(),
                            ciphertext: sealed.ciphertext,
                            timestamp: self.wall_now(),
                        },
                    }),
                    Err(e) => actions.push(EngineAction::log(
                        LogLevel::Warn,
                        format!("failed to encrypt message for {to}: {e}"),
                    )),
                }
                return actions;
            }
        }

        let queued_at = self.wall_now();
        self.queue.enqueue(to, QueuedMessage { text: text.to_string(), queued_at });
        actions.push(EngineAction::log(
            LogLevel::Debug,
            format!("queued message for {to} ({} pending)", self.queue.len(to)),
        ));

        let needs_exchange = self
            .sessions
            .get(to)
            .is_none_or(|entry| entry.send_secret.is_none() && entry.in_flight.is_none());
        if needs_exchange {
            actions.extend(self.initiate_now(to, 0));
        }
        actions
    }

    fn handle_tick(&mut self, now: E::Instant) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        for username in self.sessions.due(now) {
            let Some(entry) = self.sessions.get_mut(&username) else { continue };
            let Some(scheduled) = entry.scheduled.take() else { continue };

            let mut fresh = None;
            if let Some(InFlight::Initiation { attempt, cipher_text, signature }) =
                &mut entry.in_flight
            {
                // Retry: resend the exact signed ciphertext the stored
                // secret came from.
                *attempt = scheduled.attempt;
                actions.push(EngineAction::log(
                    LogLevel::Info,
                    format!(
                        "retrying key exchange with {username} (attempt {}/{MAX_ATTEMPTS})",
                        scheduled.attempt + 1
                    ),
                ));
                actions.push(EngineAction::SendOffer {
                    offer: HandshakeOffer {
                        to: username.clone(),
                        from: self.username.clone(),
                        cipher_text: cipher_text.clone(),
                        signature: signature.clone(),
                    },
                });
            } else {
                fresh = Some(scheduled.attempt);
            }
            if let Some(attempt) = fresh {
                actions.extend(self.initiate_now(&username, attempt));
            }
        }
        actions
    }

    /// Start a key exchange with `username` right now. No-op when a send
    /// secret already exists, so duplicate triggers are harmless.
    fn initiate_now(&mut self, username: &str, attempt: u32) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        let Some(peer) = self.peers.get(username) else {
            return vec![EngineAction::log(
                LogLevel::Debug,
                format!("skipping key exchange with departed peer {username}"),
            )];
        };
        let peer_kem = peer.kem_key.clone();

        let entry = self.sessions.entry(username);
        entry.scheduled = None;
        if entry.send_secret.is_some() {
            return vec![EngineAction::log(
                LogLevel::Debug,
                format!("already hold a send secret for {username}, skipping exchange"),
            )];
        }

        match kem::encapsulate(&peer_kem, &self.identity, &mut EnvRng(&self.env)) {
            Ok(encapsulation) => {
                let offer = HandshakeOffer {
                    to: username.to_string(),
                    from: self.username.clone(),
                    cipher_text: encapsulation.cipher_text.clone(),
                    signature: encapsulation.signature.to_vec(),
                };
                entry.send_secret = Some(encapsulation.shared_secret);
                entry.in_flight = Some(InFlight::Initiation {
                    attempt,
                    cipher_text: encapsulation.cipher_text,
                    signature: encapsulation.signature.to_vec(),
                });
                entry.last_error = None;
                actions.push(EngineAction::log(
                    LogLevel::Info,
                    format!(
                        "initiating key exchange with {username} (attempt {}/{MAX_ATTEMPTS})",
                        attempt + 1
                    ),
                ));
                actions.push(EngineAction::SendOffer { offer });
                actions.push(EngineAction::ChannelStatusChanged {
                    username: username.to_string(),
                    status: ChannelStatus::Secure,
                });
            }
            Err(e) => {
                entry.last_error = Some(e.to_string());
                actions.push(EngineAction::log(
                    LogLevel::Warn,
                    format!("cannot start key exchange with {username}: {e}"),
                ));
                actions.push(EngineAction::ChannelStatusChanged {
                    username: username.to_string(),
                    status: ChannelStatus::Failed { reason: e.to_string() },
                });
            }
        }
        actions
    }

    /// Seal and emit everything queued for `username`, in arrival order.
    /// Requires the send secret; silently a no-op otherwise.
    fn flush_queue(&mut self, username: &str) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        if self.queue.is_empty(username) {
            return actions;
        }
        let Some(secret) = self.sessions.get(username).and_then(|entry| entry.send_secret.as_ref())
        else {
            return actions;
        };

        let pending = self.queue.drain(username);
        let count = pending.len();
        for queued in pending {
            match aead::encrypt(queued.text.as_bytes(), secret.as_bytes(), &mut EnvRng(&self.env))
            {
                Ok(sealed) => actions.push(EngineAction::SendMessage {
                    message: EncryptedMessage {
                        to: username.to_string(),
                        from: self.username.clone(),
                        nonce: sealed.nonce.to_vec(),
                        ciphertext: sealed.ciphertext,
                        timestamp: queued.queued_at,
                    },
                }),
                Err(e) => actions.push(EngineAction::log(
                    LogLevel::Warn,
                    format!("failed to encrypt queued message for {username}: {e}"),
                )),
            }
        }
        actions.push(EngineAction::log(
            LogLevel::Debug,
            format!("flushed {count} queued message(s) to {username}"),
        ));
        actions
    }

    fn wall_now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.env.wall_clock_millis() as i64).unwrap_or_default()
    }
}

/// Bridges [`Environment`] randomness into the RustCrypto RNG traits.
struct EnvRng<'a, E: Environment>(&'a E);

impl<E: Environment> RngCore for EnvRng<'_, E> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.0.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        self.0.random_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.random_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.0.random_bytes(dest);
        Ok(())
    }
}

impl<E: Environment> CryptoRng for EnvRng<'_, E> {}

#[cfg(test)]
mod tests {
    use parley_core::MockEnv;
    use parley_crypto::SharedSecret;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    /// A scripted remote peer with real key material.
    struct TestPeer {
        name: &'static str,
        identity: IdentityKeyPair,
        kem: KemKeyPair,
    }

    impl TestPeer {
        fn new(name: &'static str, seed: u64) -> Self {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            Self {
                name,
                identity: IdentityKeyPair::generate(&mut rng),
                kem: KemKeyPair::generate(&mut rng),
            }
        }

        fn record(&self) -> PeerRecord {
            PeerRecord {
                username: self.name.to_string(),
                identity_key: self.identity.public_key().to_vec(),
                kem_key: self.kem.public_key().to_vec(),
            }
        }

        /// A genuine signed offer to `to`, encapsulated against their KEM
        /// public key. Returns the secret this peer would hold.
        fn offer_to(&self, to: &str, kem_public: &[u8], seed: u64) -> (HandshakeOffer, SharedSecret) {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let enc = kem::encapsulate(kem_public, &self.identity, &mut rng).unwrap();
            let offer = HandshakeOffer {
                to: to.to_string(),
                from: self.name.to_string(),
                cipher_text: enc.cipher_text,
                signature: enc.signature.to_vec(),
            };
            (offer, enc.shared_secret)
        }
    }

    /// An engine that has joined, plus its KEM public key so tests can
    /// craft inbound offers against it.
    fn ready_engine(name: &str, seed: u64) -> (Engine<MockEnv>, MockEnv, Vec<u8>) {
        let env = MockEnv::with_seed(seed);
        let mut engine = Engine::new(env.clone(), name);
        let mut rng = ChaCha20Rng::seed_from_u64(seed.wrapping_add(7000));
        let keys = KemKeyPair::generate(&mut rng);
        let public = keys.public_key().to_vec();
        engine.handle(EngineEvent::KemKeysReady { keys }).unwrap();
        (engine, env, public)
    }

    fn sent_offers(actions: &[EngineAction]) -> Vec<&HandshakeOffer> {
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::SendOffer { offer } => Some(offer),
                _ => None,
            })
            .collect()
    }

    fn sent_messages(actions: &[EngineAction]) -> Vec<&EncryptedMessage> {
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::SendMessage { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn offer_acks(actions: &[EngineAction]) -> Vec<(u64, bool)> {
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::AckOffer { delivery, success, .. } => Some((*delivery, *success)),
                _ => None,
            })
            .collect()
    }

    fn tick(engine: &mut Engine<MockEnv>, env: &MockEnv) -> Vec<EngineAction> {
        engine.handle(EngineEvent::Tick { now: env.now() }).unwrap()
    }

    #[test]
    fn keys_ready_announces_local_record() {
        let (engine, _env, _) = ready_engine("alice", 1);
        assert!(engine.has_keys());

        // Re-run construction to inspect the actions.
        let env = MockEnv::with_seed(1);
        let mut engine = Engine::new(env, "alice");
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let keys = KemKeyPair::generate(&mut rng);
        let actions = engine.handle(EngineEvent::KemKeysReady { keys }).unwrap();

        let record = actions
            .iter()
            .find_map(|action| match action {
                EngineAction::Announce { record } => Some(record),
                _ => None,
            })
            .expect("announce action");
        assert_eq!(record.username, "alice");
        assert_eq!(record.identity_key.len(), 32);
        assert_eq!(record.kem_key.len(), kem::PUBLIC_KEY_SIZE);
    }

    #[test]
    fn send_text_to_unknown_peer_errors() {
        let (mut engine, _env, _) = ready_engine("alice", 2);
        let err = engine
            .handle(EngineEvent::SendText { to: "ghost".into(), text: "hi".into() })
            .unwrap_err();
        assert!(matches!(err, EngineError::PeerUnknown { username } if username == "ghost"));
    }

    #[test]
    fn roster_initiator_fires_within_jitter_window() {
        let (mut engine, env, _) = ready_engine("alice", 3);
        let bob = TestPeer::new("bob", 30);

        let actions =
            engine.handle(EngineEvent::RosterReceived { peers: vec![bob.record()] }).unwrap();
        assert!(actions.contains(&EngineAction::ChannelStatusChanged {
            username: "bob".into(),
            status: ChannelStatus::Establishing,
        }));
        assert!(matches!(
            engine.session_status("bob"),
            SessionStatus::ExchangeInFlight { attempt: 0 }
        ));

        // Nothing fires before the minimum initiator delay.
        env.advance(Duration::from_millis(499));
        assert!(sent_offers(&tick(&mut engine, &env)).is_empty());

        // Delay is 500ms plus up to 1s of jitter.
        env.advance(Duration::from_millis(1001));
        let actions = tick(&mut engine, &env);
        let offers = sent_offers(&actions);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].to, "bob");
        assert_eq!(offers[0].from, "alice");
        assert_eq!(engine.session_status("bob"), SessionStatus::Established);
    }

    #[test]
    fn roster_responder_waits_longer() {
        let (mut engine, env, _) = ready_engine("zed", 4);
        let alice = TestPeer::new("alice", 40);

        engine.handle(EngineEvent::RosterReceived { peers: vec![alice.record()] }).unwrap();

        env.advance(Duration::from_millis(2999));
        assert!(sent_offers(&tick(&mut engine, &env)).is_empty());

        // Responder delay is 3s plus up to 2s of jitter.
        env.advance(Duration::from_millis(2001));
        assert_eq!(sent_offers(&tick(&mut engine, &env)).len(), 1);
    }

    #[test]
    fn established_channel_suppresses_further_initiation() {
        let (mut engine, env, _) = ready_engine("alice", 5);
        let bob = TestPeer::new("bob", 50);

        engine.handle(EngineEvent::RosterReceived { peers: vec![bob.record()] }).unwrap();
        env.advance(Duration::from_millis(1500));
        assert_eq!(sent_offers(&tick(&mut engine, &env)).len(), 1);

        // A fresh roster and plenty of time must not re-initiate.
        engine.handle(EngineEvent::RosterReceived { peers: vec![bob.record()] }).unwrap();
        env.advance(Duration::from_secs(10));
        assert!(sent_offers(&tick(&mut engine, &env)).is_empty());
    }

    #[test]
    fn messages_queue_until_ack_then_flush_in_order() {
        let (mut engine, _env, _) = ready_engine("alice", 6);
        let bob = TestPeer::new("bob", 60);
        engine.handle(EngineEvent::RosterReceived { peers: vec![bob.record()] }).unwrap();

        // First send initiates immediately and queues.
        let actions = engine
            .handle(EngineEvent::SendText { to: "bob".into(), text: "one".into() })
            .unwrap();
        assert_eq!(sent_offers(&actions).len(), 1);
        assert!(sent_messages(&actions).is_empty());

        // Later sends queue behind it even though the send secret exists.
        let actions = engine
            .handle(EngineEvent::SendText { to: "bob".into(), text: "two".into() })
            .unwrap();
        assert!(sent_messages(&actions).is_empty());
        assert_eq!(engine.pending_messages("bob"), 2);

        let actions = engine
            .handle(EngineEvent::OfferOutcome {
                username: "bob".into(),
                outcome: DeliveryOutcome::Acknowledged,
            })
            .unwrap();
        assert_eq!(sent_messages(&actions).len(), 2);
        assert_eq!(engine.pending_messages("bob"), 0);

        // With the queue empty, sends go straight out.
        let actions = engine
            .handle(EngineEvent::SendText { to: "bob".into(), text: "three".into() })
            .unwrap();
        assert_eq!(sent_messages(&actions).len(), 1);
    }

    #[test]
    fn retries_resend_the_same_ciphertext_with_backoff() {
        let (mut engine, env, _) = ready_engine("alice", 7);
        let bob = TestPeer::new("bob", 70);
        engine.handle(EngineEvent::RosterReceived { peers: vec![bob.record()] }).unwrap();

        env.advance(Duration::from_millis(1500));
        let first = sent_offers(&tick(&mut engine, &env))[0].clone();

        let timeout = || EngineEvent::OfferOutcome {
            username: "bob".into(),
            outcome: DeliveryOutcome::TimedOut,
        };

        // First failure: retry after 1s.
        engine.handle(timeout()).unwrap();
        env.advance(Duration::from_millis(999));
        assert!(sent_offers(&tick(&mut engine, &env)).is_empty());
        env.advance(Duration::from_millis(1));
        let second = sent_offers(&tick(&mut engine, &env))[0].clone();
        assert_eq!(second.cipher_text, first.cipher_text);
        assert_eq!(second.signature, first.signature);

        // Second failure: retry after 2s.
        engine.handle(timeout()).unwrap();
        env.advance(Duration::from_secs(2));
        let third = sent_offers(&tick(&mut engine, &env))[0].clone();
        assert_eq!(third.cipher_text, first.cipher_text);

        // Third failure is terminal.
        let actions = engine.handle(timeout()).unwrap();
        assert!(actions.iter().any(|action| matches!(
            action,
            EngineAction::ChannelStatusChanged { status: ChannelStatus::Failed { .. }, .. }
        )));
        assert_eq!(engine.session_status("bob"), SessionStatus::NoSecret);
        assert!(engine.last_error("bob").is_some());

        // No further sends without a new trigger.
        env.advance(Duration::from_secs(60));
        assert!(sent_offers(&tick(&mut engine, &env)).is_empty());
    }

    #[test]
    fn new_send_after_terminal_failure_starts_fresh_exchange() {
        let (mut engine, env, _) = ready_engine("alice", 8);
        let bob = TestPeer::new("bob", 80);
        engine.handle(EngineEvent::RosterReceived { peers: vec![bob.record()] }).unwrap();

        env.advance(Duration::from_millis(1500));
        tick(&mut engine, &env);
        for _ in 0..MAX_ATTEMPTS {
            engine
                .handle(EngineEvent::OfferOutcome {
                    username: "bob".into(),
                    outcome: DeliveryOutcome::TimedOut,
                })
                .unwrap();
            env.advance(Duration::from_secs(4));
            tick(&mut engine, &env);
        }
        assert_eq!(engine.session_status("bob"), SessionStatus::NoSecret);

        let actions = engine
            .handle(EngineEvent::SendText { to: "bob".into(), text: "still there?".into() })
            .unwrap();
        assert_eq!(sent_offers(&actions).len(), 1);
        assert_eq!(engine.session_status("bob"), SessionStatus::Established);
    }

    #[test]
    fn peer_departure_clears_state_and_cancels_timers() {
        let (mut engine, env, _) = ready_engine("alice", 9);
        let bob = TestPeer::new("bob", 90);
        engine.handle(EngineEvent::RosterReceived { peers: vec![bob.record()] }).unwrap();
        engine
            .handle(EngineEvent::SendText { to: "bob".into(), text: "hello".into() })
            .unwrap();
        assert_eq!(engine.pending_messages("bob"), 1);

        engine.handle(EngineEvent::PeerLeft { username: "bob".into() }).unwrap();
        assert_eq!(engine.pending_messages("bob"), 0);
        assert_eq!(engine.session_status("bob"), SessionStatus::NoSecret);

        env.advance(Duration::from_secs(30));
        assert!(sent_offers(&tick(&mut engine, &env)).is_empty());
    }

    #[test]
    fn inbound_offer_establishes_and_sends_reciprocal() {
        let (mut engine, _env, kem_public) = ready_engine("bob", 10);
        let alice = TestPeer::new("alice", 100);
        engine.handle(EngineEvent::RosterReceived { peers: vec![alice.record()] }).unwrap();

        let (offer, alice_secret) = alice.offer_to("bob", &kem_public, 101);
        let actions = engine.handle(EngineEvent::OfferReceived { delivery: 1, offer }).unwrap();

        assert_eq!(offer_acks(&actions), vec![(1, true)]);
        let reciprocal = sent_offers(&actions);
        assert_eq!(reciprocal.len(), 1);
        assert_eq!(reciprocal[0].to, "alice");
        assert_eq!(engine.session_status("alice"), SessionStatus::Established);

        // Traffic sealed under alice's secret now decrypts.
        let mut rng = ChaCha20Rng::seed_from_u64(102);
        let sealed = aead::encrypt(b"hi bob", alice_secret.as_bytes(), &mut rng).unwrap();
        let actions = engine
            .handle(EngineEvent::MessageReceived {
                delivery: 2,
                message: EncryptedMessage {
                    to: "bob".into(),
                    from: "alice".into(),
                    nonce: sealed.nonce.to_vec(),
                    ciphertext: sealed.ciphertext,
                    timestamp: DateTime::from_timestamp_millis(1_704_067_200_000).unwrap(),
                },
            })
            .unwrap();
        assert!(actions.iter().any(|action| matches!(
            action,
            EngineAction::DeliverText { from, text, .. } if from == "alice" && text == "hi bob"
        )));
    }

    #[test]
    fn duplicate_offer_acks_without_rederiving() {
        let (mut engine, _env, kem_public) = ready_engine("bob", 11);
        let alice = TestPeer::new("alice", 110);
        engine.handle(EngineEvent::RosterReceived { peers: vec![alice.record()] }).unwrap();

        let (offer, _) = alice.offer_to("bob", &kem_public, 111);
        engine
            .handle(EngineEvent::OfferReceived { delivery: 1, offer: offer.clone() })
            .unwrap();
        let actions = engine.handle(EngineEvent::OfferReceived { delivery: 2, offer }).unwrap();

        assert_eq!(offer_acks(&actions), vec![(2, true)]);
        assert!(sent_offers(&actions).is_empty());
    }

    #[test]
    fn tampered_offer_is_rejected_and_state_untouched() {
        let (mut engine, _env, kem_public) = ready_engine("bob", 12);
        let alice = TestPeer::new("alice", 120);
        engine.handle(EngineEvent::RosterReceived { peers: vec![alice.record()] }).unwrap();
        let before = engine.session_status("alice");

        let (mut offer, _) = alice.offer_to("bob", &kem_public, 121);
        offer.cipher_text[13] ^= 0x01;
        let actions = engine.handle(EngineEvent::OfferReceived { delivery: 5, offer }).unwrap();

        assert_eq!(offer_acks(&actions), vec![(5, false)]);
        assert!(actions.iter().any(|action| matches!(
            action,
            EngineAction::Log { level: LogLevel::Error, .. }
        )));
        assert_eq!(engine.session_status("alice"), before);
    }

    #[test]
    fn offer_held_until_keys_ready_then_replayed() {
        let env = MockEnv::with_seed(13);
        let mut engine = Engine::new(env, "bob");
        let alice = TestPeer::new("alice", 130);
        engine.handle(EngineEvent::RosterReceived { peers: vec![alice.record()] }).unwrap();

        let mut rng = ChaCha20Rng::seed_from_u64(131);
        let keys = KemKeyPair::generate(&mut rng);
        let (offer, _) = alice.offer_to("bob", keys.public_key(), 132);

        // Held: no acknowledgment yet.
        let actions = engine.handle(EngineEvent::OfferReceived { delivery: 9, offer }).unwrap();
        assert!(offer_acks(&actions).is_empty());

        let actions = engine.handle(EngineEvent::KemKeysReady { keys }).unwrap();
        assert_eq!(offer_acks(&actions), vec![(9, true)]);
        assert_eq!(engine.session_status("alice"), SessionStatus::Established);
    }

    #[test]
    fn offer_from_unknown_sender_waits_on_lookup() {
        let (mut engine, _env, kem_public) = ready_engine("bob", 14);
        let alice = TestPeer::new("alice", 140);

        let (offer, _) = alice.offer_to("bob", &kem_public, 141);
        let actions = engine.handle(EngineEvent::OfferReceived { delivery: 3, offer }).unwrap();
        assert!(offer_acks(&actions).is_empty());
        assert!(actions.contains(&EngineAction::LookupPeer { username: "alice".into() }));

        let actions = engine
            .handle(EngineEvent::LookupResolved {
                username: "alice".into(),
                peer: Some(alice.record()),
            })
            .unwrap();
        assert_eq!(offer_acks(&actions), vec![(3, true)]);
    }

    #[test]
    fn failed_lookup_rejects_stalled_offers() {
        let (mut engine, _env, kem_public) = ready_engine("bob", 15);
        let alice = TestPeer::new("alice", 150);

        let (offer, _) = alice.offer_to("bob", &kem_public, 151);
        engine.handle(EngineEvent::OfferReceived { delivery: 4, offer }).unwrap();
        let actions = engine
            .handle(EngineEvent::LookupResolved { username: "alice".into(), peer: None })
            .unwrap();
        assert_eq!(offer_acks(&actions), vec![(4, false)]);
    }

    #[test]
    fn misaddressed_envelopes_are_rejected() {
        let (mut engine, _env, kem_public) = ready_engine("bob", 16);
        let alice = TestPeer::new("alice", 160);
        engine.handle(EngineEvent::RosterReceived { peers: vec![alice.record()] }).unwrap();

        let (offer, _) = alice.offer_to("carol", &kem_public, 161);
        let actions = engine.handle(EngineEvent::OfferReceived { delivery: 6, offer }).unwrap();
        assert_eq!(offer_acks(&actions), vec![(6, false)]);
    }

    #[test]
    fn decrypt_failure_restarts_exchange_for_smaller_username() {
        // alice < bob, and no completed exchange yet: decrypt failure
        // clears the channel and re-initiates.
        let (mut engine, _env, kem_public) = ready_engine("alice", 17);
        let bob = TestPeer::new("bob", 170);
        engine.handle(EngineEvent::RosterReceived { peers: vec![bob.record()] }).unwrap();

        let (offer, _) = bob.offer_to("alice", &kem_public, 171);
        engine.handle(EngineEvent::OfferReceived { delivery: 1, offer }).unwrap();

        // Garbage sealed under some unrelated key.
        let mut rng = ChaCha20Rng::seed_from_u64(172);
        let sealed = aead::encrypt(b"???", &[9u8; 32], &mut rng).unwrap();
        let actions = engine
            .handle(EngineEvent::MessageReceived {
                delivery: 2,
                message: EncryptedMessage {
                    to: "alice".into(),
                    from: "bob".into(),
                    nonce: sealed.nonce.to_vec(),
                    ciphertext: sealed.ciphertext,
                    timestamp: DateTime::from_timestamp_millis(1_704_067_200_000).unwrap(),
                },
            })
            .unwrap();

        assert!(actions.iter().any(|action| matches!(
            action,
            EngineAction::AckMessage { delivery: 2, success: false, .. }
        )));
        // A fresh initiation went out.
        assert_eq!(sent_offers(&actions).len(), 1);
    }

    #[test]
    fn broadcast_fans_out_to_every_peer() {
        let (mut engine, _env, _) = ready_engine("alice", 18);
        let bob = TestPeer::new("bob", 180);
        let carol = TestPeer::new("carol", 181);
        engine
            .handle(EngineEvent::RosterReceived { peers: vec![bob.record(), carol.record()] })
            .unwrap();

        let actions = engine.handle(EngineEvent::Broadcast { text: "hello all".into() }).unwrap();
        assert_eq!(sent_offers(&actions).len(), 2);
        assert_eq!(engine.pending_messages("bob"), 1);
        assert_eq!(engine.pending_messages("carol"), 1);
    }
}
