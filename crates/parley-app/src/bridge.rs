//! Engine-to-application translation layer.
//!
//! The [`Bridge`] owns the sans-IO [`Engine`] and adapts it to the
//! application lifecycle: it turns [`AppAction`]s into engine events,
//! turns engine actions back into [`AppEvent`]s, and accumulates the
//! outbound [`ClientRequest`]s for the transport to send on the next
//! I/O cycle. Engine `Log` actions are relayed straight to `tracing`.

use chrono::{DateTime, Utc};
use parley_client::{
    DeliveryOutcome, Engine, EngineAction, EngineEvent, LogLevel,
};
use parley_core::Environment;
use parley_crypto::KemKeyPair;
use parley_proto::{ClientRequest, PeerRecord, RelayEnvelope};

use crate::{AppAction, AppEvent};

/// Bridge between the App and the session engine.
///
/// Generic over [`Environment`] so the same code runs in production and
/// under a virtual clock.
pub struct Bridge<E: Environment> {
    env: E,
    engine: Engine<E>,
    outgoing: Vec<ClientRequest>,
}

impl<E: Environment> Bridge<E> {
    /// Create a bridge for `username`, generating a fresh identity.
    pub fn new(env: E, username: impl Into<String>) -> Self {
        let engine = Engine::new(env.clone(), username);
        Self { env, engine, outgoing: Vec::new() }
    }

    /// Local username.
    pub fn username(&self) -> &str {
        self.engine.username()
    }

    /// Hand the freshly generated KEM keypair to the engine.
    ///
    /// Queues the join announcement and replays any offers that arrived
    /// while the keys were still being generated.
    pub fn set_keys(&mut self, keys: KemKeyPair) -> Vec<AppEvent> {
        let result = self.engine.handle(EngineEvent::KemKeysReady { keys });
        self.handle_engine_result(result)
    }

    /// Process an App action and return the resulting App events.
    pub fn process_app_action(&mut self, action: AppAction) -> Vec<AppEvent> {
        match action {
            AppAction::SendText { to, text } => {
                let result = self
                    .engine
                    .handle(EngineEvent::SendText { to, text: text.clone() });
                let mut events = self.handle_engine_result(result);

                // Echo the local message optimistically; the engine never
                // delivers our own traffic back to us.
                if !events.iter().any(|e| matches!(e, AppEvent::Error { .. })) {
                    events.push(AppEvent::MessageSent { text, timestamp: self.wall_now() });
                }
                events
            }
            AppAction::Broadcast { text } => {
                let result =
                    self.engine.handle(EngineEvent::Broadcast { text: text.clone() });
                let mut events = self.handle_engine_result(result);

                if !events.iter().any(|e| matches!(e, AppEvent::Error { .. })) {
                    events.push(AppEvent::MessageSent { text, timestamp: self.wall_now() });
                }
                events
            }
            AppAction::Render | AppAction::Quit | AppAction::Connect { .. } => vec![],
        }
    }

    /// Handle a pushed relay event.
    pub fn handle_envelope(&mut self, envelope: RelayEnvelope) -> Vec<AppEvent> {
        match envelope {
            RelayEnvelope::Receipt { .. } => {
                // Receipts answer requests on their own streams and come
                // through the outcome methods, never the event stream.
                tracing::warn!("ignoring receipt on the event stream");
                vec![]
            }
            RelayEnvelope::Roster { peers } => {
                let usernames: Vec<String> = peers
                    .iter()
                    .map(|p| p.username.clone())
                    .filter(|name| name != self.engine.username())
                    .collect();
                let mut events =
                    vec![AppEvent::RosterReceived { usernames, at: self.wall_now() }];
                let result = self.engine.handle(EngineEvent::RosterReceived { peers });
                events.extend(self.handle_engine_result(result));
                events
            }
            RelayEnvelope::PeerJoined { peer } => {
                let mut events = vec![AppEvent::PeerJoined {
                    username: peer.username.clone(),
                    at: self.wall_now(),
                }];
                let result = self.engine.handle(EngineEvent::PeerJoined { peer });
                events.extend(self.handle_engine_result(result));
                events
            }
            RelayEnvelope::PeerLeft { username } => {
                let mut events = vec![AppEvent::PeerLeft {
                    username: username.clone(),
                    at: self.wall_now(),
                }];
                let result = self.engine.handle(EngineEvent::PeerLeft { username });
                events.extend(self.handle_engine_result(result));
                events
            }
            RelayEnvelope::HandshakeDelivery { delivery, offer } => {
                let result = self.engine.handle(EngineEvent::OfferReceived { delivery, offer });
                self.handle_engine_result(result)
            }
            RelayEnvelope::MessageDelivery { delivery, message } => {
                let result =
                    self.engine.handle(EngineEvent::MessageReceived { delivery, message });
                self.handle_engine_result(result)
            }
        }
    }

    /// Feed the outcome of a forwarded handshake request.
    pub fn handle_offer_outcome(
        &mut self,
        username: impl Into<String>,
        outcome: DeliveryOutcome,
    ) -> Vec<AppEvent> {
        let result = self
            .engine
            .handle(EngineEvent::OfferOutcome { username: username.into(), outcome });
        self.handle_engine_result(result)
    }

    /// Feed the outcome of a forwarded message request.
    pub fn handle_message_outcome(
        &mut self,
        username: impl Into<String>,
        outcome: DeliveryOutcome,
    ) -> Vec<AppEvent> {
        let result = self
            .engine
            .handle(EngineEvent::MessageOutcome { username: username.into(), outcome });
        self.handle_engine_result(result)
    }

    /// Feed a directory lookup result.
    pub fn handle_lookup(
        &mut self,
        username: impl Into<String>,
        peer: Option<PeerRecord>,
    ) -> Vec<AppEvent> {
        let result = self
            .engine
            .handle(EngineEvent::LookupResolved { username: username.into(), peer });
        self.handle_engine_result(result)
    }

    /// Sweep the engine's deadlines.
    pub fn handle_tick(&mut self, now: E::Instant) -> Vec<AppEvent> {
        let result = self.engine.handle(EngineEvent::Tick { now });
        self.handle_engine_result(result)
    }

    /// Take the requests queued for the transport.
    pub fn take_outgoing(&mut self) -> Vec<ClientRequest> {
        std::mem::take(&mut self.outgoing)
    }

    fn wall_now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.env.wall_clock_millis() as i64).unwrap_or_default()
    }

    fn handle_engine_result(
        &mut self,
        result: Result<Vec<EngineAction>, parley_client::EngineError>,
    ) -> Vec<AppEvent> {
        match result {
            Ok(actions) => self.process_engine_actions(actions),
            Err(e) => vec![AppEvent::Error { message: e.to_string() }],
        }
    }

    fn process_engine_actions(&mut self, actions: Vec<EngineAction>) -> Vec<AppEvent> {
        let mut events = Vec::new();

        for action in actions {
            match action {
                EngineAction::Announce { record } => {
                    self.outgoing.push(ClientRequest::Join { record });
                }
                EngineAction::LookupPeer { username } => {
                    self.outgoing.push(ClientRequest::Lookup { username });
                }
                EngineAction::SendOffer { offer } => {
                    self.outgoing.push(ClientRequest::Handshake { offer });
                }
                EngineAction::SendMessage { message } => {
                    self.outgoing.push(ClientRequest::Message { message });
                }
                EngineAction::AckOffer { delivery, success, error } => {
                    self.outgoing.push(ClientRequest::HandshakeReceipt {
                        delivery,
                        success,
                        error,
                    });
                }
                EngineAction::AckMessage { delivery, success, error } => {
                    self.outgoing.push(ClientRequest::MessageReceipt {
                        delivery,
                        success,
                        error,
                    });
                }
                EngineAction::DeliverText { from, text, timestamp } => {
                    events.push(AppEvent::MessageReceived { from, text, timestamp });
                }
                EngineAction::ChannelStatusChanged { username, status } => {
                    events.push(AppEvent::ChannelStatus {
                        username,
                        status,
                        at: self.wall_now(),
                    });
                }
                EngineAction::Log { level, message } => match level {
                    LogLevel::Debug => tracing::debug!("{message}"),
                    LogLevel::Info => tracing::info!("{message}"),
                    LogLevel::Warn => tracing::warn!("{message}"),
                    LogLevel::Error => tracing::error!("{message}"),
                },
            }
        }

        events
    }
}
