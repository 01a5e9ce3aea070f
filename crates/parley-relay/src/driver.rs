//! Sans-IO relay driver.
//!
//! [`RelayDriver`] is the relay's entire brain: it consumes
//! [`RelayEvent`]s and returns [`RelayAction`]s for the runtime to
//! execute. It performs no I/O and reads no clocks beyond the injected
//! [`Environment`], so every forwarding and timeout path is testable on
//! a virtual clock.
//!
//! The relay never inspects payload contents. It stores published peer
//! records, forwards opaque offers and messages, and correlates each
//! forward with the recipient's end-to-end receipt so the sender learns
//! whether delivery actually succeeded.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use parley_core::Environment;
use parley_proto::{ClientRequest, PeerRecord, RelayEnvelope};

use crate::registry::PeerRegistry;

/// How long a forwarded delivery may wait for the recipient's receipt.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay driver configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum concurrent connections before new ones are refused.
    pub max_connections: usize,
    /// Receipt deadline for forwarded deliveries.
    pub delivery_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { max_connections: 10_000, delivery_timeout: DELIVERY_TIMEOUT }
    }
}

/// Log severity for [`RelayAction::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal operational events.
    Info,
    /// Unexpected but recoverable conditions.
    Warn,
    /// Failures needing attention.
    Error,
}

/// Inputs to the relay driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A new QUIC connection was accepted.
    ConnectionAccepted {
        /// Runtime-assigned session ID.
        session_id: u64,
    },

    /// One decoded request arrived on a client-opened stream.
    RequestReceived {
        /// Session the request came from.
        session_id: u64,
        /// Runtime-assigned ID correlating the eventual `Respond`.
        request_id: u64,
        /// The decoded request.
        request: ClientRequest,
    },

    /// A connection ended (graceful or not).
    ConnectionClosed {
        /// Session that went away.
        session_id: u64,
        /// Human-readable cause for logging.
        reason: String,
    },

    /// Periodic sweep for receipt deadlines.
    Tick,
}

/// Outputs of the relay driver, executed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    /// Answer a request on its originating stream.
    Respond {
        /// Session that sent the request.
        session_id: u64,
        /// The request being answered.
        request_id: u64,
        /// The receipt to write.
        receipt: RelayEnvelope,
    },

    /// Push an event to one session's event stream.
    Deliver {
        /// Target session.
        session_id: u64,
        /// The event to write.
        envelope: RelayEnvelope,
    },

    /// Push an event to every connected session except `exclude`.
    Broadcast {
        /// The event to write.
        envelope: RelayEnvelope,
        /// Session to skip, typically the one the event is about.
        exclude: Option<u64>,
    },

    /// Close a connection.
    CloseConnection {
        /// Session to close.
        session_id: u64,
        /// Reason sent in the close frame.
        reason: String,
    },

    /// Emit a log line.
    Log {
        /// Severity.
        level: LogLevel,
        /// The message.
        message: String,
    },
}

impl RelayAction {
    fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log { level, message: message.into() }
    }
}

/// What kind of payload a pending delivery carries.
#[derive(Debug, Clone, Copy)]
enum DeliveryKind {
    Handshake,
    Message,
}

impl DeliveryKind {
    fn label(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Message => "message",
        }
    }
}

/// A forwarded delivery awaiting the recipient's receipt.
struct PendingDelivery<I> {
    origin_session: u64,
    origin_request: u64,
    recipient_session: u64,
    kind: DeliveryKind,
    requested_at: I,
}

/// The relay's sans-IO state machine.
///
/// Owns the peer registry and the table of in-flight deliveries. The
/// runtime feeds it events and executes the returned actions; nothing
/// else mutates relay state.
pub struct RelayDriver<E: Environment> {
    env: E,
    config: RelayConfig,
    /// Accepted sessions, joined or not.
    connections: HashSet<u64>,
    registry: PeerRegistry,
    /// Delivery ID → in-flight forward.
    pending: HashMap<u64, PendingDelivery<E::Instant>>,
}

impl<E: Environment> RelayDriver<E> {
    /// Create a driver with the given environment and configuration.
    pub fn new(env: E, config: RelayConfig) -> Self {
        Self {
            env,
            config,
            connections: HashSet::new(),
            registry: PeerRegistry::new(),
            pending: HashMap::new(),
        }
    }

    /// Number of accepted connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of forwards still waiting on a receipt.
    #[must_use]
    pub fn pending_deliveries(&self) -> usize {
        self.pending.len()
    }

    /// Process one event, returning the actions to execute in order.
    pub fn process_event(&mut self, event: RelayEvent) -> Vec<RelayAction> {
        match event {
            RelayEvent::ConnectionAccepted { session_id } => self.handle_accepted(session_id),
            RelayEvent::RequestReceived { session_id, request_id, request } => {
                self.handle_request(session_id, request_id, request)
            }
            RelayEvent::ConnectionClosed { session_id, reason } => {
                self.handle_closed(session_id, &reason)
            }
            RelayEvent::Tick => self.handle_tick(),
        }
    }

    fn handle_accepted(&mut self, session_id: u64) -> Vec<RelayAction> {
        if self.connections.len() >= self.config.max_connections {
            return vec![
                RelayAction::log(
                    LogLevel::Warn,
                    format!("refusing session {session_id}: connection limit reached"),
                ),
                RelayAction::CloseConnection {
                    session_id,
                    reason: "connection limit reached".to_string(),
                },
            ];
        }

        self.connections.insert(session_id);
        vec![RelayAction::log(
            LogLevel::Debug,
            format!("session {session_id} connected ({} active)", self.connections.len()),
        )]
    }

    fn handle_request(
        &mut self,
        session_id: u64,
        request_id: u64,
        request: ClientRequest,
    ) -> Vec<RelayAction> {
        match request {
            ClientRequest::Join { record } => self.handle_join(session_id, request_id, record),
            ClientRequest::Lookup { username } => {
                self.handle_lookup(session_id, request_id, &username)
            }
            ClientRequest::Handshake { offer } => {
                let (to, from) = (offer.to.clone(), offer.from.clone());
                self.handle_forward(session_id, request_id, &to, &from, DeliveryKind::Handshake, |delivery| {
                    RelayEnvelope::HandshakeDelivery { delivery, offer }
                })
            }
            ClientRequest::Message { message } => {
                let (to, from) = (message.to.clone(), message.from.clone());
                self.handle_forward(session_id, request_id, &to, &from, DeliveryKind::Message, |delivery| {
                    RelayEnvelope::MessageDelivery { delivery, message }
                })
            }
            ClientRequest::HandshakeReceipt { delivery, success, error }
            | ClientRequest::MessageReceipt { delivery, success, error } => {
                self.handle_receipt(session_id, delivery, success, error)
            }
        }
    }

    /// Admit a peer: record → registry, roster → joiner, record →
    /// everyone else.
    fn handle_join(
        &mut self,
        session_id: u64,
        request_id: u64,
        record: PeerRecord,
    ) -> Vec<RelayAction> {
        if self.registry.username_for(session_id).is_some() {
            return vec![RelayAction::Respond {
                session_id,
                request_id,
                receipt: RelayEnvelope::rejected("already joined"),
            }];
        }

        let username = record.username.clone();
        if !self.registry.register(session_id, record.clone()) {
            return vec![
                RelayAction::log(
                    LogLevel::Info,
                    format!("join refused for {username}: username taken"),
                ),
                RelayAction::Respond {
                    session_id,
                    request_id,
                    receipt: RelayEnvelope::rejected("username taken"),
                },
            ];
        }

        vec![
            RelayAction::log(
                LogLevel::Info,
                format!("{username} joined ({} peers)", self.registry.len()),
            ),
            RelayAction::Respond { session_id, request_id, receipt: RelayEnvelope::accepted() },
            RelayAction::Deliver {
                session_id,
                envelope: RelayEnvelope::Roster { peers: self.registry.roster() },
            },
            RelayAction::Broadcast {
                envelope: RelayEnvelope::PeerJoined { peer: record },
                exclude: Some(session_id),
            },
        ]
    }

    fn handle_lookup(
        &mut self,
        session_id: u64,
        request_id: u64,
        username: &str,
    ) -> Vec<RelayAction> {
        let receipt = match self.registry.record(username) {
            Some(record) => RelayEnvelope::resolved(record.clone()),
            None => RelayEnvelope::rejected("peer not found"),
        };
        vec![RelayAction::Respond { session_id, request_id, receipt }]
    }

    /// Forward an opaque payload and park the request until the
    /// recipient's receipt (or the deadline) resolves it.
    fn handle_forward(
        &mut self,
        session_id: u64,
        request_id: u64,
        to: &str,
        from: &str,
        kind: DeliveryKind,
        envelope_for: impl FnOnce(u64) -> RelayEnvelope,
    ) -> Vec<RelayAction> {
        match self.registry.username_for(session_id) {
            None => {
                return vec![RelayAction::Respond {
                    session_id,
                    request_id,
                    receipt: RelayEnvelope::rejected("not joined"),
                }];
            }
            Some(username) if username != from => {
                return vec![
                    RelayAction::log(
                        LogLevel::Warn,
                        format!("session {session_id} ({username}) sent a {} claiming to be {from}", kind.label()),
                    ),
                    RelayAction::Respond {
                        session_id,
                        request_id,
                        receipt: RelayEnvelope::rejected("sender mismatch"),
                    },
                ];
            }
            Some(_) => {}
        }

        let Some(recipient_session) = self.registry.session_for(to) else {
            return vec![RelayAction::Respond {
                session_id,
                request_id,
                receipt: RelayEnvelope::rejected("peer not found"),
            }];
        };

        let delivery = self.env.random_u64();
        self.pending.insert(delivery, PendingDelivery {
            origin_session: session_id,
            origin_request: request_id,
            recipient_session,
            kind,
            requested_at: self.env.now(),
        });

        vec![
            RelayAction::log(
                LogLevel::Debug,
                format!("forwarding {} {from} -> {to} (delivery {delivery})", kind.label()),
            ),
            RelayAction::Deliver { session_id: recipient_session, envelope: envelope_for(delivery) },
        ]
    }

    /// Resolve a pending forward with the recipient's verdict.
    ///
    /// Only the recorded recipient may resolve a delivery; receipts from
    /// anyone else leave it pending for the deadline sweep.
    fn handle_receipt(
        &mut self,
        session_id: u64,
        delivery: u64,
        success: bool,
        error: Option<String>,
    ) -> Vec<RelayAction> {
        let Some(pending) = self.pending.get(&delivery) else {
            return vec![RelayAction::log(
                LogLevel::Debug,
                format!("stray receipt for delivery {delivery}"),
            )];
        };

        if pending.recipient_session != session_id {
            return vec![RelayAction::log(
                LogLevel::Warn,
                format!("session {session_id} sent a receipt for delivery {delivery} it did not receive"),
            )];
        }

        // Checked above, so the entry is present.
        let Some(pending) = self.pending.remove(&delivery) else {
            return Vec::new();
        };

        let receipt = if success {
            RelayEnvelope::accepted()
        } else {
            RelayEnvelope::rejected(error.unwrap_or_else(|| "delivery failed".to_string()))
        };

        vec![
            RelayAction::log(
                LogLevel::Debug,
                format!("{} delivery {delivery} resolved (success: {success})", pending.kind.label()),
            ),
            RelayAction::Respond {
                session_id: pending.origin_session,
                request_id: pending.origin_request,
                receipt,
            },
        ]
    }

    /// Tear down a departed session: unpublish, announce, and fail any
    /// deliveries that can no longer complete.
    fn handle_closed(&mut self, session_id: u64, reason: &str) -> Vec<RelayAction> {
        self.connections.remove(&session_id);

        let mut actions = vec![RelayAction::log(
            LogLevel::Debug,
            format!("session {session_id} closed: {reason}"),
        )];

        if let Some(username) = self.registry.unregister(session_id) {
            actions.push(RelayAction::log(
                LogLevel::Info,
                format!("{username} left ({} peers)", self.registry.len()),
            ));
            actions.push(RelayAction::Broadcast {
                envelope: RelayEnvelope::PeerLeft { username },
                exclude: Some(session_id),
            });
        }

        // Forwards waiting on the departed recipient fail now rather
        // than at the deadline; forwards it originated have no one left
        // to answer.
        let mut stalled: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.recipient_session == session_id)
            .map(|(id, _)| *id)
            .collect();
        stalled.sort_unstable();
        for id in stalled {
            if let Some(pending) = self.pending.remove(&id) {
                actions.push(RelayAction::Respond {
                    session_id: pending.origin_session,
                    request_id: pending.origin_request,
                    receipt: RelayEnvelope::rejected("peer disconnected"),
                });
            }
        }
        self.pending.retain(|_, p| p.origin_session != session_id);

        actions
    }

    /// Fail every pending delivery whose receipt deadline has lapsed.
    fn handle_tick(&mut self) -> Vec<RelayAction> {
        let now = self.env.now();
        let timeout = self.config.delivery_timeout;

        let mut due: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now - p.requested_at >= timeout)
            .map(|(id, _)| *id)
            .collect();
        due.sort_unstable();

        let mut actions = Vec::new();
        for id in due {
            if let Some(pending) = self.pending.remove(&id) {
                actions.push(RelayAction::log(
                    LogLevel::Warn,
                    format!("{} delivery {id} timed out", pending.kind.label()),
                ));
                actions.push(RelayAction::Respond {
                    session_id: pending.origin_session,
                    request_id: pending.origin_request,
                    receipt: RelayEnvelope::rejected("delivery timed out"),
                });
            }
        }
        actions
    }
}
