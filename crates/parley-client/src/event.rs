//! Events consumed and actions produced by the engine.
//!
//! The engine performs no I/O. A driver feeds it [`EngineEvent`]s (wire
//! deliveries, request outcomes, user input, clock ticks) and executes the
//! [`EngineAction`]s it returns: sending envelopes, acknowledging
//! deliveries, and surfacing results to the application.

use chrono::{DateTime, Utc};
use parley_crypto::KemKeyPair;
use parley_proto::{EncryptedMessage, HandshakeOffer, PeerRecord};

/// How a forwarded offer or message fared, as reported back to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The recipient accepted it.
    Acknowledged,
    /// The relay or recipient rejected it.
    Rejected {
        /// Reason given by the rejecting side.
        reason: String,
    },
    /// No outcome arrived within the delivery deadline.
    TimedOut,
}

/// Input to [`Engine::handle`](crate::Engine::handle).
///
/// `I` is the environment's instant type, carried by [`EngineEvent::Tick`].
#[derive(Debug)]
pub enum EngineEvent<I> {
    /// The session KEM keypair is ready; the engine can join the relay.
    KemKeysReady {
        /// Freshly generated per-session keypair.
        keys: KemKeyPair,
    },

    /// Full roster snapshot from the relay.
    RosterReceived {
        /// Every registered peer, possibly including the local user.
        peers: Vec<PeerRecord>,
    },

    /// A peer entered the roster.
    PeerJoined {
        /// The new peer's record.
        peer: PeerRecord,
    },

    /// A peer left the roster.
    PeerLeft {
        /// The departed peer's username.
        username: String,
    },

    /// A handshake offer was delivered to this client.
    OfferReceived {
        /// Relay-assigned id to echo in the acknowledgment.
        delivery: u64,
        /// The forwarded offer.
        offer: HandshakeOffer,
    },

    /// An encrypted message was delivered to this client.
    MessageReceived {
        /// Relay-assigned id to echo in the acknowledgment.
        delivery: u64,
        /// The forwarded message.
        message: EncryptedMessage,
    },

    /// A [`EngineAction::LookupPeer`] request resolved.
    LookupResolved {
        /// The username that was looked up.
        username: String,
        /// The published record, or `None` if the relay does not know the
        /// peer (including lookup failure or timeout).
        peer: Option<PeerRecord>,
    },

    /// Outcome of a previously emitted [`EngineAction::SendOffer`].
    OfferOutcome {
        /// The offer's recipient.
        username: String,
        /// How the delivery fared.
        outcome: DeliveryOutcome,
    },

    /// Outcome of a previously emitted [`EngineAction::SendMessage`].
    MessageOutcome {
        /// The message's recipient.
        username: String,
        /// How the delivery fared.
        outcome: DeliveryOutcome,
    },

    /// The user composed a message for one peer.
    SendText {
        /// Recipient username.
        to: String,
        /// Plaintext body.
        text: String,
    },

    /// The user composed a message for every known peer.
    Broadcast {
        /// Plaintext body.
        text: String,
    },

    /// Periodic clock tick; fires due initiations and retries.
    Tick {
        /// Current monotonic time.
        now: I,
    },
}

/// User-visible state of one channel, reported via
/// [`EngineAction::ChannelStatusChanged`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// An exchange is scheduled or underway.
    Establishing,
    /// Outbound traffic can be sealed.
    Secure,
    /// Establishment gave up after exhausting retries.
    Failed {
        /// Reason for the terminal failure.
        reason: String,
    },
}

/// Log severity for [`EngineAction::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Routine progress.
    Info,
    /// Recoverable problem.
    Warn,
    /// Failure or security event.
    Error,
}

/// Output of [`Engine::handle`](crate::Engine::handle), executed by the
/// driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Publish the local record and join the relay.
    Announce {
        /// Username plus public identity and KEM keys.
        record: PeerRecord,
    },

    /// Ask the relay for a peer's published record.
    LookupPeer {
        /// Username to resolve.
        username: String,
    },

    /// Forward a handshake offer via the relay.
    SendOffer {
        /// The signed encapsulation to deliver.
        offer: HandshakeOffer,
    },

    /// Forward an encrypted message via the relay.
    SendMessage {
        /// The sealed payload to deliver.
        message: EncryptedMessage,
    },

    /// Report the outcome of an offer delivery back to the relay.
    AckOffer {
        /// Id from the corresponding [`EngineEvent::OfferReceived`].
        delivery: u64,
        /// Whether the offer was accepted.
        success: bool,
        /// Failure reason when `success` is false.
        error: Option<String>,
    },

    /// Report the outcome of a message delivery back to the relay.
    AckMessage {
        /// Id from the corresponding [`EngineEvent::MessageReceived`].
        delivery: u64,
        /// Whether the message decrypted.
        success: bool,
        /// Failure reason when `success` is false.
        error: Option<String>,
    },

    /// Hand a decrypted message to the application.
    DeliverText {
        /// Sender username.
        from: String,
        /// Decrypted body.
        text: String,
        /// Sender's wall-clock send time.
        timestamp: DateTime<Utc>,
    },

    /// A channel's user-visible status changed.
    ChannelStatusChanged {
        /// The peer the channel belongs to.
        username: String,
        /// The new status.
        status: ChannelStatus,
    },

    /// Emit a log line.
    Log {
        /// Severity.
        level: LogLevel,
        /// Message text.
        message: String,
    },
}

impl EngineAction {
    pub(crate) fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log { level, message: message.into() }
    }
}
