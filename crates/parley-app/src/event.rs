//! Application input events.
//!
//! [`AppEvent`]s drive the [`crate::App`] state machine. They originate
//! from the runtime (connection lifecycle) or from the [`crate::Bridge`]
//! translating engine activity; events that produce history lines carry
//! the wall-clock timestamp the bridge stamped them with.

use chrono::{DateTime, Utc};
use parley_client::ChannelStatus;

/// Events processed by the App state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// Connection attempt started.
    Connecting,

    /// Connected to the relay and joined.
    Connected,

    /// Connection failed or was lost.
    ConnectionFailed {
        /// Why.
        reason: String,
    },

    /// Full roster snapshot (local user already filtered out).
    RosterReceived {
        /// Peer usernames in the snapshot.
        usernames: Vec<String>,
        /// When the snapshot arrived.
        at: DateTime<Utc>,
    },

    /// A peer entered the roster.
    PeerJoined {
        /// The new peer.
        username: String,
        /// When they joined.
        at: DateTime<Utc>,
    },

    /// A peer left the roster.
    PeerLeft {
        /// The departed peer.
        username: String,
        /// When they left.
        at: DateTime<Utc>,
    },

    /// A peer's channel changed state.
    ChannelStatus {
        /// The peer.
        username: String,
        /// New channel state.
        status: ChannelStatus,
        /// When it changed.
        at: DateTime<Utc>,
    },

    /// A decrypted message arrived.
    MessageReceived {
        /// Sender username.
        from: String,
        /// Plaintext.
        text: String,
        /// Sender wall-clock send time.
        timestamp: DateTime<Utc>,
    },

    /// The local user's message was handed to the engine.
    MessageSent {
        /// Plaintext.
        text: String,
        /// When it was sent.
        timestamp: DateTime<Utc>,
    },

    /// Something went wrong.
    Error {
        /// Description for the status line.
        message: String,
    },
}
