//! Observable application state types.
//!
//! The "view model" side of the application: what a presentation layer
//! needs to render a roster, a message history, and a status line,
//! without any cryptographic detail leaking through.

use chrono::{DateTime, Utc};
use parley_client::ChannelStatus;

/// High-level connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected to a relay.
    Disconnected,
    /// Connection in progress.
    Connecting,
    /// Connected and joined.
    Connected,
    /// Connection failed or was lost.
    Error(String),
}

/// One peer in the roster, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    /// The peer's username.
    pub username: String,
    /// Channel state for the status indicator.
    pub status: ChannelStatus,
}

/// One line of the message history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Sender username; empty for system notices.
    pub from: String,
    /// Plaintext content.
    pub text: String,
    /// When it was sent (sender wall clock) or noticed.
    pub timestamp: DateTime<Utc>,
    /// Whether the local user sent it.
    pub own: bool,
    /// Whether this is a system notice rather than a chat message.
    pub system: bool,
}

impl HistoryEntry {
    /// A chat message line.
    #[must_use]
    pub fn message(
        from: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
        own: bool,
    ) -> Self {
        Self { from: from.into(), text: text.into(), timestamp, own, system: false }
    }

    /// A system notice line.
    #[must_use]
    pub fn notice(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { from: String::new(), text: text.into(), timestamp, own: false, system: true }
    }
}
