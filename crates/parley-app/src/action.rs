//! Application side-effects and intents.
//!
//! [`AppAction`]s are instructions produced by the [`crate::App`] state
//! machine for the runtime to execute.

/// Actions produced by the App state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    /// Redraw the presentation.
    Render,

    /// Quit the application.
    Quit,

    /// Connect to a relay.
    Connect {
        /// Relay address (host:port).
        relay_addr: String,
    },

    /// Send a message to one peer.
    SendText {
        /// Recipient username.
        to: String,
        /// Plaintext to send.
        text: String,
    },

    /// Send a message to every rostered peer.
    Broadcast {
        /// Plaintext to send.
        text: String,
    },
}
