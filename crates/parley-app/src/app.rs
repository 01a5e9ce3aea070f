//! Application state machine.
//!
//! [`App`] manages what the user sees — connection state, roster with
//! channel indicators, message history, status line — completely
//! decoupled from I/O and protocol mechanics. It consumes
//! [`AppEvent`]s and produces [`AppAction`]s for the runtime to
//! execute; all timestamps arrive on the events, so the machine itself
//! never reads a clock.

use std::collections::BTreeMap;

use parley_client::ChannelStatus;

use crate::{AppAction, AppEvent, ConnectionState, HistoryEntry, RosterEntry};

/// Application state machine.
///
/// Pure: no I/O dependencies, fully testable without a runtime.
#[derive(Debug, Clone)]
pub struct App {
    /// Local username.
    username: String,
    /// Relay address for connection.
    relay_addr: String,
    /// Connection state.
    state: ConnectionState,
    /// Roster, sorted by username.
    roster: BTreeMap<String, ChannelStatus>,
    /// Ordered message history, system notices included.
    history: Vec<HistoryEntry>,
    /// Transient status line. `None` if nothing to show.
    status_message: Option<String>,
}

impl App {
    /// Create a new App for `username` talking to `relay_addr`.
    pub fn new(username: impl Into<String>, relay_addr: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            relay_addr: relay_addr.into(),
            state: ConnectionState::Disconnected,
            roster: BTreeMap::new(),
            history: Vec::new(),
            status_message: None,
        }
    }

    /// Process an event and return actions.
    pub fn handle(&mut self, event: AppEvent) -> Vec<AppAction> {
        match event {
            AppEvent::Connecting => {
                self.state = ConnectionState::Connecting;
            }
            AppEvent::Connected => {
                self.state = ConnectionState::Connected;
                self.status_message = Some(format!("connected as {}", self.username));
            }
            AppEvent::ConnectionFailed { reason } => {
                self.status_message = Some(format!("connection failed: {reason}"));
                self.state = ConnectionState::Error(reason);
            }
            AppEvent::RosterReceived { usernames, at: _ } => {
                // Keep channel indicators for peers still present.
                let mut roster = BTreeMap::new();
                for username in usernames {
                    let status = self
                        .roster
                        .remove(&username)
                        .unwrap_or(ChannelStatus::Establishing);
                    roster.insert(username, status);
                }
                self.roster = roster;
            }
            AppEvent::PeerJoined { username, at } => {
                self.roster.entry(username.clone()).or_insert(ChannelStatus::Establishing);
                self.history.push(HistoryEntry::notice(format!("{username} joined"), at));
            }
            AppEvent::PeerLeft { username, at } => {
                if self.roster.remove(&username).is_some() {
                    self.history.push(HistoryEntry::notice(format!("{username} left"), at));
                }
            }
            AppEvent::ChannelStatus { username, status, at } => {
                match &status {
                    ChannelStatus::Secure => {
                        self.history.push(HistoryEntry::notice(
                            format!("secure channel with {username} established"),
                            at,
                        ));
                    }
                    ChannelStatus::Failed { reason } => {
                        self.history.push(HistoryEntry::notice(
                            format!("channel with {username} failed: {reason}"),
                            at,
                        ));
                        self.status_message =
                            Some(format!("channel with {username} failed: {reason}"));
                    }
                    ChannelStatus::Establishing => {}
                }
                self.roster.insert(username, status);
            }
            AppEvent::MessageReceived { from, text, timestamp } => {
                let own = from == self.username;
                self.history.push(HistoryEntry::message(from, text, timestamp, own));
            }
            AppEvent::MessageSent { text, timestamp } => {
                let from = self.username.clone();
                self.history.push(HistoryEntry::message(from, text, timestamp, true));
            }
            AppEvent::Error { message } => {
                self.status_message = Some(format!("error: {message}"));
            }
        }
        vec![AppAction::Render]
    }

    /// Initiate connection to the relay.
    pub fn connect(&mut self) -> Vec<AppAction> {
        self.state = ConnectionState::Connecting;
        vec![AppAction::Connect { relay_addr: self.relay_addr.clone() }, AppAction::Render]
    }

    /// Send a message to one peer.
    pub fn send(&self, to: impl Into<String>, text: impl Into<String>) -> Vec<AppAction> {
        vec![AppAction::SendText { to: to.into(), text: text.into() }, AppAction::Render]
    }

    /// Send a message to everyone in the roster.
    pub fn broadcast(&self, text: impl Into<String>) -> Vec<AppAction> {
        vec![AppAction::Broadcast { text: text.into() }, AppAction::Render]
    }

    /// Quit the application.
    pub fn quit(&self) -> Vec<AppAction> {
        vec![AppAction::Quit]
    }

    /// Local username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Relay address (host:port).
    pub fn relay_addr(&self) -> &str {
        &self.relay_addr
    }

    /// Current connection state.
    pub fn connection_state(&self) -> &ConnectionState {
        &self.state
    }

    /// Roster entries, sorted by username.
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.roster
            .iter()
            .map(|(username, status)| RosterEntry {
                username: username.clone(),
                status: status.clone(),
            })
            .collect()
    }

    /// Full message history in arrival order.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Transient status line. `None` if nothing to show.
    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }
}
