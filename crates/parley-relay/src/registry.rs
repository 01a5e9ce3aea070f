//! Peer registry: username ↔ session mapping plus published records.
//!
//! The registry maintains bidirectional mappings: username → session (for
//! routing forwards) and session → username (for cleanup on disconnect).
//! One live session per username; a join for a name already present is
//! refused rather than displacing the holder.

use std::collections::HashMap;

use parley_proto::PeerRecord;

/// Registry of joined peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// Username → published record
    records: HashMap<String, PeerRecord>,
    /// Username → session ID
    sessions: HashMap<String, u64>,
    /// Session ID → username (reverse index)
    usernames: HashMap<u64, String>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under the record's username.
    ///
    /// Returns `false` if:
    /// - the username is already taken, or
    /// - the session has already joined under some name
    pub fn register(&mut self, session_id: u64, record: PeerRecord) -> bool {
        if self.sessions.contains_key(&record.username)
            || self.usernames.contains_key(&session_id)
        {
            return false;
        }

        self.sessions.insert(record.username.clone(), session_id);
        self.usernames.insert(session_id, record.username.clone());
        self.records.insert(record.username.clone(), record);
        true
    }

    /// Unregister a session, returning the username it held, if any.
    pub fn unregister(&mut self, session_id: u64) -> Option<String> {
        let username = self.usernames.remove(&session_id)?;
        self.sessions.remove(&username);
        self.records.remove(&username);
        Some(username)
    }

    /// The record published under `username`.
    #[must_use]
    pub fn record(&self, username: &str) -> Option<&PeerRecord> {
        self.records.get(username)
    }

    /// The session currently holding `username`.
    #[must_use]
    pub fn session_for(&self, username: &str) -> Option<u64> {
        self.sessions.get(username).copied()
    }

    /// The username a session joined under.
    #[must_use]
    pub fn username_for(&self, session_id: u64) -> Option<&str> {
        self.usernames.get(&session_id).map(String::as_str)
    }

    /// Full roster, sorted by username for stable output.
    #[must_use]
    pub fn roster(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.records.values().cloned().collect();
        peers.sort_by(|a, b| a.username.cmp(&b.username));
        peers
    }

    /// Number of joined peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no peer has joined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
