//! Per-peer session state.
//!
//! A session tracks one pairwise channel: the secret keying each traffic
//! direction, the handshake currently in flight (if any), and the deadline
//! of the next scheduled initiation. Entries hold the only copies of the
//! channel secrets; removing an entry zeroizes them via [`SharedSecret`]'s
//! drop.

use std::{collections::HashMap, time::Duration};

use parley_crypto::SharedSecret;

/// Observable state of one pairwise channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// No secret held and no exchange underway.
    NoSecret,
    /// An initiation is scheduled or retrying.
    ExchangeInFlight {
        /// Zero-based attempt counter for the next send.
        attempt: u32,
    },
    /// A send secret is held; outbound traffic can be sealed.
    Established,
}

/// A handshake offer awaiting its delivery outcome.
#[derive(Debug)]
pub(crate) enum InFlight {
    /// Locally initiated. The signed ciphertext is kept so retries resend
    /// the exact offer the stored secret was derived from.
    Initiation {
        /// Zero-based attempt counter for the outstanding send.
        attempt: u32,
        /// KEM ciphertext as first sent.
        cipher_text: Vec<u8>,
        /// Identity signature over `cipher_text`.
        signature: Vec<u8>,
    },
    /// Sent in response to an inbound offer. Never retried; the peer's
    /// initiation retries cover the channel.
    Reciprocal,
}

/// A deferred initiation: fires when `now - at >= delay`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scheduled<I> {
    /// When the schedule was set.
    pub(crate) at: I,
    /// How long to wait from `at`.
    pub(crate) delay: Duration,
    /// Attempt counter the initiation will carry.
    pub(crate) attempt: u32,
}

/// State for one peer's channel.
#[derive(Debug)]
pub struct SessionEntry<I> {
    /// Secret keying traffic we send to the peer.
    pub(crate) send_secret: Option<SharedSecret>,
    /// Secret keying traffic the peer sends us.
    pub(crate) recv_secret: Option<SharedSecret>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) scheduled: Option<Scheduled<I>>,
    pub(crate) last_error: Option<String>,
    /// Whether any exchange with this peer ever completed end to end.
    pub(crate) completed: bool,
}

impl<I> Default for SessionEntry<I> {
    fn default() -> Self {
        Self {
            send_secret: None,
            recv_secret: None,
            in_flight: None,
            scheduled: None,
            last_error: None,
            completed: false,
        }
    }
}

impl<I> SessionEntry<I> {
    /// Current status, derived from held state.
    ///
    /// `Established` is keyed off the send secret: an optimistic initiator
    /// counts as established the moment it derives its half.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        if self.send_secret.is_some() {
            return SessionStatus::Established;
        }
        match (&self.in_flight, &self.scheduled) {
            (Some(InFlight::Initiation { attempt, .. }), _) => {
                SessionStatus::ExchangeInFlight { attempt: *attempt }
            }
            (_, Some(scheduled)) => SessionStatus::ExchangeInFlight { attempt: scheduled.attempt },
            _ => SessionStatus::NoSecret,
        }
    }

    /// The most recent failure reason, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether any exchange with this peer ever completed end to end.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed
    }
}

/// All live sessions, keyed by peer username.
#[derive(Debug, Default)]
pub struct SessionStore<I> {
    entries: HashMap<String, SessionEntry<I>>,
}

impl<I> SessionStore<I> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// The entry for `username`, created empty if absent.
    pub fn entry(&mut self, username: &str) -> &mut SessionEntry<I> {
        self.entries.entry(username.to_string()).or_default()
    }

    /// The entry for `username`, if one exists.
    #[must_use]
    pub fn get(&self, username: &str) -> Option<&SessionEntry<I>> {
        self.entries.get(username)
    }

    pub(crate) fn get_mut(&mut self, username: &str) -> Option<&mut SessionEntry<I>> {
        self.entries.get_mut(username)
    }

    /// Remove all state for `username`, zeroizing any held secrets.
    ///
    /// Returns whether an entry existed. Removal also cancels the entry's
    /// scheduled initiation and in-flight tracking; there is no separate
    /// timer registry to unwind.
    pub fn clear(&mut self, username: &str) -> bool {
        self.entries.remove(username).is_some()
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no sessions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<I: Copy + std::ops::Sub<Output = Duration>> SessionStore<I> {
    /// Usernames whose scheduled initiation is due at `now`, sorted for
    /// deterministic sweep order.
    pub(crate) fn due(&self, now: I) -> Vec<String> {
        let mut due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.scheduled.is_some_and(|scheduled| now - scheduled.at >= scheduled.delay)
            })
            .map(|(username, _)| username.clone())
            .collect();
        due.sort();
        due
    }
}
