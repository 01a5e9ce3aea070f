//! Per-peer queues of plaintext awaiting channel establishment.
//!
//! Messages composed before a channel exists wait here in arrival order and
//! are sealed in one batch when the channel's send secret becomes available.
//! Plaintext never leaves the process through this type.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

/// One message waiting for its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Plaintext body.
    pub text: String,
    /// Wall-clock time the user sent it. Carried onto the wire so delivery
    /// order and composition time stay distinguishable.
    pub queued_at: DateTime<Utc>,
}

/// FIFO message queues, one per peer.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queues: HashMap<String, VecDeque<QueuedMessage>>,
}

impl PendingQueue {
    /// Create an empty queue set.
    #[must_use]
    pub fn new() -> Self {
        Self { queues: HashMap::new() }
    }

    /// Append a message to `peer`'s queue.
    pub fn enqueue(&mut self, peer: &str, message: QueuedMessage) {
        self.queues.entry(peer.to_string()).or_default().push_back(message);
    }

    /// Remove and return all of `peer`'s messages in arrival order.
    pub fn drain(&mut self, peer: &str) -> Vec<QueuedMessage> {
        self.queues.remove(peer).map(Vec::from).unwrap_or_default()
    }

    /// Discard `peer`'s queue, returning how many messages were dropped.
    pub fn drop_peer(&mut self, peer: &str) -> usize {
        self.queues.remove(peer).map_or(0, |queue| queue.len())
    }

    /// Number of messages waiting for `peer`.
    #[must_use]
    pub fn len(&self, peer: &str) -> usize {
        self.queues.get(peer).map_or(0, VecDeque::len)
    }

    /// Whether nothing is waiting for `peer`.
    #[must_use]
    pub fn is_empty(&self, peer: &str) -> bool {
        self.len(peer) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> QueuedMessage {
        QueuedMessage {
            text: text.to_string(),
            queued_at: DateTime::from_timestamp_millis(1_704_067_200_000).unwrap(),
        }
    }

    #[test]
    fn drain_preserves_arrival_order() {
        let mut queue = PendingQueue::new();
        queue.enqueue("bob", message("first"));
        queue.enqueue("bob", message("second"));
        queue.enqueue("bob", message("third"));

        let drained = queue.drain("bob");
        let texts: Vec<&str> = drained.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["first", "second", "third"]);
        assert!(queue.is_empty("bob"));
    }

    #[test]
    fn queues_are_independent_per_peer() {
        let mut queue = PendingQueue::new();
        queue.enqueue("bob", message("for bob"));
        queue.enqueue("carol", message("for carol"));

        assert_eq!(queue.len("bob"), 1);
        assert_eq!(queue.drain("carol").len(), 1);
        assert_eq!(queue.len("bob"), 1);
    }

    #[test]
    fn drop_peer_reports_discarded_count() {
        let mut queue = PendingQueue::new();
        queue.enqueue("bob", message("one"));
        queue.enqueue("bob", message("two"));

        assert_eq!(queue.drop_peer("bob"), 2);
        assert_eq!(queue.drop_peer("bob"), 0);
    }

    #[test]
    fn drain_of_unknown_peer_is_empty() {
        let mut queue = PendingQueue::new();
        assert!(queue.drain("nobody").is_empty());
    }
}
