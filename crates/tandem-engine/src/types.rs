//! Shared identifier types.

use std::sync::atomic::{AtomicU64, Ordering};

/// An authenticated principal (user/device actor), as issued by the
/// credential verifier.
pub type PrincipalId = String;

/// A swap request identifier.
pub type SwapId = u64;

/// A conversation identifier.
pub type ConversationId = u64;

/// A message identifier.
pub type MessageId = u64;

/// A notification identifier.
pub type NotificationId = u64;

/// A skill/workshop catalog identifier.
pub type CatalogId = u64;

/// Monotonic id sequence for an in-memory store.
#[derive(Debug)]
pub struct IdSequence(AtomicU64);

impl IdSequence {
    /// Create a sequence starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Take the next id.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Key for an unordered principal pair, used to index "the one active swap /
/// conversation between these two".
#[must_use]
pub fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_sequence() {
        let seq = IdSequence::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn test_pair_key_unordered() {
        assert_eq!(pair_key("alice", "bob"), pair_key("bob", "alice"));
        assert_ne!(pair_key("alice", "bob"), pair_key("alice", "carol"));
    }
}
