//! Channel abstraction for the live layer.
//!
//! Channels are named broadcast groups. The marketplace uses four families
//! (`user:{id}`, `conversation:{id}`, `workshop:{id}`, `swap:{id}`) plus the
//! reserved global `presence` channel every authenticated connection joins.

use crate::event::LiveEvent;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// The global presence channel.
pub const PRESENCE_CHANNEL: &str = "presence";

/// A channel identifier.
pub type ChannelId = String;

/// Personal channel for a principal.
#[must_use]
pub fn user_channel(principal_id: &str) -> ChannelId {
    format!("user:{principal_id}")
}

/// Channel for a conversation room.
#[must_use]
pub fn conversation_channel(conversation_id: u64) -> ChannelId {
    format!("conversation:{conversation_id}")
}

/// Channel for a workshop room.
#[must_use]
pub fn workshop_channel(workshop_id: u64) -> ChannelId {
    format!("workshop:{workshop_id}")
}

/// Channel for a swap session room.
#[must_use]
pub fn swap_channel(swap_id: u64) -> ChannelId {
    format!("swap:{swap_id}")
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// A channel for live-event fan-out.
#[derive(Debug)]
pub struct Channel {
    /// Channel name.
    name: ChannelId,
    /// Broadcast sender for this channel.
    sender: broadcast::Sender<Arc<LiveEvent>>,
    /// Set of joined connection IDs.
    members: HashSet<String>,
}

impl Channel {
    /// Create a new channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new channel with a specific capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<ChannelId>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            members: HashSet::new(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of joined connections.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection has joined.
    #[must_use]
    pub fn is_member(&self, connection_id: &str) -> bool {
        self.members.contains(connection_id)
    }

    /// Join a connection to this channel.
    ///
    /// Returns a receiver for events on this channel. Joining twice is
    /// idempotent for membership but hands back a fresh receiver.
    pub fn join(&mut self, connection_id: impl Into<String>) -> broadcast::Receiver<Arc<LiveEvent>> {
        let conn_id = connection_id.into();
        self.members.insert(conn_id.clone());
        debug!(channel = %self.name, connection = %conn_id, "Connection joined");
        self.sender.subscribe()
    }

    /// Remove a connection from this channel.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&mut self, connection_id: &str) -> bool {
        let removed = self.members.remove(connection_id);
        if removed {
            debug!(channel = %self.name, connection = %connection_id, "Connection left");
        }
        removed
    }

    /// Publish an event to this channel.
    ///
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: LiveEvent) -> usize {
        let evt = Arc::new(event);
        trace!(channel = %self.name, event = %evt.event, "Publishing event");
        self.sender.send(evt).unwrap_or_default()
    }

    /// Get all member connection IDs.
    #[must_use]
    pub fn members(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }

    /// Check if the channel is empty (no members).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::names;
    use serde_json::json;

    #[test]
    fn test_channel_creation() {
        let channel = Channel::new("conversation:42");
        assert_eq!(channel.name(), "conversation:42");
        assert_eq!(channel.member_count(), 0);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_channel_join_leave() {
        let mut channel = Channel::new("workshop:5");

        let _rx = channel.join("conn-1");
        assert_eq!(channel.member_count(), 1);
        assert!(channel.is_member("conn-1"));

        let _rx2 = channel.join("conn-2");
        assert_eq!(channel.member_count(), 2);

        assert!(channel.leave("conn-1"));
        assert_eq!(channel.member_count(), 1);
        assert!(!channel.is_member("conn-1"));

        // Leaving a channel never joined
        assert!(!channel.leave("conn-1"));
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("user:alice").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("$system").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[test]
    fn test_channel_name_builders() {
        assert_eq!(user_channel("u-9"), "user:u-9");
        assert_eq!(conversation_channel(12), "conversation:12");
        assert_eq!(workshop_channel(3), "workshop:3");
        assert_eq!(swap_channel(40), "swap:40");
    }

    #[tokio::test]
    async fn test_channel_publish() {
        let mut channel = Channel::new("swap:1");
        let mut rx = channel.join("conn-1");

        let count = channel.publish(LiveEvent::new(
            "swap:1",
            names::SWAP_UPDATED,
            json!({"status": "accepted"}),
        ));
        assert_eq!(count, 1);

        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.event, "swapUpdated");
    }
}
