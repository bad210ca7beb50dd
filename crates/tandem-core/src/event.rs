//! Live event types routed between connections.
//!
//! A [`LiveEvent`] is the unit the router fans out to channel subscribers:
//! a named event plus an opaque JSON payload. Everything in the live layer
//! (`newMessage`, typing pings, call signaling) travels as one of these.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique live-event identifier.
pub type EventId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique event ID.
#[must_use]
pub fn generate_event_id() -> EventId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Event names pushed over live channels.
///
/// These are the names clients switch on; they are part of the wire contract
/// and must stay stable.
pub mod names {
    pub const NOTIFICATION: &str = "notification";
    pub const NEW_MESSAGE: &str = "newMessage";
    pub const MESSAGE_EDITED: &str = "messageEdited";
    pub const MESSAGE_DELETED: &str = "messageDeleted";
    pub const USER_TYPING: &str = "userTyping";
    pub const MESSAGES_READ: &str = "messagesRead";
    pub const USER_ONLINE: &str = "userOnline";
    pub const USER_OFFLINE: &str = "userOffline";
    pub const PARTICIPANT_JOINED: &str = "participantJoined";
    pub const PARTICIPANT_LEFT: &str = "participantLeft";
    pub const INCOMING_CALL: &str = "incomingCall";
    pub const CALL_ACCEPTED: &str = "callAccepted";
    pub const CALL_REJECTED: &str = "callRejected";
    pub const CALL_ENDED: &str = "callEnded";
    pub const ICE_CANDIDATE: &str = "iceCandidate";
    pub const PRESENCE_UPDATE: &str = "presenceUpdate";
    pub const SWAP_UPDATED: &str = "swapUpdated";
}

/// A routed live event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// Source connection ID, if the event originated from a client.
    pub source: Option<String>,
    /// Target channel.
    pub channel: String,
    /// Event name (see [`names`]).
    pub event: String,
    /// Opaque JSON payload. The router never inspects this; call signaling
    /// in particular is relayed as-is.
    pub payload: serde_json::Value,
    /// Whether the source connection should be skipped on delivery
    /// (typing indicators, read pings).
    pub exclude_source: bool,
    /// Timestamp when the event was created (epoch millis).
    pub timestamp: u64,
}

impl LiveEvent {
    /// Create a new live event for a channel.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: generate_event_id(),
            source: None,
            channel: channel.into(),
            event: event.into(),
            payload,
            exclude_source: false,
            timestamp: now_millis(),
        }
    }

    /// Attach the originating connection.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Skip the originating connection on delivery.
    #[must_use]
    pub fn excluding_source(mut self) -> Self {
        self.exclude_source = true;
        self
    }

    /// Whether this event should be delivered to the given connection.
    #[must_use]
    pub fn deliverable_to(&self, connection_id: &str) -> bool {
        !(self.exclude_source && self.source.as_deref() == Some(connection_id))
    }
}
