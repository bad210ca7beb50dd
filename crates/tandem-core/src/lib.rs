//! # tandem-core
//!
//! Presence tracking and live-event routing for the Tandem realtime core.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Channel** - Named broadcast group (`user:{id}`, `conversation:{id}`, ...)
//! - **Router** - Pub/sub fan-out of live events to channel members
//! - **PresenceRegistry** - Which principals are connected right now
//! - **LiveEvent** - The routed event unit and the event-name catalogue
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│  Channel    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │
//!        ▼
//! ┌──────────────────┐
//! │ PresenceRegistry │
//! └──────────────────┘
//! ```

pub mod channel;
pub mod event;
pub mod presence;
pub mod router;

pub use channel::{
    conversation_channel, swap_channel, user_channel, workshop_channel, Channel, ChannelId,
    PRESENCE_CHANNEL,
};
pub use event::{names as event_names, LiveEvent};
pub use presence::{PresenceEntry, PresenceRegistry, PresenceStatus};
pub use router::{Router, RouterConfig, RouterError, RouterStats};
