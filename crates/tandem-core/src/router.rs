//! Pub/sub router for the live layer.
//!
//! The router manages named channels and fans live events out to every
//! connection joined to a channel. Join/leave are idempotent membership
//! changes; publish delivers to current members only.

use crate::channel::{validate_channel_name, Channel, ChannelId};
use crate::event::LiveEvent;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Maximum joined channels reached for a connection.
    #[error("Maximum joined channels reached")]
    MaxJoinsReached,

    /// Maximum number of channels reached.
    #[error("Maximum number of channels reached")]
    MaxChannelsReached,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of channels.
    pub max_channels: usize,
    /// Maximum joined channels per connection.
    pub max_joins_per_connection: usize,
    /// Channel broadcast capacity.
    pub channel_capacity: usize,
    /// Whether to auto-delete empty channels.
    pub auto_delete_empty_channels: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_channels: 10_000,
            max_joins_per_connection: 100,
            channel_capacity: 1024,
            auto_delete_empty_channels: true,
        }
    }
}

/// The central live-event router.
///
/// Channels are created lazily on first join and routing uses lock-free
/// maps so publishes from many connections never serialize on one lock.
pub struct Router {
    /// Channels indexed by name.
    channels: DashMap<ChannelId, Channel>,
    /// Connection memberships (connection_id -> set of channel names).
    memberships: DashMap<String, dashmap::DashSet<ChannelId>>,
    /// Configuration.
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            memberships: DashMap::new(),
            config,
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            channel_count: self.channels.len(),
            connection_count: self.memberships.len(),
            total_memberships: self.memberships.iter().map(|s| s.len()).sum(),
        }
    }

    /// Join a connection to a channel.
    ///
    /// Returns a receiver for events on the channel. Joining a channel the
    /// connection already belongs to is a no-op for membership and hands
    /// back a fresh receiver.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or limits are exceeded.
    pub fn join(
        &self,
        connection_id: &str,
        channel_name: &str,
    ) -> Result<broadcast::Receiver<Arc<LiveEvent>>, RouterError> {
        validate_channel_name(channel_name).map_err(RouterError::InvalidChannel)?;

        let conn_channels = self
            .memberships
            .entry(connection_id.to_string())
            .or_default();

        let already_member = conn_channels.contains(channel_name);
        if !already_member && conn_channels.len() >= self.config.max_joins_per_connection {
            return Err(RouterError::MaxJoinsReached);
        }
        if !already_member
            && !self.channels.contains_key(channel_name)
            && self.channels.len() >= self.config.max_channels
        {
            return Err(RouterError::MaxChannelsReached);
        }

        let mut channel = self
            .channels
            .entry(channel_name.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel_name, "Creating new channel");
                Channel::with_capacity(channel_name, self.config.channel_capacity)
            });

        let receiver = channel.join(connection_id);
        conn_channels.insert(channel_name.to_string());

        debug!(
            channel = %channel_name,
            connection = %connection_id,
            members = channel.member_count(),
            "Joined"
        );

        Ok(receiver)
    }

    /// Remove a connection from a channel.
    ///
    /// Idempotent: returns `true` if the connection was a member.
    pub fn leave(&self, connection_id: &str, channel_name: &str) -> bool {
        let was_member = self
            .memberships
            .get(connection_id)
            .map(|c| c.remove(channel_name).is_some())
            .unwrap_or(false);

        if let Some(mut channel) = self.channels.get_mut(channel_name) {
            channel.leave(connection_id);

            if self.config.auto_delete_empty_channels && channel.is_empty() {
                drop(channel); // Release the lock
                self.channels.remove(channel_name);
                debug!(channel = %channel_name, "Deleted empty channel");
            }
        }

        was_member
    }

    /// Remove a connection from all channels.
    pub fn leave_all(&self, connection_id: &str) {
        if let Some((_, channels)) = self.memberships.remove(connection_id) {
            for channel_name in channels.iter() {
                if let Some(mut channel) = self.channels.get_mut(channel_name.as_str()) {
                    channel.leave(connection_id);

                    if self.config.auto_delete_empty_channels && channel.is_empty() {
                        let name = channel_name.clone();
                        drop(channel);
                        self.channels.remove(&name);
                    }
                }
            }
        }

        debug!(connection = %connection_id, "Left all channels");
    }

    /// Publish an event to its channel.
    ///
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: LiveEvent) -> usize {
        let channel_name = event.channel.clone();

        if let Some(channel) = self.channels.get(&channel_name) {
            let count = channel.publish(event);
            trace!(channel = %channel_name, recipients = count, "Published event");
            count
        } else {
            trace!(channel = %channel_name, "Publish to channel with no members");
            0
        }
    }

    /// Publish a named event with a JSON payload to a channel.
    pub fn publish_to(
        &self,
        channel_name: &str,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> usize {
        self.publish(LiveEvent::new(channel_name, event, payload))
    }

    /// Publish to a channel, skipping the sending connection on delivery.
    pub fn publish_excluding(
        &self,
        channel_name: &str,
        event: impl Into<String>,
        payload: serde_json::Value,
        source_connection: &str,
    ) -> usize {
        self.publish(
            LiveEvent::new(channel_name, event, payload)
                .with_source(source_connection)
                .excluding_source(),
        )
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel_name: &str) -> bool {
        self.channels.contains_key(channel_name)
    }

    /// Get the member count for a channel.
    #[must_use]
    pub fn member_count(&self, channel_name: &str) -> usize {
        self.channels
            .get(channel_name)
            .map(|c| c.member_count())
            .unwrap_or(0)
    }

    /// Get the channels a connection has joined.
    #[must_use]
    pub fn connection_channels(&self, connection_id: &str) -> Vec<String> {
        self.memberships
            .get(connection_id)
            .map(|s| s.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }

    /// Check whether a connection has joined a channel.
    #[must_use]
    pub fn is_member(&self, connection_id: &str, channel_name: &str) -> bool {
        self.memberships
            .get(connection_id)
            .map(|c| c.contains(channel_name))
            .unwrap_or(false)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of active channels.
    pub channel_count: usize,
    /// Number of connections with at least one membership.
    pub connection_count: usize,
    /// Total number of memberships.
    pub total_memberships: usize,
}
