//! Principal-level presence tracking.
//!
//! The registry answers "is this principal connected right now" for the
//! notification dispatcher and drives the global online/offline broadcast.
//! It is process-local state, instantiated once per process and injected
//! wherever presence is consulted; it is not synchronized across instances.

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Presence status for a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Busy,
}

/// Presence state for a single live connection.
///
/// An entry exists iff the principal has at least one live connection and is
/// removed immediately on disconnect; there is no grace period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// The authenticated principal.
    pub principal_id: String,
    /// Connection ID.
    pub connection_id: String,
    /// Advertised status.
    pub status: PresenceStatus,
    /// When the connection was registered (epoch millis).
    pub connected_at: u64,
}

impl PresenceEntry {
    fn new(principal_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            principal_id: principal_id.into(),
            connection_id: connection_id.into(),
            status: PresenceStatus::Online,
            connected_at: now,
        }
    }
}

/// Process-local presence registry.
///
/// A principal may hold several live connections (multiple tabs/devices);
/// they count as online while at least one connection remains.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    /// Connection ID -> presence entry.
    connections: DashMap<String, PresenceEntry>,
    /// Principal ID -> set of connection IDs.
    principals: DashMap<String, DashSet<String>>,
}

impl PresenceRegistry {
    /// Create a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection.
    ///
    /// Returns `true` if this made the principal online (first connection).
    pub fn register(&self, principal_id: &str, connection_id: &str) -> bool {
        let entry = PresenceEntry::new(principal_id, connection_id);
        self.connections.insert(connection_id.to_string(), entry);

        let conns = self
            .principals
            .entry(principal_id.to_string())
            .or_default();
        let came_online = conns.is_empty();
        conns.insert(connection_id.to_string());

        if came_online {
            debug!(principal = %principal_id, "Presence: principal online");
        }
        came_online
    }

    /// Remove a connection.
    ///
    /// Returns the principal ID and whether the principal went offline
    /// (that was their last connection).
    pub fn deregister(&self, connection_id: &str) -> Option<(String, bool)> {
        let (_, entry) = self.connections.remove(connection_id)?;
        let principal_id = entry.principal_id;

        let went_offline = if let Some(conns) = self.principals.get(&principal_id) {
            conns.remove(connection_id);
            conns.is_empty()
        } else {
            true
        };

        if went_offline {
            self.principals.remove(&principal_id);
            debug!(principal = %principal_id, "Presence: principal offline");
        }

        Some((principal_id, went_offline))
    }

    /// Check whether a principal has at least one live connection.
    #[must_use]
    pub fn is_online(&self, principal_id: &str) -> bool {
        self.principals
            .get(principal_id)
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    /// Get the presence entry for a connection.
    #[must_use]
    pub fn lookup(&self, connection_id: &str) -> Option<PresenceEntry> {
        self.connections.get(connection_id).map(|e| e.clone())
    }

    /// Resolve a connection to its principal.
    #[must_use]
    pub fn principal_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .map(|e| e.principal_id.clone())
    }

    /// Update the advertised status on all of a principal's connections.
    ///
    /// Returns `true` if the principal is online.
    pub fn set_status(&self, principal_id: &str, status: PresenceStatus) -> bool {
        let Some(conns) = self.principals.get(principal_id) else {
            return false;
        };
        for conn_id in conns.iter() {
            if let Some(mut entry) = self.connections.get_mut(conn_id.key()) {
                entry.status = status;
            }
        }
        true
    }

    /// Number of live connections for a principal.
    #[must_use]
    pub fn connection_count(&self, principal_id: &str) -> usize {
        self.principals
            .get(principal_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// All currently online principal IDs.
    #[must_use]
    pub fn online_principals(&self) -> Vec<String> {
        self.principals.iter().map(|e| e.key().clone()).collect()
    }

    /// Full snapshot of live connections.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.connections.iter().map(|e| e.clone()).collect()
    }

    /// Total number of live connections.
    #[must_use]
    pub fn connection_total(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_deregister() {
        let registry = PresenceRegistry::new();

        assert!(registry.register("alice", "conn-1"));
        assert!(registry.is_online("alice"));

        let (principal, went_offline) = registry.deregister("conn-1").unwrap();
        assert_eq!(principal, "alice");
        assert!(went_offline);
        assert!(!registry.is_online("alice"));
    }

    #[test]
    fn test_multiple_connections_single_principal() {
        let registry = PresenceRegistry::new();

        assert!(registry.register("alice", "conn-1"));
        // Second device does not re-announce online
        assert!(!registry.register("alice", "conn-2"));
        assert_eq!(registry.connection_count("alice"), 2);

        let (_, went_offline) = registry.deregister("conn-1").unwrap();
        assert!(!went_offline);
        assert!(registry.is_online("alice"));

        let (_, went_offline) = registry.deregister("conn-2").unwrap();
        assert!(went_offline);
        assert!(!registry.is_online("alice"));
    }

    #[test]
    fn test_deregister_unknown_connection() {
        let registry = PresenceRegistry::new();
        assert!(registry.deregister("conn-404").is_none());
    }

    #[test]
    fn test_status_update() {
        let registry = PresenceRegistry::new();
        registry.register("alice", "conn-1");

        assert!(registry.set_status("alice", PresenceStatus::Away));
        assert_eq!(
            registry.lookup("conn-1").unwrap().status,
            PresenceStatus::Away
        );

        assert!(!registry.set_status("bob", PresenceStatus::Busy));
    }

    #[test]
    fn test_snapshot() {
        let registry = PresenceRegistry::new();
        registry.register("alice", "conn-1");
        registry.register("bob", "conn-2");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.online_principals().len(), 2);
    }
}
