//! Shared server state and service wiring.

use crate::config::Config;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_core::{PresenceRegistry, Router, RouterConfig};
use tandem_engine::{
    ChatService, Dispatcher, DomainEvent, EventBus, InMemoryCatalog, InMemoryChatStore,
    InMemoryDirectory, InMemoryLedger, InMemoryNotificationStore, InMemoryStats,
    InMemorySwapStore, StaticTokenVerifier, SwapService,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Presence registry.
    pub registry: Arc<PresenceRegistry>,
    /// The live-event router.
    pub router: Arc<Router>,
    /// Credential verifier for handshakes and bearer headers.
    pub verifier: Arc<StaticTokenVerifier>,
    /// Credit ledger (balance reads on the HTTP surface).
    pub ledger: Arc<InMemoryLedger>,
    /// Conversation and message operations.
    pub chat: ChatService,
    /// Swap lifecycle operations.
    pub swaps: SwapService,
    /// Notification dispatcher (store access for the HTTP surface).
    pub dispatcher: Dispatcher,
    /// Domain-event bus (workshop enrollment and other out-of-engine emits).
    pub events: EventBus,
    connection_seq: AtomicU64,
}

impl AppState {
    /// Wire up every service from configuration.
    ///
    /// Returns the state plus the domain-event receiver the caller must feed
    /// to the dispatcher task.
    #[must_use]
    pub fn new(config: Config) -> (Arc<Self>, UnboundedReceiver<DomainEvent>) {
        let registry = Arc::new(PresenceRegistry::new());
        let router = Arc::new(Router::with_config(RouterConfig {
            max_channels: config.limits.max_channels,
            max_joins_per_connection: config.limits.max_joins_per_connection,
            channel_capacity: config.limits.channel_capacity,
            auto_delete_empty_channels: true,
        }));
        let (events, bus_rx) = EventBus::new();

        let verifier = Arc::new(StaticTokenVerifier::new());
        for (token, principal) in &config.auth.tokens {
            verifier.insert(token.clone(), principal.clone());
        }

        let directory = Arc::new(InMemoryDirectory::new());
        for (principal, display_name) in &config.auth.profiles {
            directory.insert(principal.clone(), display_name.clone());
        }

        let ledger = Arc::new(InMemoryLedger::new());
        for (principal, balance) in &config.ledger.balances {
            ledger.deposit(principal, *balance);
        }

        let catalog = Arc::new(InMemoryCatalog::new());
        for (id, title) in &config.catalog.skills {
            match id.parse() {
                Ok(id) => catalog.insert_skill(id, title.clone()),
                Err(_) => warn!(id = %id, "Skipping non-numeric skill id in config"),
            }
        }
        for (id, title) in &config.catalog.workshops {
            match id.parse() {
                Ok(id) => catalog.insert_workshop(id, title.clone()),
                Err(_) => warn!(id = %id, "Skipping non-numeric workshop id in config"),
            }
        }

        if let Some(ttl) = config.swap.pending_ttl_secs {
            warn!(
                pending_ttl_secs = ttl,
                "swap.pending_ttl_secs is set but no expiry sweep runs yet"
            );
        }

        let chat = ChatService::new(
            Arc::new(InMemoryChatStore::new()),
            router.clone(),
            events.clone(),
        );

        let swaps = SwapService::new(
            Arc::new(InMemorySwapStore::new()),
            ledger.clone(),
            Arc::new(InMemoryStats::new()),
            router.clone(),
            chat.clone(),
            events.clone(),
        );

        let dispatcher = Dispatcher::new(
            Arc::new(InMemoryNotificationStore::new()),
            registry.clone(),
            router.clone(),
            directory,
            catalog,
        );

        let state = Arc::new(Self {
            config,
            registry,
            router,
            verifier,
            ledger,
            chat,
            swaps,
            dispatcher,
            events,
            connection_seq: AtomicU64::new(1),
        });
        (state, bus_rx)
    }

    /// Mint a process-unique connection identifier.
    pub fn next_connection_id(&self) -> String {
        let seq = self.connection_seq.fetch_add(1, Ordering::Relaxed);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("conn-{seq}-{nanos}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wiring_from_config() {
        let mut config = Config::default();
        config.auth.tokens.insert("tok-a".into(), "alice".into());
        config.ledger.balances.insert("alice".into(), 75);
        config.catalog.skills.insert("1".into(), "Chess".into());
        config.catalog.skills.insert("oops".into(), "Bad".into());

        let (state, _rx) = AppState::new(config);
        assert!(!state.registry.is_online("alice"));

        let a = state.next_connection_id();
        let b = state.next_connection_id();
        assert_ne!(a, b);
    }
}
