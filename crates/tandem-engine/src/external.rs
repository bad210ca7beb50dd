//! External collaborator seams.
//!
//! The coordination core consumes a credential verifier, a user directory,
//! a credit ledger and a read-only catalog as narrow services implemented
//! elsewhere. Each is a trait here; the in-memory implementations back the
//! tests and single-process deployments.

use crate::error::{EngineError, Result};
use crate::types::{CatalogId, PrincipalId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Public profile fields used for event enrichment.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Display name.
    pub display_name: String,
    /// Avatar URL, if any.
    pub avatar: Option<String>,
}

/// Verifies bearer credentials presented at connection time.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Verify a token, returning the principal it authenticates.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Auth`] for missing/invalid/expired credentials.
    async fn verify(&self, token: &str) -> Result<PrincipalId>;
}

/// Read-only profile lookups.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up the profile for a principal.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the principal is unknown.
    async fn lookup(&self, principal: &str) -> Result<Profile>;
}

/// The credit ledger. Transfers are atomic at the ledger and idempotent
/// per key, which is what makes a duplicated Complete harmless.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Move `amount` credits from payer to payee.
    ///
    /// A repeated call with the same `idempotency_key` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InsufficientFunds`] if the payer cannot cover
    /// the amount.
    async fn transfer(
        &self,
        payer: &str,
        payee: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<()>;

    /// Current balance for a principal.
    async fn balance(&self, principal: &str) -> Result<i64>;
}

/// Read-only catalog lookups for notification payload enrichment.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Title of a skill, if known.
    async fn skill_title(&self, skill_id: CatalogId) -> Option<String>;

    /// Title of a workshop, if known.
    async fn workshop_title(&self, workshop_id: CatalogId) -> Option<String>;
}

/// Per-principal activity counters incremented on swap completion.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Atomically increment a counter. Never a read-then-write: two swaps
    /// completing concurrently for the same principal must both land.
    async fn increment(&self, principal: &str, counter: StatCounter);

    /// Read a counter value.
    async fn get(&self, principal: &str, counter: StatCounter) -> u64;
}

/// Counter kinds tracked per principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatCounter {
    /// Completed swaps, either role.
    SwapsCompleted,
    /// Sessions where the principal taught.
    SessionsTaught,
    /// Sessions where the principal learned.
    SessionsLearned,
}

/// Token -> principal verifier backed by a static map.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: DashMap<String, PrincipalId>,
}

impl StaticTokenVerifier {
    /// Create an empty verifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a principal.
    pub fn insert(&self, token: impl Into<String>, principal: impl Into<PrincipalId>) {
        self.tokens.insert(token.into(), principal.into());
    }
}

#[async_trait]
impl CredentialVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<PrincipalId> {
        if token.is_empty() {
            return Err(EngineError::Auth("missing credential".into()));
        }
        self.tokens
            .get(token)
            .map(|p| p.clone())
            .ok_or_else(|| EngineError::Auth("invalid or expired credential".into()))
    }
}

/// In-memory user directory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    profiles: DashMap<PrincipalId, Profile>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile.
    pub fn insert(&self, principal: impl Into<PrincipalId>, display_name: impl Into<String>) {
        self.profiles.insert(
            principal.into(),
            Profile {
                display_name: display_name.into(),
                avatar: None,
            },
        );
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn lookup(&self, principal: &str) -> Result<Profile> {
        self.profiles
            .get(principal)
            .map(|p| p.clone())
            .ok_or(EngineError::NotFound("principal"))
    }
}

/// In-memory credit ledger.
///
/// The whole transfer (idempotency check, funds check, both balance moves)
/// happens under one lock so concurrent completions never observe a torn
/// balance.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    inner: Mutex<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    balances: HashMap<PrincipalId, i64>,
    applied_keys: HashSet<String>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an account (test/bootstrap helper).
    pub fn deposit(&self, principal: &str, amount: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner.balances.entry(principal.to_string()).or_insert(0) += amount;
    }
}

#[async_trait]
impl CreditLedger for InMemoryLedger {
    async fn transfer(
        &self,
        payer: &str,
        payee: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<()> {
        if amount <= 0 {
            return Err(EngineError::Validation(
                "transfer amount must be positive".into(),
            ));
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.applied_keys.contains(idempotency_key) {
            debug!(key = %idempotency_key, "Transfer already applied, skipping");
            return Ok(());
        }

        let payer_balance = inner.balances.get(payer).copied().unwrap_or(0);
        if payer_balance < amount {
            return Err(EngineError::InsufficientFunds {
                balance: payer_balance,
                required: amount,
            });
        }

        *inner.balances.entry(payer.to_string()).or_insert(0) -= amount;
        *inner.balances.entry(payee.to_string()).or_insert(0) += amount;
        inner.applied_keys.insert(idempotency_key.to_string());

        debug!(payer = %payer, payee = %payee, amount, "Credits transferred");
        Ok(())
    }

    async fn balance(&self, principal: &str) -> Result<i64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.balances.get(principal).copied().unwrap_or(0))
    }
}

/// In-memory catalog of skill and workshop titles.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    skills: DashMap<CatalogId, String>,
    workshops: DashMap<CatalogId, String>,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a skill title.
    pub fn insert_skill(&self, id: CatalogId, title: impl Into<String>) {
        self.skills.insert(id, title.into());
    }

    /// Register a workshop title.
    pub fn insert_workshop(&self, id: CatalogId, title: impl Into<String>) {
        self.workshops.insert(id, title.into());
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn skill_title(&self, skill_id: CatalogId) -> Option<String> {
        self.skills.get(&skill_id).map(|t| t.clone())
    }

    async fn workshop_title(&self, workshop_id: CatalogId) -> Option<String> {
        self.workshops.get(&workshop_id).map(|t| t.clone())
    }
}

/// In-memory stats store backed by atomic counters.
#[derive(Debug, Default)]
pub struct InMemoryStats {
    counters: DashMap<(PrincipalId, StatCounter), AtomicU64>,
}

impl InMemoryStats {
    /// Create an empty stats store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatsStore for InMemoryStats {
    async fn increment(&self, principal: &str, counter: StatCounter) {
        self.counters
            .entry((principal.to_string(), counter))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    async fn get(&self, principal: &str, counter: StatCounter) -> u64 {
        self.counters
            .get(&(principal.to_string(), counter))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verifier_accepts_known_token() {
        let verifier = StaticTokenVerifier::new();
        verifier.insert("tok-1", "alice");

        assert_eq!(verifier.verify("tok-1").await.unwrap(), "alice");
        assert!(matches!(
            verifier.verify("tok-2").await,
            Err(EngineError::Auth(_))
        ));
        assert!(matches!(
            verifier.verify("").await,
            Err(EngineError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_ledger_transfer() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("alice", 100);

        ledger.transfer("alice", "bob", 40, "key-1").await.unwrap();
        assert_eq!(ledger.balance("alice").await.unwrap(), 60);
        assert_eq!(ledger.balance("bob").await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_ledger_transfer_idempotent() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("alice", 100);

        ledger.transfer("alice", "bob", 40, "key-1").await.unwrap();
        ledger.transfer("alice", "bob", 40, "key-1").await.unwrap();

        assert_eq!(ledger.balance("alice").await.unwrap(), 60);
        assert_eq!(ledger.balance("bob").await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_ledger_insufficient_funds() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("alice", 10);

        let err = ledger
            .transfer("alice", "bob", 40, "key-1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        // Nothing moved
        assert_eq!(ledger.balance("alice").await.unwrap(), 10);
        assert_eq!(ledger.balance("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats_increment() {
        let stats = InMemoryStats::new();

        stats.increment("alice", StatCounter::SwapsCompleted).await;
        stats.increment("alice", StatCounter::SwapsCompleted).await;
        stats.increment("alice", StatCounter::SessionsTaught).await;

        assert_eq!(stats.get("alice", StatCounter::SwapsCompleted).await, 2);
        assert_eq!(stats.get("alice", StatCounter::SessionsTaught).await, 1);
        assert_eq!(stats.get("alice", StatCounter::SessionsLearned).await, 0);
    }
}
