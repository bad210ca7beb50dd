//! Swap lifecycle state machine.
//!
//! A swap moves `pending → accepted → in_progress → completed` on the happy
//! path, `pending → rejected` on refusal, and from any non-terminal state to
//! `cancelled`. The status field is the single point of truth: every
//! transition goes through the store's conditional transition (compare the
//! expected source states, then swap), which is what makes a duplicated or
//! concurrent Complete a no-op instead of a second credit transfer.

use crate::chat::ChatService;
use crate::error::{EngineError, Result};
use crate::events::{DomainEvent, EventBus};
use crate::external::{CreditLedger, StatCounter, StatsStore};
use crate::types::{pair_key, CatalogId, IdSequence, PrincipalId, SwapId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tandem_core::event::{names, now_millis};
use tandem_core::{user_channel, Router};
use tracing::{debug, info};

/// How a swap is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Skill-for-skill; no credits move.
    Exchange,
    /// Credit-settled; `amount` moves requester → provider on completion.
    Paid,
}

/// Swap lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
    InProgress,
    Completed,
}

impl SwapStatus {
    /// Terminal states are never left.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SwapStatus::Rejected | SwapStatus::Cancelled | SwapStatus::Completed
        )
    }

    /// Non-terminal states count against the one-active-swap-per-pair rule.
    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SwapStatus::Pending => "pending",
            SwapStatus::Accepted => "accepted",
            SwapStatus::Rejected => "rejected",
            SwapStatus::Cancelled => "cancelled",
            SwapStatus::InProgress => "in_progress",
            SwapStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Which side of the swap a review comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewRole {
    Requester,
    Provider,
}

/// A skill-exchange engagement between two principals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRequest {
    /// Swap identifier.
    pub id: SwapId,
    /// The principal asking to learn.
    pub requester: PrincipalId,
    /// The principal offering the skill.
    pub provider: PrincipalId,
    /// Skill being requested.
    pub skill_id: CatalogId,
    /// Skill offered in return, for skill-for-skill exchanges.
    pub offered_skill_id: Option<CatalogId>,
    /// Free-form description.
    pub description: Option<String>,
    /// Settlement kind.
    pub kind: ExchangeKind,
    /// Credit amount for paid swaps.
    pub amount: i64,
    /// Current lifecycle state.
    pub status: SwapStatus,
    /// Schedule proposed at creation.
    pub proposed_schedule: Option<String>,
    /// Schedule confirmed at acceptance.
    pub confirmed_schedule: Option<String>,
    /// Notes recorded at completion.
    pub session_notes: Option<String>,
    /// Review left by the requester, once.
    pub requester_review: Option<u64>,
    /// Review left by the provider, once.
    pub provider_review: Option<u64>,
    /// Who cancelled, if cancelled.
    pub cancelled_by: Option<PrincipalId>,
    /// Cancellation reason, if cancelled.
    pub cancel_reason: Option<String>,
    /// Rejection reason, if rejected.
    pub reject_reason: Option<String>,
    /// Creation time (epoch millis).
    pub created_at: u64,
    /// When the provider responded (accept/reject).
    pub responded_at: Option<u64>,
    /// When the session started.
    pub started_at: Option<u64>,
    /// When the swap completed.
    pub completed_at: Option<u64>,
}

impl SwapRequest {
    /// Check whether a principal is party to this swap.
    #[must_use]
    pub fn is_participant(&self, principal: &str) -> bool {
        self.requester == principal || self.provider == principal
    }

    /// The other participant.
    #[must_use]
    pub fn counterpart_of(&self, principal: &str) -> &str {
        if self.requester == principal {
            &self.provider
        } else {
            &self.requester
        }
    }

    #[cfg(test)]
    pub(crate) fn sample(
        requester: &str,
        provider: &str,
        kind: ExchangeKind,
        amount: i64,
        status: SwapStatus,
    ) -> Self {
        Self {
            id: 1,
            requester: requester.to_string(),
            provider: provider.to_string(),
            skill_id: 1,
            offered_skill_id: None,
            description: None,
            kind,
            amount,
            status,
            proposed_schedule: None,
            confirmed_schedule: None,
            session_notes: None,
            requester_review: None,
            provider_review: None,
            cancelled_by: None,
            cancel_reason: None,
            reject_reason: None,
            created_at: now_millis(),
            responded_at: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Input for creating a swap.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSwap {
    /// Filled in from the authenticated principal; any client-provided
    /// value is overwritten.
    #[serde(default)]
    pub requester: PrincipalId,
    pub provider: PrincipalId,
    pub skill_id: CatalogId,
    #[serde(default)]
    pub offered_skill_id: Option<CatalogId>,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: ExchangeKind,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub proposed_schedule: Option<String>,
}

/// Fields a transition may set alongside the status change.
#[derive(Debug, Clone, Default)]
pub struct SwapPatch {
    pub responded_at: Option<u64>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub confirmed_schedule: Option<String>,
    pub session_notes: Option<String>,
    pub cancel_reason: Option<String>,
    pub reject_reason: Option<String>,
    pub cancelled_by: Option<PrincipalId>,
}

/// Storage seam for swaps.
///
/// `transition` is the concurrency-critical operation: the status check and
/// the mutation happen atomically, so of N racing callers exactly one
/// observes the expected source state.
#[async_trait]
pub trait SwapStore: Send + Sync {
    /// Insert a new pending swap, enforcing the one-active-swap-per-pair
    /// invariant atomically.
    async fn insert(&self, new: NewSwap) -> Result<SwapRequest>;

    /// Fetch a swap by id.
    async fn get(&self, id: SwapId) -> Result<SwapRequest>;

    /// The active (non-terminal) swap between an unordered pair, if any.
    async fn active_between(&self, a: &str, b: &str) -> Result<Option<SwapRequest>>;

    /// Conditionally transition: only if the current status is one of
    /// `expected`, move to `to` and apply the patch.
    ///
    /// # Errors
    ///
    /// `Conflict` when the swap is already terminal, `State` for any other
    /// disallowed source state.
    async fn transition(
        &self,
        id: SwapId,
        expected: &[SwapStatus],
        to: SwapStatus,
        patch: SwapPatch,
    ) -> Result<SwapRequest>;

    /// Claim the swap for settlement: only if the current status is one of
    /// `expected` and no other claim is held. While a claim is held, every
    /// `transition` on the swap fails with `Conflict`, so nothing can move
    /// the swap between the ledger transfer and `finish_settlement`.
    ///
    /// # Errors
    ///
    /// `Conflict` on a terminal swap or a swap already claimed, `State` for
    /// any other disallowed source state.
    async fn begin_settlement(&self, id: SwapId, expected: &[SwapStatus]) -> Result<SwapRequest>;

    /// Move a claimed swap to `completed` and release the claim.
    async fn finish_settlement(&self, id: SwapId, patch: SwapPatch) -> Result<SwapRequest>;

    /// Release a claim without completing (the transfer failed).
    async fn abort_settlement(&self, id: SwapId);

    /// Attach a review for a role, once. Only valid on completed swaps.
    async fn attach_review(&self, id: SwapId, role: ReviewRole, review_id: u64)
        -> Result<SwapRequest>;

    /// Swaps a principal participates in, newest first.
    async fn list_for(&self, principal: &str) -> Result<Vec<SwapRequest>>;
}

/// In-memory swap store.
#[derive(Debug, Default)]
pub struct InMemorySwapStore {
    swaps: DashMap<SwapId, SwapRequest>,
    /// Unordered pair -> the one active swap between them.
    active_index: DashMap<(String, String), SwapId>,
    /// Swaps with a settlement claim held; transitions are refused while
    /// the id is present.
    settling: DashMap<SwapId, ()>,
    ids: IdSequence,
}

impl InMemorySwapStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn release_pair(&self, swap: &SwapRequest) {
        let key = pair_key(&swap.requester, &swap.provider);
        let id = swap.id;
        self.active_index.remove_if(&key, |_, v| *v == id);
    }

    fn apply_patch(swap: &mut SwapRequest, patch: SwapPatch) {
        if patch.responded_at.is_some() {
            swap.responded_at = patch.responded_at;
        }
        if patch.started_at.is_some() {
            swap.started_at = patch.started_at;
        }
        if patch.completed_at.is_some() {
            swap.completed_at = patch.completed_at;
        }
        if patch.confirmed_schedule.is_some() {
            swap.confirmed_schedule = patch.confirmed_schedule;
        }
        if patch.session_notes.is_some() {
            swap.session_notes = patch.session_notes;
        }
        if patch.cancel_reason.is_some() {
            swap.cancel_reason = patch.cancel_reason;
        }
        if patch.reject_reason.is_some() {
            swap.reject_reason = patch.reject_reason;
        }
        if patch.cancelled_by.is_some() {
            swap.cancelled_by = patch.cancelled_by;
        }
    }
}

#[async_trait]
impl SwapStore for InMemorySwapStore {
    async fn insert(&self, new: NewSwap) -> Result<SwapRequest> {
        let key = pair_key(&new.requester, &new.provider);

        match self.active_index.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // The index is cleared when a swap goes terminal, so an
                // occupied slot means a live swap between this pair.
                let existing = *entry.get();
                debug!(existing, "Rejecting duplicate active swap");
                Err(EngineError::Conflict(
                    "an active swap request already exists between these participants".into(),
                ))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let id = self.ids.next();
                let swap = SwapRequest {
                    id,
                    requester: new.requester,
                    provider: new.provider,
                    skill_id: new.skill_id,
                    offered_skill_id: new.offered_skill_id,
                    description: new.description,
                    kind: new.kind,
                    amount: new.amount,
                    status: SwapStatus::Pending,
                    proposed_schedule: new.proposed_schedule,
                    confirmed_schedule: None,
                    session_notes: None,
                    requester_review: None,
                    provider_review: None,
                    cancelled_by: None,
                    cancel_reason: None,
                    reject_reason: None,
                    created_at: now_millis(),
                    responded_at: None,
                    started_at: None,
                    completed_at: None,
                };

                self.swaps.insert(id, swap.clone());
                entry.insert(id);
                Ok(swap)
            }
        }
    }

    async fn get(&self, id: SwapId) -> Result<SwapRequest> {
        self.swaps
            .get(&id)
            .map(|s| s.clone())
            .ok_or(EngineError::NotFound("swap"))
    }

    async fn active_between(&self, a: &str, b: &str) -> Result<Option<SwapRequest>> {
        let key = pair_key(a, b);
        let Some(id) = self.active_index.get(&key).map(|e| *e) else {
            return Ok(None);
        };
        Ok(self.swaps.get(&id).map(|s| s.clone()))
    }

    async fn transition(
        &self,
        id: SwapId,
        expected: &[SwapStatus],
        to: SwapStatus,
        patch: SwapPatch,
    ) -> Result<SwapRequest> {
        let updated = {
            let mut swap = self.swaps.get_mut(&id).ok_or(EngineError::NotFound("swap"))?;

            if !expected.contains(&swap.status) {
                let current = swap.status;
                return if current.is_terminal() {
                    Err(EngineError::Conflict(format!("swap is already {current}")))
                } else {
                    Err(EngineError::State(format!(
                        "cannot move swap from {current} to {to}"
                    )))
                };
            }

            // A held settlement claim means a complete is mid-transfer.
            if self.settling.contains_key(&id) {
                return Err(EngineError::Conflict(
                    "swap is being completed".into(),
                ));
            }

            swap.status = to;
            Self::apply_patch(&mut swap, patch);

            swap.clone()
        };

        if to.is_terminal() {
            self.release_pair(&updated);
        }

        debug!(swap = id, status = %to, "Swap transitioned");
        Ok(updated)
    }

    async fn begin_settlement(&self, id: SwapId, expected: &[SwapStatus]) -> Result<SwapRequest> {
        // The shared swap guard serializes against `transition`'s exclusive
        // guard: either the claim is visible before a racing transition
        // checks it, or the transition's status change is visible here.
        let swap = self.swaps.get(&id).ok_or(EngineError::NotFound("swap"))?;

        if !expected.contains(&swap.status) {
            let current = swap.status;
            return if current.is_terminal() {
                Err(EngineError::Conflict(format!("swap is already {current}")))
            } else {
                Err(EngineError::State(format!(
                    "cannot complete a swap in {current}"
                )))
            };
        }

        if self.settling.insert(id, ()).is_some() {
            return Err(EngineError::Conflict("swap is being completed".into()));
        }

        debug!(swap = id, "Settlement claim taken");
        Ok(swap.clone())
    }

    async fn finish_settlement(&self, id: SwapId, patch: SwapPatch) -> Result<SwapRequest> {
        let updated = {
            let mut swap = self.swaps.get_mut(&id).ok_or(EngineError::NotFound("swap"))?;
            swap.status = SwapStatus::Completed;
            Self::apply_patch(&mut swap, patch);
            swap.clone()
        };

        self.settling.remove(&id);
        self.release_pair(&updated);

        debug!(swap = id, "Swap settled and completed");
        Ok(updated)
    }

    async fn abort_settlement(&self, id: SwapId) {
        self.settling.remove(&id);
        debug!(swap = id, "Settlement claim released without completing");
    }

    async fn attach_review(
        &self,
        id: SwapId,
        role: ReviewRole,
        review_id: u64,
    ) -> Result<SwapRequest> {
        let mut swap = self.swaps.get_mut(&id).ok_or(EngineError::NotFound("swap"))?;

        if swap.status != SwapStatus::Completed {
            return Err(EngineError::State(
                "reviews can only be attached to a completed swap".into(),
            ));
        }

        let slot = match role {
            ReviewRole::Requester => &mut swap.requester_review,
            ReviewRole::Provider => &mut swap.provider_review,
        };
        if slot.is_some() {
            return Err(EngineError::Conflict(
                "a review was already submitted for this role".into(),
            ));
        }
        *slot = Some(review_id);

        Ok(swap.clone())
    }

    async fn list_for(&self, principal: &str) -> Result<Vec<SwapRequest>> {
        let mut swaps: Vec<SwapRequest> = self
            .swaps
            .iter()
            .filter(|s| s.is_participant(principal))
            .map(|s| s.clone())
            .collect();
        swaps.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(swaps)
    }
}

/// Swap lifecycle operations, wired to the ledger, stats, router, chat and
/// event bus.
#[derive(Clone)]
pub struct SwapService {
    store: Arc<dyn SwapStore>,
    ledger: Arc<dyn CreditLedger>,
    stats: Arc<dyn StatsStore>,
    router: Arc<Router>,
    chat: ChatService,
    events: EventBus,
}

impl SwapService {
    /// Create a new swap service.
    #[must_use]
    pub fn new(
        store: Arc<dyn SwapStore>,
        ledger: Arc<dyn CreditLedger>,
        stats: Arc<dyn StatsStore>,
        router: Arc<Router>,
        chat: ChatService,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            ledger,
            stats,
            router,
            chat,
            events,
        }
    }

    /// Access to the underlying store (read paths on the server surface).
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SwapStore> {
        &self.store
    }

    fn publish_update(&self, swap: &SwapRequest) {
        let payload = serde_json::json!({ "swap": swap });
        self.router
            .publish_to(&user_channel(&swap.requester), names::SWAP_UPDATED, payload.clone());
        self.router
            .publish_to(&user_channel(&swap.provider), names::SWAP_UPDATED, payload);
    }

    /// Create a swap request.
    ///
    /// # Errors
    ///
    /// `Validation` for a self-swap or a non-positive paid amount;
    /// `Conflict` if an active swap already exists for the pair.
    pub async fn create(&self, requester: &str, mut new: NewSwap) -> Result<SwapRequest> {
        new.requester = requester.to_string();

        if new.requester == new.provider {
            return Err(EngineError::Validation(
                "cannot create a swap request with yourself".into(),
            ));
        }
        if new.kind == ExchangeKind::Paid && new.amount <= 0 {
            return Err(EngineError::Validation(
                "paid swaps need a positive credit amount".into(),
            ));
        }

        let swap = self.store.insert(new).await?;
        info!(swap = swap.id, requester = %swap.requester, provider = %swap.provider, "Swap created");

        self.events.emit(DomainEvent::SwapCreated { swap: swap.clone() });
        self.publish_update(&swap);
        Ok(swap)
    }

    /// Accept a pending swap (provider only). Gets or creates the pair
    /// conversation.
    ///
    /// # Errors
    ///
    /// `Forbidden` unless the actor is the provider; `Conflict`/`State` for
    /// a swap not in `pending`.
    pub async fn accept(
        &self,
        actor: &str,
        id: SwapId,
        confirmed_schedule: Option<String>,
    ) -> Result<SwapRequest> {
        let swap = self.store.get(id).await?;
        if swap.provider != actor {
            return Err(EngineError::Forbidden(
                "only the provider can accept a swap request".into(),
            ));
        }

        let patch = SwapPatch {
            responded_at: Some(now_millis()),
            confirmed_schedule,
            ..SwapPatch::default()
        };
        let swap = self
            .store
            .transition(id, &[SwapStatus::Pending], SwapStatus::Accepted, patch)
            .await?;

        self.chat
            .get_or_create(&swap.requester, &swap.provider, Some(swap.id))
            .await?;

        self.events.emit(DomainEvent::SwapAccepted { swap: swap.clone() });
        self.publish_update(&swap);
        Ok(swap)
    }

    /// Reject a pending swap (provider only).
    ///
    /// # Errors
    ///
    /// `Forbidden` unless the actor is the provider; `Conflict`/`State` for
    /// a swap not in `pending`.
    pub async fn reject(
        &self,
        actor: &str,
        id: SwapId,
        reason: Option<String>,
    ) -> Result<SwapRequest> {
        let swap = self.store.get(id).await?;
        if swap.provider != actor {
            return Err(EngineError::Forbidden(
                "only the provider can reject a swap request".into(),
            ));
        }

        let patch = SwapPatch {
            responded_at: Some(now_millis()),
            reject_reason: reason.clone(),
            ..SwapPatch::default()
        };
        let swap = self
            .store
            .transition(id, &[SwapStatus::Pending], SwapStatus::Rejected, patch)
            .await?;

        self.events.emit(DomainEvent::SwapRejected {
            swap: swap.clone(),
            reason,
        });
        self.publish_update(&swap);
        Ok(swap)
    }

    /// Start the session (either participant, from `accepted`).
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-participants; `Conflict`/`State` for a swap not
    /// in `accepted`.
    pub async fn start(&self, actor: &str, id: SwapId) -> Result<SwapRequest> {
        let swap = self.store.get(id).await?;
        if !swap.is_participant(actor) {
            return Err(EngineError::Forbidden(
                "only a participant can start a swap session".into(),
            ));
        }

        let patch = SwapPatch {
            started_at: Some(now_millis()),
            ..SwapPatch::default()
        };
        let swap = self
            .store
            .transition(id, &[SwapStatus::Accepted], SwapStatus::InProgress, patch)
            .await?;

        self.publish_update(&swap);
        Ok(swap)
    }

    /// Complete the swap (either participant, from `accepted` or
    /// `in_progress`).
    ///
    /// The settlement claim makes the transfer and the status change one
    /// unit: while the claim is held no other transition (a concurrent
    /// Complete, a Cancel) can touch the swap, so credits never move on a
    /// swap that ends anywhere but `completed`. The transfer itself is
    /// additionally idempotent per swap id.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-participants; `InsufficientFunds` if the
    /// requester cannot cover a paid swap; `Conflict` on a swap that is
    /// already terminal or mid-settlement.
    pub async fn complete(
        &self,
        actor: &str,
        id: SwapId,
        session_notes: Option<String>,
    ) -> Result<SwapRequest> {
        let swap = self.store.get(id).await?;
        if !swap.is_participant(actor) {
            return Err(EngineError::Forbidden(
                "only a participant can complete a swap".into(),
            ));
        }

        let swap = self
            .store
            .begin_settlement(id, &[SwapStatus::Accepted, SwapStatus::InProgress])
            .await?;

        if swap.kind == ExchangeKind::Paid {
            if let Err(err) = self
                .ledger
                .transfer(
                    &swap.requester,
                    &swap.provider,
                    swap.amount,
                    &format!("swap:{id}:completion"),
                )
                .await
            {
                self.store.abort_settlement(id).await;
                return Err(err);
            }
        }

        let patch = SwapPatch {
            completed_at: Some(now_millis()),
            session_notes,
            ..SwapPatch::default()
        };
        let swap = self.store.finish_settlement(id, patch).await?;

        // Only the claim holder reaches the counters and the event.
        self.stats
            .increment(&swap.requester, StatCounter::SwapsCompleted)
            .await;
        self.stats
            .increment(&swap.provider, StatCounter::SwapsCompleted)
            .await;
        self.stats
            .increment(&swap.provider, StatCounter::SessionsTaught)
            .await;
        self.stats
            .increment(&swap.requester, StatCounter::SessionsLearned)
            .await;
        if swap.kind == ExchangeKind::Exchange {
            // Skill-for-skill swaps teach in both directions.
            self.stats
                .increment(&swap.requester, StatCounter::SessionsTaught)
                .await;
            self.stats
                .increment(&swap.provider, StatCounter::SessionsLearned)
                .await;
        }

        info!(swap = swap.id, by = %actor, "Swap completed");
        self.events.emit(DomainEvent::SwapCompleted {
            swap: swap.clone(),
            completed_by: actor.to_string(),
        });
        self.publish_update(&swap);
        Ok(swap)
    }

    /// Cancel the swap (either participant, from any non-terminal state).
    ///
    /// Credits only move at completion and cancel is rejected once the swap
    /// is terminal, so there is never a transferred balance to reverse.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-participants; `Conflict` on a terminal swap.
    pub async fn cancel(
        &self,
        actor: &str,
        id: SwapId,
        reason: Option<String>,
    ) -> Result<SwapRequest> {
        let swap = self.store.get(id).await?;
        if !swap.is_participant(actor) {
            return Err(EngineError::Forbidden(
                "only a participant can cancel a swap".into(),
            ));
        }

        let patch = SwapPatch {
            cancelled_by: Some(actor.to_string()),
            cancel_reason: reason.clone(),
            ..SwapPatch::default()
        };
        let swap = self
            .store
            .transition(
                id,
                &[
                    SwapStatus::Pending,
                    SwapStatus::Accepted,
                    SwapStatus::InProgress,
                ],
                SwapStatus::Cancelled,
                patch,
            )
            .await?;

        self.events.emit(DomainEvent::SwapCancelled {
            swap: swap.clone(),
            cancelled_by: actor.to_string(),
            reason,
        });
        self.publish_update(&swap);
        Ok(swap)
    }

    /// Attach a review (either participant, from `completed`, once per role).
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-participants; `State` unless completed;
    /// `Conflict` for a second review from the same role.
    pub async fn review(&self, actor: &str, id: SwapId, review_id: u64) -> Result<SwapRequest> {
        let swap = self.store.get(id).await?;
        let role = if swap.requester == actor {
            ReviewRole::Requester
        } else if swap.provider == actor {
            ReviewRole::Provider
        } else {
            return Err(EngineError::Forbidden(
                "only a participant can review a swap".into(),
            ));
        };

        let swap = self.store.attach_review(id, role, review_id).await?;

        self.events.emit(DomainEvent::ReviewSubmitted {
            swap: swap.clone(),
            reviewer: actor.to_string(),
        });
        self.publish_update(&swap);
        Ok(swap)
    }

    /// Fetch a swap, enforcing participation.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-participants.
    pub async fn get(&self, actor: &str, id: SwapId) -> Result<SwapRequest> {
        let swap = self.store.get(id).await?;
        if !swap.is_participant(actor) {
            return Err(EngineError::Forbidden(
                "only a participant can view a swap".into(),
            ));
        }
        Ok(swap)
    }

    /// Swaps the actor participates in.
    pub async fn list(&self, actor: &str) -> Result<Vec<SwapRequest>> {
        self.store.list_for(actor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::InMemoryChatStore;
    use crate::external::{InMemoryLedger, InMemoryStats};

    struct Harness {
        swaps: SwapService,
        ledger: Arc<InMemoryLedger>,
        stats: Arc<InMemoryStats>,
    }

    fn harness() -> Harness {
        let router = Arc::new(Router::new());
        let (events, _rx) = EventBus::new();
        let chat = ChatService::new(
            Arc::new(InMemoryChatStore::new()),
            router.clone(),
            events.clone(),
        );
        let ledger = Arc::new(InMemoryLedger::new());
        let stats = Arc::new(InMemoryStats::new());
        let swaps = SwapService::new(
            Arc::new(InMemorySwapStore::new()),
            ledger.clone(),
            stats.clone(),
            router,
            chat,
            events,
        );
        Harness {
            swaps,
            ledger,
            stats,
        }
    }

    fn new_swap(requester: &str, provider: &str, kind: ExchangeKind, amount: i64) -> NewSwap {
        NewSwap {
            requester: requester.to_string(),
            provider: provider.to_string(),
            skill_id: 1,
            offered_skill_id: None,
            description: None,
            kind,
            amount,
            proposed_schedule: None,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_self_swap() {
        let h = harness();
        let err = h
            .swaps
            .create("alice", new_swap("alice", "alice", ExchangeKind::Exchange, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_active_pair() {
        let h = harness();
        h.swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Exchange, 0))
            .await
            .unwrap();

        let err = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Exchange, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // The reverse direction is the same unordered pair
        let err = h
            .swaps
            .create("bob", new_swap("bob", "alice", ExchangeKind::Exchange, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_pair_freed_after_terminal_state() {
        let h = harness();
        let swap = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Exchange, 0))
            .await
            .unwrap();
        h.swaps.reject("bob", swap.id, None).await.unwrap();

        // A new request between the same pair is allowed again
        assert!(h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Exchange, 0))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_accept_provider_only() {
        let h = harness();
        let swap = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Exchange, 0))
            .await
            .unwrap();

        assert!(matches!(
            h.swaps.accept("alice", swap.id, None).await,
            Err(EngineError::Forbidden(_))
        ));

        let accepted = h.swaps.accept("bob", swap.id, None).await.unwrap();
        assert_eq!(accepted.status, SwapStatus::Accepted);
        assert!(accepted.responded_at.is_some());
    }

    #[tokio::test]
    async fn test_accept_twice_conflicts() {
        let h = harness();
        let swap = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Exchange, 0))
            .await
            .unwrap();
        h.swaps.accept("bob", swap.id, None).await.unwrap();

        // Accepted is not terminal, so this is a state error, not a conflict
        assert!(matches!(
            h.swaps.accept("bob", swap.id, None).await,
            Err(EngineError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_from_accepted_or_in_progress() {
        let h = harness();
        let swap = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Exchange, 0))
            .await
            .unwrap();

        // Cannot complete while pending
        assert!(matches!(
            h.swaps.complete("alice", swap.id, None).await,
            Err(EngineError::State(_))
        ));

        h.swaps.accept("bob", swap.id, None).await.unwrap();
        h.swaps.start("alice", swap.id).await.unwrap();
        let done = h.swaps.complete("bob", swap.id, Some("great".into())).await.unwrap();
        assert_eq!(done.status, SwapStatus::Completed);
        assert_eq!(done.session_notes.as_deref(), Some("great"));
    }

    #[tokio::test]
    async fn test_duplicate_complete_is_noop() {
        let h = harness();
        h.ledger.deposit("alice", 100);
        let swap = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Paid, 50))
            .await
            .unwrap();
        h.swaps.accept("bob", swap.id, None).await.unwrap();
        h.swaps.complete("bob", swap.id, None).await.unwrap();

        let err = h.swaps.complete("bob", swap.id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // No second transfer, no second counter bump
        assert_eq!(h.ledger.balance("alice").await.unwrap(), 50);
        assert_eq!(h.ledger.balance("bob").await.unwrap(), 50);
        assert_eq!(h.stats.get("bob", StatCounter::SwapsCompleted).await, 1);
    }

    #[tokio::test]
    async fn test_complete_insufficient_funds_keeps_state() {
        let h = harness();
        h.ledger.deposit("alice", 10);
        let swap = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Paid, 50))
            .await
            .unwrap();
        h.swaps.accept("bob", swap.id, None).await.unwrap();

        let err = h.swaps.complete("bob", swap.id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        // Swap untouched, still completable after a top-up
        let current = h.swaps.get("alice", swap.id).await.unwrap();
        assert_eq!(current.status, SwapStatus::Accepted);

        h.ledger.deposit("alice", 40);
        assert!(h.swaps.complete("bob", swap.id, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_from_non_terminal_only() {
        let h = harness();
        let swap = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Exchange, 0))
            .await
            .unwrap();
        h.swaps.accept("bob", swap.id, None).await.unwrap();
        h.swaps.complete("alice", swap.id, None).await.unwrap();

        let err = h
            .swaps
            .cancel("alice", swap.id, Some("changed my mind".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_records_reason_and_canceller() {
        let h = harness();
        let swap = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Exchange, 0))
            .await
            .unwrap();

        let cancelled = h
            .swaps
            .cancel("alice", swap.id, Some("schedule conflict".into()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, SwapStatus::Cancelled);
        assert_eq!(cancelled.cancelled_by.as_deref(), Some("alice"));
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("schedule conflict"));
    }

    #[tokio::test]
    async fn test_review_once_per_role() {
        let h = harness();
        let swap = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Exchange, 0))
            .await
            .unwrap();

        // Not yet completed
        assert!(matches!(
            h.swaps.review("alice", swap.id, 11).await,
            Err(EngineError::State(_))
        ));

        h.swaps.accept("bob", swap.id, None).await.unwrap();
        h.swaps.complete("alice", swap.id, None).await.unwrap();

        let reviewed = h.swaps.review("alice", swap.id, 11).await.unwrap();
        assert_eq!(reviewed.requester_review, Some(11));

        // Same role again conflicts; the other role still may review
        assert!(matches!(
            h.swaps.review("alice", swap.id, 12).await,
            Err(EngineError::Conflict(_))
        ));
        let reviewed = h.swaps.review("bob", swap.id, 13).await.unwrap();
        assert_eq!(reviewed.provider_review, Some(13));
    }

    /// Ledger whose transfers park until released, to hold a Complete open
    /// mid-settlement.
    struct GatedLedger {
        inner: InMemoryLedger,
        entered: tokio::sync::Semaphore,
        release: tokio::sync::Semaphore,
    }

    impl GatedLedger {
        fn new() -> Self {
            Self {
                inner: InMemoryLedger::new(),
                entered: tokio::sync::Semaphore::new(0),
                release: tokio::sync::Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl CreditLedger for GatedLedger {
        async fn transfer(
            &self,
            payer: &str,
            payee: &str,
            amount: i64,
            idempotency_key: &str,
        ) -> crate::error::Result<()> {
            self.entered.add_permits(1);
            self.release.acquire().await.unwrap().forget();
            self.inner.transfer(payer, payee, amount, idempotency_key).await
        }

        async fn balance(&self, principal: &str) -> crate::error::Result<i64> {
            self.inner.balance(principal).await
        }
    }

    #[tokio::test]
    async fn test_cancel_cannot_slip_in_mid_settlement() {
        let router = Arc::new(Router::new());
        let (events, _rx) = EventBus::new();
        let chat = ChatService::new(
            Arc::new(InMemoryChatStore::new()),
            router.clone(),
            events.clone(),
        );
        let ledger = Arc::new(GatedLedger::new());
        ledger.inner.deposit("alice", 100);
        let swaps = SwapService::new(
            Arc::new(InMemorySwapStore::new()),
            ledger.clone(),
            Arc::new(InMemoryStats::new()),
            router,
            chat,
            events,
        );

        let swap = swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Paid, 100))
            .await
            .unwrap();
        swaps.accept("bob", swap.id, None).await.unwrap();

        let completer = swaps.clone();
        let id = swap.id;
        let task = tokio::spawn(async move { completer.complete("bob", id, None).await });

        // Park the complete inside the ledger transfer
        ledger.entered.acquire().await.unwrap().forget();

        // Cancel must bounce off the settlement claim, not win the race
        let err = swaps.cancel("alice", id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        ledger.release.add_permits(1);
        let done = task.await.unwrap().unwrap();
        assert_eq!(done.status, SwapStatus::Completed);
        assert_eq!(ledger.inner.balance("alice").await.unwrap(), 0);
        assert_eq!(ledger.inner.balance("bob").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_concurrent_completes_settle_once() {
        let h = harness();
        h.ledger.deposit("alice", 100);
        let swap = h
            .swaps
            .create("alice", new_swap("alice", "bob", ExchangeKind::Paid, 100))
            .await
            .unwrap();
        h.swaps.accept("bob", swap.id, None).await.unwrap();
        h.swaps.start("bob", swap.id).await.unwrap();

        let s1 = h.swaps.clone();
        let s2 = h.swaps.clone();
        let id = swap.id;
        let t1 = tokio::spawn(async move { s1.complete("alice", id, None).await });
        let t2 = tokio::spawn(async move { s2.complete("bob", id, None).await });

        let r1 = t1.await.unwrap();
        let r2 = t2.await.unwrap();

        // Exactly one winner
        assert_eq!(r1.is_ok() as u8 + r2.is_ok() as u8, 1);

        // Exactly one transfer and one counter increment per participant
        assert_eq!(h.ledger.balance("alice").await.unwrap(), 0);
        assert_eq!(h.ledger.balance("bob").await.unwrap(), 100);
        assert_eq!(h.stats.get("alice", StatCounter::SwapsCompleted).await, 1);
        assert_eq!(h.stats.get("bob", StatCounter::SwapsCompleted).await, 1);
    }
}
