//! Notification persistence and dispatch.
//!
//! The dispatcher consumes domain events off the bus and, for each
//! addressed recipient, always persists a notification and additionally
//! pushes it over the recipient's user channel when the presence registry
//! says at least one of their connections is live. Persistence never
//! depends on presence; a recipient who is offline reads the backlog later.

use crate::error::{EngineError, Result};
use crate::events::DomainEvent;
use crate::external::{Catalog, UserDirectory};
use crate::swap::SwapRequest;
use crate::types::{IdSequence, NotificationId, PrincipalId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tandem_core::event::{names, now_millis};
use tandem_core::{user_channel, PresenceRegistry, Router};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    SwapRequest,
    SwapAccepted,
    SwapRejected,
    SwapCancelled,
    ReviewPrompt,
    ReviewReceived,
    NewMessage,
    WorkshopEnrollment,
}

/// Delivery priority, carried to clients for display ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// A persisted notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient: PrincipalId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    /// Structured context (swap id, conversation id, ...).
    pub payload: Value,
    pub priority: Priority,
    pub is_read: bool,
    /// When the recipient read it, stamped once by `mark_read`.
    pub read_at: Option<u64>,
    pub created_at: u64,
    /// Past this instant the notification no longer shows up in reads.
    pub expires_at: Option<u64>,
}

impl Notification {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Input for persisting a notification.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient: PrincipalId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub payload: Value,
    pub priority: Priority,
    pub expires_at: Option<u64>,
}

/// Storage seam for notifications.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a notification.
    async fn insert(&self, new: NewNotification) -> Result<Notification>;

    /// Notifications for a recipient, newest first. Expired entries are
    /// omitted.
    async fn list_for(&self, recipient: &str, unread_only: bool) -> Result<Vec<Notification>>;

    /// Mark one notification read. Idempotent; marking an already-read
    /// notification returns `false`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `Forbidden` if the notification belongs
    /// to someone else.
    async fn mark_read(&self, recipient: &str, id: NotificationId) -> Result<bool>;

    /// Mark all of a recipient's notifications read, returning how many
    /// changed.
    async fn mark_all_read(&self, recipient: &str) -> Result<usize>;

    /// Count of unread, unexpired notifications.
    async fn unread_count(&self, recipient: &str) -> Result<usize>;
}

/// In-memory notification store.
#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    /// Recipient -> notifications, append order.
    by_recipient: DashMap<PrincipalId, Vec<Notification>>,
    /// Id -> owner, for lookup without scanning.
    owners: DashMap<NotificationId, PrincipalId>,
    ids: IdSequence,
}

impl InMemoryNotificationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, new: NewNotification) -> Result<Notification> {
        let notification = Notification {
            id: self.ids.next(),
            recipient: new.recipient,
            kind: new.kind,
            title: new.title,
            body: new.body,
            payload: new.payload,
            priority: new.priority,
            is_read: false,
            read_at: None,
            created_at: now_millis(),
            expires_at: new.expires_at,
        };

        self.owners
            .insert(notification.id, notification.recipient.clone());
        self.by_recipient
            .entry(notification.recipient.clone())
            .or_default()
            .push(notification.clone());

        Ok(notification)
    }

    async fn list_for(&self, recipient: &str, unread_only: bool) -> Result<Vec<Notification>> {
        let now = now_millis();
        let mut list: Vec<Notification> = self
            .by_recipient
            .get(recipient)
            .map(|v| {
                v.iter()
                    .filter(|n| !n.is_expired(now) && (!unread_only || !n.is_read))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        list.reverse();
        Ok(list)
    }

    async fn mark_read(&self, recipient: &str, id: NotificationId) -> Result<bool> {
        let owner = self
            .owners
            .get(&id)
            .map(|o| o.clone())
            .ok_or(EngineError::NotFound("notification"))?;
        if owner != recipient {
            return Err(EngineError::Forbidden(
                "notification belongs to another principal".into(),
            ));
        }

        let mut list = self
            .by_recipient
            .get_mut(recipient)
            .ok_or(EngineError::NotFound("notification"))?;
        let notification = list
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(EngineError::NotFound("notification"))?;

        if notification.is_read {
            return Ok(false);
        }
        notification.is_read = true;
        notification.read_at = Some(now_millis());
        Ok(true)
    }

    async fn mark_all_read(&self, recipient: &str) -> Result<usize> {
        let Some(mut list) = self.by_recipient.get_mut(recipient) else {
            return Ok(0);
        };
        let now = now_millis();
        let mut changed = 0;
        for n in list.iter_mut().filter(|n| !n.is_read) {
            n.is_read = true;
            n.read_at = Some(now);
            changed += 1;
        }
        Ok(changed)
    }

    async fn unread_count(&self, recipient: &str) -> Result<usize> {
        let now = now_millis();
        Ok(self
            .by_recipient
            .get(recipient)
            .map(|v| v.iter().filter(|n| !n.is_expired(now) && !n.is_read).count())
            .unwrap_or(0))
    }
}

/// Turns domain events into persisted notifications and live pushes.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn NotificationStore>,
    registry: Arc<PresenceRegistry>,
    router: Arc<Router>,
    directory: Arc<dyn UserDirectory>,
    catalog: Arc<dyn Catalog>,
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: Arc<PresenceRegistry>,
        router: Arc<Router>,
        directory: Arc<dyn UserDirectory>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            store,
            registry,
            router,
            directory,
            catalog,
        }
    }

    /// The notification store (read surface for HTTP handlers).
    #[must_use]
    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Consume events until the bus closes. Spawn this on the runtime.
    pub async fn run(self, mut rx: UnboundedReceiver<DomainEvent>) {
        info!("Notification dispatcher started");
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        info!("Notification dispatcher stopped: event bus closed");
    }

    /// Drain every event currently queued. Test helper for deterministic
    /// assertions without sleeping.
    pub async fn drain(&self, rx: &mut UnboundedReceiver<DomainEvent>) {
        while let Ok(event) = rx.try_recv() {
            self.handle(event).await;
        }
    }

    /// Handle one domain event.
    pub async fn handle(&self, event: DomainEvent) {
        match event {
            DomainEvent::SwapCreated { swap } => {
                let requester = self.display_name(&swap.requester).await;
                let skill = self.skill_title(swap.skill_id).await;
                self.deliver(NewNotification {
                    recipient: swap.provider.clone(),
                    kind: NotificationKind::SwapRequest,
                    title: "New swap request".into(),
                    body: format!("{requester} wants to learn {skill}"),
                    payload: swap_payload(&swap),
                    priority: Priority::High,
                    expires_at: None,
                })
                .await;
            }
            DomainEvent::SwapAccepted { swap } => {
                let provider = self.display_name(&swap.provider).await;
                self.deliver(NewNotification {
                    recipient: swap.requester.clone(),
                    kind: NotificationKind::SwapAccepted,
                    title: "Swap accepted".into(),
                    body: format!("{provider} accepted your swap request"),
                    payload: swap_payload(&swap),
                    priority: Priority::High,
                    expires_at: None,
                })
                .await;
            }
            DomainEvent::SwapRejected { swap, reason } => {
                let provider = self.display_name(&swap.provider).await;
                let body = match reason {
                    Some(reason) => format!("{provider} declined your swap request: {reason}"),
                    None => format!("{provider} declined your swap request"),
                };
                self.deliver(NewNotification {
                    recipient: swap.requester.clone(),
                    kind: NotificationKind::SwapRejected,
                    title: "Swap declined".into(),
                    body,
                    payload: swap_payload(&swap),
                    priority: Priority::Normal,
                    expires_at: None,
                })
                .await;
            }
            DomainEvent::SwapCancelled {
                swap,
                cancelled_by,
                reason,
            } => {
                // Only the counterpart of the canceller is notified.
                let recipient = swap.counterpart_of(&cancelled_by).to_string();
                let canceller = self.display_name(&cancelled_by).await;
                let body = match reason {
                    Some(reason) => format!("{canceller} cancelled the swap: {reason}"),
                    None => format!("{canceller} cancelled the swap"),
                };
                self.deliver(NewNotification {
                    recipient,
                    kind: NotificationKind::SwapCancelled,
                    title: "Swap cancelled".into(),
                    body,
                    payload: swap_payload(&swap),
                    priority: Priority::Normal,
                    expires_at: None,
                })
                .await;
            }
            DomainEvent::SwapCompleted { swap, completed_by } => {
                // One notification per transition: the counterpart learns of
                // the completion through the review prompt itself.
                let recipient = swap.counterpart_of(&completed_by).to_string();
                let completer = self.display_name(&completed_by).await;
                self.deliver(NewNotification {
                    recipient,
                    kind: NotificationKind::ReviewPrompt,
                    title: "Swap completed".into(),
                    body: format!(
                        "{completer} marked the swap as completed. How was your session?"
                    ),
                    payload: swap_payload(&swap),
                    priority: Priority::Normal,
                    expires_at: None,
                })
                .await;
            }
            DomainEvent::ReviewSubmitted { swap, reviewer } => {
                let recipient = swap.counterpart_of(&reviewer).to_string();
                let reviewer = self.display_name(&reviewer).await;
                self.deliver(NewNotification {
                    recipient,
                    kind: NotificationKind::ReviewReceived,
                    title: "New review".into(),
                    body: format!("{reviewer} left you a review"),
                    payload: swap_payload(&swap),
                    priority: Priority::Low,
                    expires_at: None,
                })
                .await;
            }
            DomainEvent::MessageSent {
                conversation_id,
                message,
                recipients,
            } => {
                let sender = self.display_name(&message.sender).await;
                let preview = message.preview();
                for recipient in recipients {
                    self.deliver(NewNotification {
                        recipient,
                        kind: NotificationKind::NewMessage,
                        title: format!("Message from {sender}"),
                        body: preview.clone(),
                        payload: json!({
                            "conversation_id": conversation_id,
                            "message_id": message.id,
                            "sender": message.sender,
                        }),
                        priority: Priority::Normal,
                        expires_at: None,
                    })
                    .await;
                }
            }
            DomainEvent::WorkshopEnrollment {
                workshop_id,
                host,
                attendee,
            } => {
                let attendee_name = self.display_name(&attendee).await;
                let title = self
                    .catalog
                    .workshop_title(workshop_id)
                    .await
                    .unwrap_or_else(|| "your workshop".to_string());
                self.deliver(NewNotification {
                    recipient: host,
                    kind: NotificationKind::WorkshopEnrollment,
                    title: "New workshop attendee".into(),
                    body: format!("{attendee_name} enrolled in {title}"),
                    payload: json!({
                        "workshop_id": workshop_id,
                        "attendee": attendee,
                    }),
                    priority: Priority::Normal,
                    expires_at: None,
                })
                .await;
            }
        }
    }

    /// Persist, then push to the recipient's user channel if they are online.
    async fn deliver(&self, new: NewNotification) {
        let recipient = new.recipient.clone();
        let notification = match self.store.insert(new).await {
            Ok(n) => n,
            Err(err) => {
                tracing::error!(recipient = %recipient, %err, "Failed to persist notification");
                return;
            }
        };

        if self.registry.is_online(&recipient) {
            let delivered = self.router.publish_to(
                &user_channel(&recipient),
                names::NOTIFICATION,
                serde_json::to_value(&notification).unwrap_or(Value::Null),
            );
            debug!(
                notification = notification.id,
                recipient = %recipient,
                delivered,
                "Notification pushed live"
            );
        } else {
            debug!(
                notification = notification.id,
                recipient = %recipient,
                "Recipient offline, notification persisted only"
            );
        }
    }

    /// Display name with graceful fallback to the raw principal id.
    async fn display_name(&self, principal: &str) -> String {
        match self.directory.lookup(principal).await {
            Ok(profile) => profile.display_name,
            Err(_) => principal.to_string(),
        }
    }

    async fn skill_title(&self, skill_id: crate::types::CatalogId) -> String {
        self.catalog
            .skill_title(skill_id)
            .await
            .unwrap_or_else(|| "a skill".to_string())
    }
}

fn swap_payload(swap: &SwapRequest) -> Value {
    json!({
        "swap_id": swap.id,
        "requester": swap.requester,
        "provider": swap.provider,
        "skill_id": swap.skill_id,
        "status": swap.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InMemoryCatalog, InMemoryDirectory};
    use crate::swap::{ExchangeKind, SwapStatus};

    fn dispatcher() -> (Dispatcher, Arc<PresenceRegistry>, Arc<Router>) {
        let registry = Arc::new(PresenceRegistry::new());
        let router = Arc::new(Router::new());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.insert("alice", "Alice");
        directory.insert("bob", "Bob");
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.insert_skill(1, "Spanish conversation");

        let d = Dispatcher::new(
            Arc::new(InMemoryNotificationStore::new()),
            registry.clone(),
            router.clone(),
            directory,
            catalog,
        );
        (d, registry, router)
    }

    fn sample_swap() -> SwapRequest {
        SwapRequest::sample("alice", "bob", ExchangeKind::Exchange, 0, SwapStatus::Pending)
    }

    #[tokio::test]
    async fn test_swap_created_persists_for_provider() {
        let (d, _registry, _router) = dispatcher();

        d.handle(DomainEvent::SwapCreated { swap: sample_swap() }).await;

        let list = d.store().list_for("bob", false).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, NotificationKind::SwapRequest);
        assert_eq!(list[0].body, "Alice wants to learn Spanish conversation");
        assert!(!list[0].is_read);

        // Nothing for the requester
        assert!(d.store().list_for("alice", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_recipient_gets_persisted_only() {
        let (d, registry, router) = dispatcher();

        // Bob online: a live push lands on his user channel
        registry.register("bob", "conn-b");
        let mut rx = router.join("conn-b", &user_channel("bob")).unwrap();
        d.handle(DomainEvent::SwapCreated { swap: sample_swap() }).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event, names::NOTIFICATION);

        // Bob offline: persisted, no push possible
        registry.deregister("conn-b");
        router.leave_all("conn-b");
        d.handle(DomainEvent::SwapAccepted { swap: sample_swap() }).await;
        assert_eq!(d.store().unread_count("bob").await.unwrap(), 1);
        assert_eq!(d.store().unread_count("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_completed_prompts_only_the_counterpart() {
        let (d, _registry, _router) = dispatcher();
        let mut swap = sample_swap();
        swap.status = SwapStatus::Completed;

        d.handle(DomainEvent::SwapCompleted {
            swap,
            completed_by: "alice".into(),
        })
        .await;

        // One notification per transition, to the completer's counterpart
        let bob = d.store().list_for("bob", false).await.unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].kind, NotificationKind::ReviewPrompt);
        assert!(bob[0].body.starts_with("Alice marked the swap as completed"));
        assert!(d.store().list_for("alice", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_idempotent_and_owned() {
        let (d, _registry, _router) = dispatcher();
        d.handle(DomainEvent::SwapCreated { swap: sample_swap() }).await;

        let id = d.store().list_for("bob", false).await.unwrap()[0].id;

        assert!(d.store().mark_read("bob", id).await.unwrap());
        assert!(!d.store().mark_read("bob", id).await.unwrap());
        assert!(matches!(
            d.store().mark_read("alice", id).await,
            Err(EngineError::Forbidden(_))
        ));
        assert_eq!(d.store().unread_count("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_stamps_read_at_once() {
        let (d, _registry, _router) = dispatcher();
        d.handle(DomainEvent::SwapCreated { swap: sample_swap() }).await;

        let id = d.store().list_for("bob", false).await.unwrap()[0].id;
        assert!(d.store().mark_read("bob", id).await.unwrap());

        let read = d.store().list_for("bob", false).await.unwrap();
        let stamped = read[0].read_at.unwrap();
        assert!(stamped >= read[0].created_at);

        // A repeated mark keeps the original stamp
        assert!(!d.store().mark_read("bob", id).await.unwrap());
        let read = d.store().list_for("bob", false).await.unwrap();
        assert_eq!(read[0].read_at, Some(stamped));
    }

    #[tokio::test]
    async fn test_expired_notifications_hidden_from_reads() {
        let (d, _registry, _router) = dispatcher();

        let expired = NewNotification {
            recipient: "bob".into(),
            kind: NotificationKind::ReviewPrompt,
            title: "Leave a review".into(),
            body: "How was your session with Alice?".into(),
            payload: json!({}),
            priority: Priority::Low,
            expires_at: Some(now_millis() - 1),
        };
        d.store().insert(expired).await.unwrap();
        d.handle(DomainEvent::SwapCreated { swap: sample_swap() }).await;

        // Only the live notification surfaces
        let list = d.store().list_for("bob", false).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, NotificationKind::SwapRequest);
        assert_eq!(d.store().unread_count("bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_all_read() {
        let (d, _registry, _router) = dispatcher();
        d.handle(DomainEvent::SwapCreated { swap: sample_swap() }).await;
        d.handle(DomainEvent::SwapCancelled {
            swap: sample_swap(),
            cancelled_by: "alice".into(),
            reason: None,
        })
        .await;

        assert_eq!(d.store().mark_all_read("bob").await.unwrap(), 2);
        assert_eq!(d.store().mark_all_read("bob").await.unwrap(), 0);
        assert_eq!(d.store().unread_count("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_principal_falls_back_to_id() {
        let (d, _registry, _router) = dispatcher();
        let swap = SwapRequest::sample("mallory", "bob", ExchangeKind::Exchange, 0, SwapStatus::Pending);

        d.handle(DomainEvent::SwapCreated { swap }).await;

        let list = d.store().list_for("bob", false).await.unwrap();
        assert!(list[0].body.starts_with("mallory "));
    }

    #[tokio::test]
    async fn test_message_sent_notifies_recipients_with_preview() {
        let (d, _registry, _router) = dispatcher();
        let message = crate::chat::Message::sample(7, 3, "alice", "hola, ready for our session?");

        d.handle(DomainEvent::MessageSent {
            conversation_id: 3,
            message,
            recipients: vec!["bob".into()],
        })
        .await;

        let list = d.store().list_for("bob", false).await.unwrap();
        assert_eq!(list[0].kind, NotificationKind::NewMessage);
        assert_eq!(list[0].title, "Message from Alice");
        assert_eq!(list[0].body, "hola, ready for our session?");
    }
}
