//! Conversations and the append-only message log.
//!
//! A conversation is a thread between a fixed, unordered pair of
//! participants, created lazily on swap acceptance or explicit request.
//! Messages are append-only: edits rewrite content in place inside a
//! 15-minute window, deletes leave a tombstone so ordering and audit
//! history survive.

use crate::error::{EngineError, Result};
use crate::events::{DomainEvent, EventBus};
use crate::types::{pair_key, ConversationId, IdSequence, MessageId, PrincipalId, SwapId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tandem_core::event::{names, now_millis};
use tandem_core::{conversation_channel, Router};
use tracing::debug;

/// How long after creation a message may still be edited.
pub const EDIT_WINDOW_MS: u64 = 15 * 60 * 1000;

/// Maximum length of the `last_message` preview, in characters.
pub const PREVIEW_MAX_CHARS: usize = 80;

/// Content a deleted message is replaced with.
pub const DELETED_TOMBSTONE: &str = "This message has been deleted";

/// A conversation between a fixed set of participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Unordered participant set (currently always two).
    pub participants: Vec<PrincipalId>,
    /// Swap this conversation was created for, if any.
    pub swap_id: Option<SwapId>,
    /// Truncated preview of the most recent message.
    pub last_message: Option<String>,
    /// When the most recent message arrived (epoch millis).
    pub last_message_at: Option<u64>,
    /// Unread counter per participant. Never negative: reset to 0 on read.
    pub unread: HashMap<PrincipalId, u32>,
    /// Whether the conversation is active.
    pub is_active: bool,
    /// Creation time (epoch millis).
    pub created_at: u64,
}

impl Conversation {
    /// Check whether a principal participates in this conversation.
    #[must_use]
    pub fn is_participant(&self, principal: &str) -> bool {
        self.participants.iter().any(|p| p == principal)
    }

    /// Participants other than the given principal.
    #[must_use]
    pub fn counterparts(&self, principal: &str) -> Vec<PrincipalId> {
        self.participants
            .iter()
            .filter(|p| p.as_str() != principal)
            .cloned()
            .collect()
    }
}

/// Message content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    System,
}

/// A message in a conversation.
///
/// Once created a message belongs to exactly one conversation and is never
/// moved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender: PrincipalId,
    /// Message content (tombstone text once deleted).
    pub content: String,
    /// Content type.
    pub kind: MessageKind,
    /// Optional attachment reference.
    pub attachment: Option<String>,
    /// Principals who have read this message, with read timestamps.
    pub read_by: HashMap<PrincipalId, u64>,
    /// Whether the content was edited after creation.
    pub is_edited: bool,
    /// Whether the message was soft-deleted.
    pub is_deleted: bool,
    /// Creation time (epoch millis).
    pub created_at: u64,
    /// Last edit time, if edited.
    pub edited_at: Option<u64>,
}

impl Message {
    /// Truncated preview used for the conversation's `last_message`.
    #[must_use]
    pub fn preview(&self) -> String {
        if self.content.chars().count() <= PREVIEW_MAX_CHARS {
            self.content.clone()
        } else {
            self.content.chars().take(PREVIEW_MAX_CHARS).collect()
        }
    }

    #[cfg(test)]
    pub(crate) fn sample(
        id: MessageId,
        conversation_id: ConversationId,
        sender: &str,
        content: &str,
    ) -> Self {
        let mut read_by = HashMap::new();
        read_by.insert(sender.to_string(), now_millis());
        Self {
            id,
            conversation_id,
            sender: sender.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            attachment: None,
            read_by,
            is_edited: false,
            is_deleted: false,
            created_at: now_millis(),
            edited_at: None,
        }
    }
}

/// Input for appending a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender: PrincipalId,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<String>,
}

/// Pagination cursor: everything strictly before this (created_at, id) pair.
pub type HistoryCursor = (u64, MessageId);

/// Storage seam for conversations and messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Return the conversation for an unordered pair, creating it if absent.
    ///
    /// The boolean is `true` when a new conversation was created. Unread
    /// counters start at 0 for every participant.
    async fn get_or_create_conversation(
        &self,
        a: &str,
        b: &str,
        swap_id: Option<SwapId>,
    ) -> Result<(Conversation, bool)>;

    /// Fetch a conversation by id.
    async fn conversation(&self, id: ConversationId) -> Result<Conversation>;

    /// Conversations a principal participates in, most recent first.
    async fn conversations_for(&self, principal: &str) -> Result<Vec<Conversation>>;

    /// Append a message: `read_by = {sender}`, every other participant's
    /// unread counter +1, preview updated. Atomic per conversation.
    async fn append_message(&self, new: NewMessage) -> Result<Message>;

    /// Fetch a message by id.
    async fn message(&self, id: MessageId) -> Result<Message>;

    /// Rewrite content in place and set the edited flag.
    async fn apply_edit(&self, id: MessageId, content: String, edited_at: u64) -> Result<Message>;

    /// Soft-delete: replace content with the tombstone, set the deleted flag,
    /// keep the record for ordering/audit.
    async fn apply_delete(&self, id: MessageId) -> Result<Message>;

    /// Add `reader` to `read_by` of every message authored by someone else
    /// (idempotent) and reset the reader's unread counter to 0. Returns the
    /// number of messages newly marked.
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader: &str,
        read_at: u64,
    ) -> Result<usize>;

    /// Page of history strictly before the cursor, returned in chronological
    /// order. Storage queries newest-first; ties break on (created_at, id).
    async fn history(
        &self,
        conversation_id: ConversationId,
        before: Option<HistoryCursor>,
        limit: usize,
    ) -> Result<Vec<Message>>;
}

/// In-memory chat store.
#[derive(Debug, Default)]
pub struct InMemoryChatStore {
    conversations: DashMap<ConversationId, Conversation>,
    pair_index: DashMap<(String, String), ConversationId>,
    messages: DashMap<ConversationId, Vec<Message>>,
    message_index: DashMap<MessageId, ConversationId>,
    conversation_ids: IdSequence,
    message_ids: IdSequence,
}

impl InMemoryChatStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate_message<F>(&self, id: MessageId, f: F) -> Result<Message>
    where
        F: FnOnce(&mut Message),
    {
        let conversation_id = *self
            .message_index
            .get(&id)
            .ok_or(EngineError::NotFound("message"))?;

        let mut log = self
            .messages
            .get_mut(&conversation_id)
            .ok_or(EngineError::NotFound("conversation"))?;

        let msg = log
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(EngineError::NotFound("message"))?;

        f(msg);
        Ok(msg.clone())
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn get_or_create_conversation(
        &self,
        a: &str,
        b: &str,
        swap_id: Option<SwapId>,
    ) -> Result<(Conversation, bool)> {
        if a == b {
            return Err(EngineError::Validation(
                "a conversation needs two distinct participants".into(),
            ));
        }

        let key = pair_key(a, b);
        match self.pair_index.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let id = *entry.get();
                drop(entry);

                let mut conv = self
                    .conversations
                    .get_mut(&id)
                    .ok_or(EngineError::NotFound("conversation"))?;
                conv.is_active = true;
                if conv.swap_id.is_none() {
                    conv.swap_id = swap_id;
                }
                Ok((conv.clone(), false))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let id = self.conversation_ids.next();
                let mut unread = HashMap::new();
                unread.insert(a.to_string(), 0);
                unread.insert(b.to_string(), 0);

                let conv = Conversation {
                    id,
                    participants: vec![a.to_string(), b.to_string()],
                    swap_id,
                    last_message: None,
                    last_message_at: None,
                    unread,
                    is_active: true,
                    created_at: now_millis(),
                };

                self.conversations.insert(id, conv.clone());
                self.messages.insert(id, Vec::new());
                entry.insert(id);

                debug!(conversation = id, "Conversation created");
                Ok((conv, true))
            }
        }
    }

    async fn conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conversations
            .get(&id)
            .map(|c| c.clone())
            .ok_or(EngineError::NotFound("conversation"))
    }

    async fn conversations_for(&self, principal: &str) -> Result<Vec<Conversation>> {
        let mut convs: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.is_participant(principal))
            .map(|c| c.clone())
            .collect();
        convs.sort_by_key(|c| std::cmp::Reverse(c.last_message_at.unwrap_or(c.created_at)));
        Ok(convs)
    }

    async fn append_message(&self, new: NewMessage) -> Result<Message> {
        let now = now_millis();
        let id = self.message_ids.next();

        let mut read_by = HashMap::new();
        read_by.insert(new.sender.clone(), now);

        let message = Message {
            id,
            conversation_id: new.conversation_id,
            sender: new.sender.clone(),
            content: new.content,
            kind: new.kind,
            attachment: new.attachment,
            read_by,
            is_edited: false,
            is_deleted: false,
            created_at: now,
            edited_at: None,
        };

        {
            let mut log = self
                .messages
                .get_mut(&new.conversation_id)
                .ok_or(EngineError::NotFound("conversation"))?;
            log.push(message.clone());
        }
        self.message_index.insert(id, new.conversation_id);

        let mut conv = self
            .conversations
            .get_mut(&new.conversation_id)
            .ok_or(EngineError::NotFound("conversation"))?;
        conv.last_message = Some(message.preview());
        conv.last_message_at = Some(now);
        for participant in conv.participants.clone() {
            if participant != new.sender {
                *conv.unread.entry(participant).or_insert(0) += 1;
            }
        }

        Ok(message)
    }

    async fn message(&self, id: MessageId) -> Result<Message> {
        let conversation_id = *self
            .message_index
            .get(&id)
            .ok_or(EngineError::NotFound("message"))?;
        let log = self
            .messages
            .get(&conversation_id)
            .ok_or(EngineError::NotFound("conversation"))?;
        log.iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or(EngineError::NotFound("message"))
    }

    async fn apply_edit(&self, id: MessageId, content: String, edited_at: u64) -> Result<Message> {
        self.mutate_message(id, |msg| {
            msg.content = content;
            msg.is_edited = true;
            msg.edited_at = Some(edited_at);
        })
    }

    async fn apply_delete(&self, id: MessageId) -> Result<Message> {
        self.mutate_message(id, |msg| {
            msg.content = DELETED_TOMBSTONE.to_string();
            msg.is_deleted = true;
        })
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader: &str,
        read_at: u64,
    ) -> Result<usize> {
        let mut newly_read = 0;
        {
            let mut log = self
                .messages
                .get_mut(&conversation_id)
                .ok_or(EngineError::NotFound("conversation"))?;
            for msg in log.iter_mut() {
                if msg.sender != reader && !msg.read_by.contains_key(reader) {
                    msg.read_by.insert(reader.to_string(), read_at);
                    newly_read += 1;
                }
            }
        }

        let mut conv = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(EngineError::NotFound("conversation"))?;
        conv.unread.insert(reader.to_string(), 0);

        Ok(newly_read)
    }

    async fn history(
        &self,
        conversation_id: ConversationId,
        before: Option<HistoryCursor>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let log = self
            .messages
            .get(&conversation_id)
            .ok_or(EngineError::NotFound("conversation"))?;

        // Newest-first scan, then reorder to chronological for the caller.
        let mut page: Vec<Message> = log
            .iter()
            .filter(|m| match before {
                Some(cursor) => (m.created_at, m.id) < cursor,
                None => true,
            })
            .cloned()
            .collect();
        page.sort_by_key(|m| std::cmp::Reverse((m.created_at, m.id)));
        page.truncate(limit);
        page.reverse();

        Ok(page)
    }
}

/// Conversation and message operations, wired to the router and event bus.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    router: Arc<Router>,
    events: EventBus,
}

impl ChatService {
    /// Create a new chat service.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, router: Arc<Router>, events: EventBus) -> Self {
        Self {
            store,
            router,
            events,
        }
    }

    /// Get or create the conversation for an unordered pair.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a self-conversation.
    pub async fn get_or_create(
        &self,
        a: &str,
        b: &str,
        swap_id: Option<SwapId>,
    ) -> Result<Conversation> {
        let (conversation, _created) = self.store.get_or_create_conversation(a, b, swap_id).await?;
        Ok(conversation)
    }

    /// Send a message.
    ///
    /// The append is the durable write; the `newMessage` publish and the
    /// `new_message` notification happen strictly after it.
    ///
    /// # Errors
    ///
    /// `Forbidden` if the sender is not a participant, `Validation` for
    /// empty content without attachment.
    pub async fn send(
        &self,
        sender: &str,
        conversation_id: ConversationId,
        content: String,
        kind: MessageKind,
        attachment: Option<String>,
    ) -> Result<Message> {
        let conversation = self.store.conversation(conversation_id).await?;
        if !conversation.is_participant(sender) {
            return Err(EngineError::Forbidden(
                "sender is not a participant of this conversation".into(),
            ));
        }
        if content.trim().is_empty() && attachment.is_none() {
            return Err(EngineError::Validation(
                "message content cannot be empty".into(),
            ));
        }

        let message = self
            .store
            .append_message(NewMessage {
                conversation_id,
                sender: sender.to_string(),
                content,
                kind,
                attachment,
            })
            .await?;

        self.router.publish_to(
            &conversation_channel(conversation_id),
            names::NEW_MESSAGE,
            serde_json::json!({ "message": message }),
        );

        self.events.emit(DomainEvent::MessageSent {
            conversation_id,
            message: message.clone(),
            recipients: conversation.counterparts(sender),
        });

        Ok(message)
    }

    /// Edit a message within the 15-minute window.
    ///
    /// # Errors
    ///
    /// `Forbidden` unless the actor authored the message; `State` if the
    /// message is deleted or the edit window has expired.
    pub async fn edit(
        &self,
        actor: &str,
        message_id: MessageId,
        new_content: String,
    ) -> Result<Message> {
        self.edit_at(actor, message_id, new_content, now_millis())
            .await
    }

    /// Edit with an explicit clock reading; `edit` passes the current time.
    pub async fn edit_at(
        &self,
        actor: &str,
        message_id: MessageId,
        new_content: String,
        now: u64,
    ) -> Result<Message> {
        let message = self.store.message(message_id).await?;
        if message.sender != actor {
            return Err(EngineError::Forbidden(
                "only the sender can edit a message".into(),
            ));
        }
        if message.is_deleted {
            return Err(EngineError::State("cannot edit a deleted message".into()));
        }
        if now.saturating_sub(message.created_at) > EDIT_WINDOW_MS {
            return Err(EngineError::State(
                "edit window has expired (15 minutes)".into(),
            ));
        }
        if new_content.trim().is_empty() {
            return Err(EngineError::Validation(
                "message content cannot be empty".into(),
            ));
        }

        let updated = self.store.apply_edit(message_id, new_content, now).await?;

        self.router.publish_to(
            &conversation_channel(updated.conversation_id),
            names::MESSAGE_EDITED,
            serde_json::json!({ "message": updated }),
        );

        Ok(updated)
    }

    /// Soft-delete a message. Repeating a delete is a no-op.
    ///
    /// # Errors
    ///
    /// `Forbidden` unless the actor authored the message.
    pub async fn delete(&self, actor: &str, message_id: MessageId) -> Result<Message> {
        let message = self.store.message(message_id).await?;
        if message.sender != actor {
            return Err(EngineError::Forbidden(
                "only the sender can delete a message".into(),
            ));
        }
        if message.is_deleted {
            return Ok(message);
        }

        let deleted = self.store.apply_delete(message_id).await?;

        self.router.publish_to(
            &conversation_channel(deleted.conversation_id),
            names::MESSAGE_DELETED,
            serde_json::json!({
                "messageId": deleted.id,
                "conversationId": deleted.conversation_id,
            }),
        );

        Ok(deleted)
    }

    /// Mark every other participant's messages as read and reset the
    /// reader's unread counter to 0.
    ///
    /// # Errors
    ///
    /// `Forbidden` if the reader is not a participant.
    pub async fn mark_read(&self, reader: &str, conversation_id: ConversationId) -> Result<usize> {
        let conversation = self.store.conversation(conversation_id).await?;
        if !conversation.is_participant(reader) {
            return Err(EngineError::Forbidden(
                "reader is not a participant of this conversation".into(),
            ));
        }

        let newly_read = self
            .store
            .mark_read(conversation_id, reader, now_millis())
            .await?;

        self.router.publish_to(
            &conversation_channel(conversation_id),
            names::MESSAGES_READ,
            serde_json::json!({
                "conversationId": conversation_id,
                "reader": reader,
            }),
        );

        Ok(newly_read)
    }

    /// Page of chronological history before the cursor.
    ///
    /// # Errors
    ///
    /// `Forbidden` if the actor is not a participant.
    pub async fn history(
        &self,
        actor: &str,
        conversation_id: ConversationId,
        before: Option<HistoryCursor>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let conversation = self.store.conversation(conversation_id).await?;
        if !conversation.is_participant(actor) {
            return Err(EngineError::Forbidden(
                "actor is not a participant of this conversation".into(),
            ));
        }
        self.store.history(conversation_id, before, limit).await
    }

    /// Conversations the actor participates in.
    pub async fn conversations(&self, actor: &str) -> Result<Vec<Conversation>> {
        self.store.conversations_for(actor).await
    }

    /// Fetch a single conversation, enforcing participation.
    ///
    /// # Errors
    ///
    /// `Forbidden` if the actor is not a participant.
    pub async fn conversation(
        &self,
        actor: &str,
        conversation_id: ConversationId,
    ) -> Result<Conversation> {
        let conversation = self.store.conversation(conversation_id).await?;
        if !conversation.is_participant(actor) {
            return Err(EngineError::Forbidden(
                "actor is not a participant of this conversation".into(),
            ));
        }
        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (ChatService, Arc<InMemoryChatStore>) {
        let store = Arc::new(InMemoryChatStore::new());
        let router = Arc::new(Router::new());
        let (events, _rx) = EventBus::new();
        (
            ChatService::new(store.clone(), router, events),
            store,
        )
    }

    /// Rewind a message's creation time for edit-window tests.
    fn backdate(store: &InMemoryChatStore, message_id: MessageId, by_ms: u64) {
        let conversation_id = *store.message_index.get(&message_id).unwrap();
        let mut log = store.messages.get_mut(&conversation_id).unwrap();
        let msg = log.iter_mut().find(|m| m.id == message_id).unwrap();
        msg.created_at -= by_ms;
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (chat, _) = service();

        let first = chat.get_or_create("alice", "bob", Some(1)).await.unwrap();
        let second = chat.get_or_create("bob", "alice", None).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.swap_id, Some(1));
        assert_eq!(first.unread.get("alice"), Some(&0));
        assert_eq!(first.unread.get("bob"), Some(&0));
    }

    #[tokio::test]
    async fn test_self_conversation_rejected() {
        let (chat, _) = service();
        assert!(matches!(
            chat.get_or_create("alice", "alice", None).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_send_updates_unread_and_preview() {
        let (chat, store) = service();
        let conv = chat.get_or_create("alice", "bob", None).await.unwrap();

        for _ in 0..3 {
            chat.send("alice", conv.id, "hello".into(), MessageKind::Text, None)
                .await
                .unwrap();
        }

        let conv = store.conversation(conv.id).await.unwrap();
        assert_eq!(conv.unread.get("bob"), Some(&3));
        assert_eq!(conv.unread.get("alice"), Some(&0));
        assert_eq!(conv.last_message.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_send_requires_participant() {
        let (chat, _) = service();
        let conv = chat.get_or_create("alice", "bob", None).await.unwrap();

        assert!(matches!(
            chat.send("mallory", conv.id, "hi".into(), MessageKind::Text, None)
                .await,
            Err(EngineError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_read_resets_only_reader() {
        let (chat, store) = service();
        let conv = chat.get_or_create("alice", "bob", None).await.unwrap();

        chat.send("alice", conv.id, "one".into(), MessageKind::Text, None)
            .await
            .unwrap();
        chat.send("bob", conv.id, "two".into(), MessageKind::Text, None)
            .await
            .unwrap();

        let newly = chat.mark_read("bob", conv.id).await.unwrap();
        assert_eq!(newly, 1);

        let conv = store.conversation(conv.id).await.unwrap();
        assert_eq!(conv.unread.get("bob"), Some(&0));
        // Alice's counter untouched
        assert_eq!(conv.unread.get("alice"), Some(&1));

        // Re-reading is a no-op
        assert_eq!(chat.mark_read("bob", conv.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_edit_inside_window() {
        let (chat, store) = service();
        let conv = chat.get_or_create("alice", "bob", None).await.unwrap();
        let msg = chat
            .send("alice", conv.id, "helo".into(), MessageKind::Text, None)
            .await
            .unwrap();

        backdate(&store, msg.id, 14 * 60 * 1000);

        let edited = chat.edit("alice", msg.id, "hello".into()).await.unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content, "hello");
    }

    #[tokio::test]
    async fn test_edit_window_expired() {
        let (chat, store) = service();
        let conv = chat.get_or_create("alice", "bob", None).await.unwrap();
        let msg = chat
            .send("alice", conv.id, "helo".into(), MessageKind::Text, None)
            .await
            .unwrap();

        backdate(&store, msg.id, 16 * 60 * 1000);

        assert!(matches!(
            chat.edit("alice", msg.id, "hello".into()).await,
            Err(EngineError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_only_by_sender() {
        let (chat, _) = service();
        let conv = chat.get_or_create("alice", "bob", None).await.unwrap();
        let msg = chat
            .send("alice", conv.id, "hi".into(), MessageKind::Text, None)
            .await
            .unwrap();

        assert!(matches!(
            chat.edit("bob", msg.id, "hijacked".into()).await,
            Err(EngineError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_soft_and_idempotent() {
        let (chat, store) = service();
        let conv = chat.get_or_create("alice", "bob", None).await.unwrap();
        let msg = chat
            .send("alice", conv.id, "oops".into(), MessageKind::Text, None)
            .await
            .unwrap();

        let deleted = chat.delete("alice", msg.id).await.unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.content, DELETED_TOMBSTONE);

        // Record retained for ordering
        let history = store.history(conv.id, None, 10).await.unwrap();
        assert_eq!(history.len(), 1);

        // Second delete is a no-op
        let again = chat.delete("alice", msg.id).await.unwrap();
        assert!(again.is_deleted);

        // Deleted messages cannot be edited
        assert!(matches!(
            chat.edit("alice", msg.id, "resurrect".into()).await,
            Err(EngineError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_history_pagination_chronological() {
        let (chat, _) = service();
        let conv = chat.get_or_create("alice", "bob", None).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            let msg = chat
                .send("alice", conv.id, format!("m{i}"), MessageKind::Text, None)
                .await
                .unwrap();
            ids.push(msg.id);
        }

        // Latest page of two, chronological within the page
        let page = chat.history("bob", conv.id, None, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[3]);
        assert_eq!(page[1].id, ids[4]);

        // Next page before the oldest of the previous one
        let cursor = (page[0].created_at, page[0].id);
        let page2 = chat.history("bob", conv.id, Some(cursor), 2).await.unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].id, ids[1]);
        assert_eq!(page2[1].id, ids[2]);
    }
}
