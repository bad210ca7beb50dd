//! Domain engine for the skill-exchange coordination core.
//!
//! Three services sit on top of pluggable stores: [`SwapService`] drives the
//! swap lifecycle state machine and gates credit settlement, [`ChatService`]
//! owns conversations and the append-only message log, and the
//! [`Dispatcher`] turns domain events into persisted notifications plus
//! live pushes for online recipients. Collaborators the engine does not own
//! (credential verification, profiles, the credit ledger, the catalog) come
//! in through the traits in [`external`].

pub mod chat;
pub mod error;
pub mod events;
pub mod external;
pub mod notify;
pub mod swap;
pub mod types;

pub use chat::{
    ChatService, ChatStore, Conversation, HistoryCursor, InMemoryChatStore, Message, MessageKind,
    NewMessage, DELETED_TOMBSTONE, EDIT_WINDOW_MS,
};
pub use error::{EngineError, Result};
pub use events::{DomainEvent, EventBus};
pub use external::{
    Catalog, CredentialVerifier, CreditLedger, InMemoryCatalog, InMemoryDirectory, InMemoryLedger,
    InMemoryStats, Profile, StatCounter, StaticTokenVerifier, StatsStore, UserDirectory,
};
pub use notify::{
    Dispatcher, InMemoryNotificationStore, NewNotification, Notification, NotificationKind,
    NotificationStore, Priority,
};
pub use swap::{
    ExchangeKind, InMemorySwapStore, NewSwap, SwapRequest, SwapService, SwapStatus, SwapStore,
};
pub use types::{
    CatalogId, ConversationId, IdSequence, MessageId, NotificationId, PrincipalId, SwapId,
};
