//! Domain events and the event bus.
//!
//! Lifecycle handlers never build notifications themselves: they emit a
//! [`DomainEvent`] and the dispatcher decides what to persist and push.
//! The bus is a plain unbounded mpsc channel; emitting never blocks a
//! mutation path, and a closed bus is logged rather than treated as fatal.

use crate::chat::Message;
use crate::swap::SwapRequest;
use crate::types::{CatalogId, ConversationId, PrincipalId};
use tokio::sync::mpsc;
use tracing::warn;

/// A domain event produced by a successful state mutation.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// A swap request was created; the provider should be notified.
    SwapCreated { swap: SwapRequest },

    /// A swap was accepted by its provider.
    SwapAccepted { swap: SwapRequest },

    /// A swap was rejected by its provider.
    SwapRejected {
        swap: SwapRequest,
        reason: Option<String>,
    },

    /// A swap was cancelled by a participant.
    SwapCancelled {
        swap: SwapRequest,
        cancelled_by: PrincipalId,
        reason: Option<String>,
    },

    /// A swap completed; the counterpart of the completer gets a
    /// review prompt.
    SwapCompleted {
        swap: SwapRequest,
        completed_by: PrincipalId,
    },

    /// A review was attached to a completed swap.
    ReviewSubmitted {
        swap: SwapRequest,
        reviewer: PrincipalId,
    },

    /// A message was appended to a conversation.
    MessageSent {
        conversation_id: ConversationId,
        message: Message,
        /// Participants other than the sender.
        recipients: Vec<PrincipalId>,
    },

    /// A principal enrolled in a workshop; the host should be notified.
    WorkshopEnrollment {
        workshop_id: CatalogId,
        host: PrincipalId,
        attendee: PrincipalId,
    },
}

/// Sender half of the domain-event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl EventBus {
    /// Create a bus, returning the sender and the receiver the dispatcher
    /// consumes.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit a domain event.
    ///
    /// Emission is fire-and-forget: if the dispatcher is gone the event is
    /// dropped with a warning, and the originating mutation stands.
    pub fn emit(&self, event: DomainEvent) {
        if self.tx.send(event).is_err() {
            warn!("Domain event dropped: dispatcher receiver closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{ExchangeKind, SwapRequest, SwapStatus};

    fn sample_swap() -> SwapRequest {
        SwapRequest::sample("alice", "bob", ExchangeKind::Exchange, 0, SwapStatus::Pending)
    }

    #[test]
    fn test_emit_and_receive() {
        let (bus, mut rx) = EventBus::new();
        bus.emit(DomainEvent::SwapCreated {
            swap: sample_swap(),
        });

        match rx.try_recv() {
            Ok(DomainEvent::SwapCreated { swap }) => assert_eq!(swap.requester, "alice"),
            other => panic!("Expected SwapCreated, got {other:?}"),
        }
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        // Must not panic
        bus.emit(DomainEvent::SwapCreated {
            swap: sample_swap(),
        });
    }
}
