//! Error taxonomy for the coordination core.
//!
//! Every handler-level failure maps to one of these variants; the server
//! converts them to typed responses (status code + stable message) and a
//! failed operation never tears down a connection or the process.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad or expired credential.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Missing swap/conversation/message/notification.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Duplicate active swap, duplicate review, repeated terminal transition.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Actor is not a participant/owner of the entity.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Malformed payload.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Operation invalid for the current lifecycle state.
    #[error("Invalid state: {0}")]
    State(String),

    /// Insufficient credits at the ledger.
    #[error("Insufficient funds: balance {balance} is below {required}")]
    InsufficientFunds {
        /// Current payer balance.
        balance: i64,
        /// Amount required.
        required: i64,
    },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// HTTP status code for request/response surfaces.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Auth(_) => 401,
            EngineError::Forbidden(_) => 403,
            EngineError::NotFound(_) => 404,
            EngineError::Conflict(_) => 409,
            EngineError::Validation(_) | EngineError::State(_) => 422,
            EngineError::InsufficientFunds { .. } => 402,
            EngineError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Auth(_) => "auth_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Validation(_) => "validation_error",
            EngineError::State(_) => "state_error",
            EngineError::InsufficientFunds { .. } => "insufficient_funds",
            EngineError::Internal(_) => "internal_error",
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(EngineError::Auth("bad token".into()).status_code(), 401);
        assert_eq!(EngineError::NotFound("swap").status_code(), 404);
        assert_eq!(EngineError::Conflict("duplicate".into()).status_code(), 409);
        assert_eq!(EngineError::Forbidden("not yours".into()).status_code(), 403);
        assert_eq!(EngineError::State("too late".into()).status_code(), 422);
    }

    #[test]
    fn test_messages_are_stable() {
        let err = EngineError::NotFound("conversation");
        assert_eq!(err.to_string(), "conversation not found");

        let err = EngineError::InsufficientFunds {
            balance: 10,
            required: 50,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient funds: balance 10 is below 50"
        );
    }
}
