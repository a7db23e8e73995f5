//! Error types for the transactional event transport.

use bus_core::TransportError;
use thiserror::Error;

/// Result type alias for transactional-event operations.
pub type EventResult<T> = Result<T, TransactionalEventError>;

/// Errors that can occur while publishing or consuming events through
/// the transactional layer.
#[derive(Error, Debug)]
pub enum TransactionalEventError {
    /// Driver-level database failure; terminates the current transaction
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A processed-event row already exists for this message
    #[error("event {message_id} already recorded as processed for {api_name}.{event_name}")]
    DuplicateEvent {
        api_name: String,
        event_name: String,
        message_id: String,
    },

    /// The deduplicator claimed a message that was already handled
    #[error("message {message_id} was already processed")]
    DuplicateMessage { message_id: String },

    /// A database write requiring transaction scope was attempted with no
    /// open transaction
    #[error("no open transaction on this connection")]
    NotInTransaction,

    /// `send_event` was called on the transport without a bound
    /// database transaction
    #[error("send_event requires a started database transaction")]
    TransactionNotStarted,

    /// Failure surfaced by the child transport
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The application handler failed; the message transaction was
    /// rolled back and the message left unacknowledged
    #[error("handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    /// Generic error with context
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransactionalEventError {
    /// True for both flavors of duplicate: the database-level integrity
    /// conflict and the deduplicator's claim rejection.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            TransactionalEventError::DuplicateEvent { .. }
                | TransactionalEventError::DuplicateMessage { .. }
        )
    }

    /// True when the child transport failed to publish; the outbox row is
    /// retained and the publisher retries after backoff.
    pub fn is_publish_failure(&self) -> bool {
        matches!(
            self,
            TransactionalEventError::Transport(TransportError::PublishFailed(_))
        )
    }

    /// True for driver-level failures, which are fatal to the connection
    /// they occurred on.
    pub fn is_database(&self) -> bool {
        matches!(self, TransactionalEventError::Database(_))
    }
}

/// PostgreSQL unique violation, SQLSTATE 23505.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .as_deref()
        == Some("23505")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_classification() {
        let db_dup = TransactionalEventError::DuplicateEvent {
            api_name: "api".into(),
            event_name: "event".into(),
            message_id: "123".into(),
        };
        let claim_dup = TransactionalEventError::DuplicateMessage {
            message_id: "123".into(),
        };
        assert!(db_dup.is_duplicate());
        assert!(claim_dup.is_duplicate());
        assert!(!TransactionalEventError::NotInTransaction.is_duplicate());
    }

    #[test]
    fn publish_failure_classification() {
        let err =
            TransactionalEventError::Transport(TransportError::PublishFailed("down".into()));
        assert!(err.is_publish_failure());
        assert!(!err.is_database());
        assert!(!TransactionalEventError::TransactionNotStarted.is_publish_failure());
    }
}
