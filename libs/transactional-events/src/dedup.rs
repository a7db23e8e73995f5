//! Inbox deduplication: the processed-events index consulted on every
//! inbound delivery.

use bus_core::EventMessage;
use std::sync::Arc;
use tracing::debug;

use crate::database::DatabaseConnection;
use crate::error::{EventResult, TransactionalEventError};

/// Claims inbound messages against the processed-events table.
///
/// `check_and_claim` must run inside the handler's open transaction: the
/// claim becomes durable only when that transaction commits, and is
/// discarded with it on rollback. A conflicting claim signals the
/// orchestrator to skip the handler and acknowledge the message without
/// invoking application logic.
pub struct EventDeduplicator<D> {
    database: Arc<D>,
}

impl<D: DatabaseConnection> EventDeduplicator<D> {
    pub fn new(database: Arc<D>) -> Self {
        Self { database }
    }

    /// Insert the processed-event row for `message`, failing with
    /// [`TransactionalEventError::DuplicateMessage`] when the message was
    /// already handled.
    pub async fn check_and_claim(&self, message: &EventMessage) -> EventResult<()> {
        match self.database.store_processed_event(message).await {
            Err(TransactionalEventError::DuplicateEvent { message_id, .. }) => {
                debug!(message_id = %message_id, "Skipping duplicate message");
                Err(TransactionalEventError::DuplicateMessage { message_id })
            }
            other => other,
        }
    }

    /// Non-claiming existence probe for the message's triple.
    pub async fn is_duplicate(&self, message: &EventMessage) -> EventResult<bool> {
        self.database.is_event_duplicate(message).await
    }
}
