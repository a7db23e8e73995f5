//! In-process database adapter for development and tests.

use async_trait::async_trait;
use bus_core::{EventMessage, PublishOptions};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::database::{DatabaseConnection, OutboxStats, PendingEvent};
use crate::error::{EventResult, TransactionalEventError};

type ProcessedKey = (String, String, String);

#[derive(Default)]
struct Store {
    processed: BTreeSet<ProcessedKey>,
    // Vec order is insertion order, the same contract the real outbox
    // gets from created_at plus the primary-key tie-break.
    outbox: Vec<StoredRow>,
}

struct StoredRow {
    created_at: DateTime<Utc>,
    event: PendingEvent,
}

#[derive(Default)]
struct TxnBuffer {
    processed: Vec<ProcessedKey>,
    outbox: Vec<PendingEvent>,
    removals: Vec<String>,
}

/// Database adapter backed by process memory, with the same transaction
/// and duplicate-detection semantics as the PostgreSQL implementation.
///
/// All connections created through [`MemoryDatabase::connect`] share one
/// store; each connection keeps its own staged transaction, applied on
/// commit and discarded on rollback. Useful wherever the orchestrator or
/// publisher needs exercising without a real database.
pub struct MemoryDatabase {
    store: Arc<Mutex<Store>>,
    txn: Mutex<Option<TxnBuffer>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            txn: Mutex::new(None),
        }
    }

    /// A further connection onto the same store, with independent
    /// transaction state. This is how the publisher gets its dedicated
    /// connection in tests.
    pub fn connect(&self) -> Self {
        Self {
            store: self.store.clone(),
            txn: Mutex::new(None),
        }
    }

    fn key(message: &EventMessage) -> ProcessedKey {
        (
            message.api_name.clone(),
            message.event_name.clone(),
            message.id.clone(),
        )
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseConnection for MemoryDatabase {
    async fn migrate(&self) -> EventResult<()> {
        Ok(())
    }

    async fn start_transaction(&self) -> EventResult<()> {
        let mut txn = self.txn.lock().unwrap();
        if txn.is_some() {
            return Err(TransactionalEventError::Other(anyhow::anyhow!(
                "a transaction is already open on this connection"
            )));
        }
        *txn = Some(TxnBuffer::default());
        Ok(())
    }

    async fn commit_transaction(&self) -> EventResult<()> {
        let buffer = self
            .txn
            .lock()
            .unwrap()
            .take()
            .ok_or(TransactionalEventError::NotInTransaction)?;

        let mut store = self.store.lock().unwrap();
        store.processed.extend(buffer.processed);
        for event in buffer.outbox {
            store.outbox.push(StoredRow {
                created_at: Utc::now(),
                event,
            });
        }
        for message_id in buffer.removals {
            store.outbox.retain(|row| row.event.message.id != message_id);
        }
        Ok(())
    }

    async fn rollback_transaction(&self) -> EventResult<()> {
        self.txn
            .lock()
            .unwrap()
            .take()
            .ok_or(TransactionalEventError::NotInTransaction)?;
        Ok(())
    }

    async fn store_processed_event(&self, message: &EventMessage) -> EventResult<()> {
        let mut txn = self.txn.lock().unwrap();
        let buffer = txn
            .as_mut()
            .ok_or(TransactionalEventError::NotInTransaction)?;

        let key = Self::key(message);
        let committed = self.store.lock().unwrap().processed.contains(&key);
        if committed || buffer.processed.contains(&key) {
            return Err(TransactionalEventError::DuplicateEvent {
                api_name: message.api_name.clone(),
                event_name: message.event_name.clone(),
                message_id: message.id.clone(),
            });
        }
        buffer.processed.push(key);
        Ok(())
    }

    async fn is_event_duplicate(&self, message: &EventMessage) -> EventResult<bool> {
        let key = Self::key(message);
        if self.store.lock().unwrap().processed.contains(&key) {
            return Ok(true);
        }
        let txn = self.txn.lock().unwrap();
        Ok(txn
            .as_ref()
            .map(|buffer| buffer.processed.contains(&key))
            .unwrap_or(false))
    }

    async fn send_event(
        &self,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> EventResult<()> {
        let mut txn = self.txn.lock().unwrap();
        let buffer = txn
            .as_mut()
            .ok_or(TransactionalEventError::NotInTransaction)?;
        buffer.outbox.push(PendingEvent {
            message: message.clone(),
            options: options.clone(),
        });
        Ok(())
    }

    async fn consume_pending_events(
        &self,
        message_id: Option<&str>,
        limit: i64,
    ) -> EventResult<Vec<PendingEvent>> {
        let txn = self.txn.lock().unwrap();
        let store = self.store.lock().unwrap();

        // Committed rows first, then rows staged by this connection's own
        // transaction, matching what a SELECT on the same connection
        // would observe.
        let staged_removals: &[String] = txn
            .as_ref()
            .map(|buffer| buffer.removals.as_slice())
            .unwrap_or(&[]);
        let mut events: Vec<PendingEvent> = store
            .outbox
            .iter()
            .filter(|row| !staged_removals.contains(&row.event.message.id))
            .map(|row| row.event.clone())
            .collect();
        if let Some(buffer) = txn.as_ref() {
            events.extend(buffer.outbox.iter().cloned());
        }

        if let Some(id) = message_id {
            events.retain(|event| event.message.id == id);
        }
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn remove_pending_event(&self, message_id: &str) -> EventResult<()> {
        let mut txn = self.txn.lock().unwrap();
        if let Some(buffer) = txn.as_mut() {
            buffer.removals.push(message_id.to_string());
            buffer
                .outbox
                .retain(|event| event.message.id != message_id);
            return Ok(());
        }
        drop(txn);

        self.store
            .lock()
            .unwrap()
            .outbox
            .retain(|row| row.event.message.id != message_id);
        Ok(())
    }

    async fn outbox_stats(&self) -> EventResult<OutboxStats> {
        let store = self.store.lock().unwrap();
        let oldest_age_seconds = store
            .outbox
            .iter()
            .map(|row| (Utc::now() - row.created_at).num_seconds())
            .max()
            .unwrap_or(0);
        Ok(OutboxStats {
            pending: store.outbox.len() as i64,
            oldest_age_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn message(id: &str) -> EventMessage {
        EventMessage::new("api", "event", Map::new()).with_id(id)
    }

    #[tokio::test]
    async fn commit_makes_processed_events_durable() {
        let db = MemoryDatabase::new();
        db.start_transaction().await.unwrap();
        db.store_processed_event(&message("123")).await.unwrap();
        db.commit_transaction().await.unwrap();

        assert!(db.is_event_duplicate(&message("123")).await.unwrap());
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let db = MemoryDatabase::new();
        db.start_transaction().await.unwrap();
        db.store_processed_event(&message("123")).await.unwrap();
        db.send_event(&message("123"), &PublishOptions::new())
            .await
            .unwrap();
        db.rollback_transaction().await.unwrap();

        assert!(!db.is_event_duplicate(&message("123")).await.unwrap());
        assert!(db
            .consume_pending_events(None, 10)
            .await
            .unwrap()
            .is_empty());

        // The connection stays usable after a rollback.
        db.start_transaction().await.unwrap();
        db.store_processed_event(&message("123")).await.unwrap();
        db.commit_transaction().await.unwrap();
        assert!(db.is_event_duplicate(&message("123")).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_store_is_rejected() {
        let db = MemoryDatabase::new();
        db.start_transaction().await.unwrap();
        db.store_processed_event(&message("123")).await.unwrap();
        db.commit_transaction().await.unwrap();

        db.start_transaction().await.unwrap();
        let err = db.store_processed_event(&message("123")).await.unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn writes_outside_a_transaction_are_rejected() {
        let db = MemoryDatabase::new();
        assert!(matches!(
            db.store_processed_event(&message("123")).await,
            Err(TransactionalEventError::NotInTransaction)
        ));
        assert!(matches!(
            db.send_event(&message("123"), &PublishOptions::new()).await,
            Err(TransactionalEventError::NotInTransaction)
        ));
    }

    #[tokio::test]
    async fn connections_share_committed_state() {
        let app = MemoryDatabase::new();
        let publisher = app.connect();

        app.start_transaction().await.unwrap();
        app.send_event(&message("123"), &PublishOptions::new())
            .await
            .unwrap();

        // Not yet visible to the other connection.
        assert!(publisher
            .consume_pending_events(None, 10)
            .await
            .unwrap()
            .is_empty());

        app.commit_transaction().await.unwrap();
        let pending = publisher.consume_pending_events(None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.id, "123");
    }

    #[tokio::test]
    async fn remove_pending_event_is_idempotent() {
        let db = MemoryDatabase::new();
        db.start_transaction().await.unwrap();
        db.send_event(&message("123"), &PublishOptions::new())
            .await
            .unwrap();
        db.commit_transaction().await.unwrap();

        db.remove_pending_event("123").await.unwrap();
        db.remove_pending_event("123").await.unwrap();
        assert!(db
            .consume_pending_events(None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn own_staged_rows_are_visible_before_commit() {
        let db = MemoryDatabase::new();
        db.start_transaction().await.unwrap();
        db.send_event(&message("123"), &PublishOptions::new())
            .await
            .unwrap();

        let pending = db
            .consume_pending_events(Some("123"), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }
}
