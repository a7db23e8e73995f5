//! The transactional event transport: the standard event-transport
//! contract, with sends routed through the outbox and receives through
//! the deduplication index.

use bus_core::{EventBatch, EventMessage, EventTransport, PublishOptions};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::database::DatabaseConnection;
use crate::dedup::EventDeduplicator;
use crate::error::{EventResult, TransactionalEventError};

/// Wraps a child event transport so that publication and consumption are
/// coordinated with an application-supplied database transaction.
///
/// One instance is bound to one database connection and one task; the
/// application opens and commits transactions on that connection around
/// its own writes. `send_event` inserts into the outbox inside the open
/// transaction (the background [`crate::OutboxPublisher`] performs the
/// actual publish after commit); `consume` claims each message in the
/// dedup index inside the handler's transaction and acknowledges to the
/// child only after that transaction commits.
pub struct TransactionalEventTransport<D, C> {
    database: Arc<D>,
    child: Arc<C>,
    deduplicator: EventDeduplicator<D>,
    publisher_wakeup: Arc<Notify>,
}

impl<D: DatabaseConnection, C: EventTransport> TransactionalEventTransport<D, C> {
    pub fn new(database: Arc<D>, child: Arc<C>) -> Self {
        Self {
            deduplicator: EventDeduplicator::new(database.clone()),
            database,
            child,
            publisher_wakeup: Arc::new(Notify::new()),
        }
    }

    /// The wakeup handle to hand to this transport's outbox publisher.
    pub fn publisher_wakeup(&self) -> Arc<Notify> {
        self.publisher_wakeup.clone()
    }

    /// The bound database connection.
    pub fn database(&self) -> Arc<D> {
        self.database.clone()
    }

    /// The wrapped child transport.
    pub fn child(&self) -> Arc<C> {
        self.child.clone()
    }

    /// Write the event to the outbox inside the caller's open database
    /// transaction. Fails with
    /// [`TransactionalEventError::TransactionNotStarted`] when no
    /// transaction is bound; the row becomes publishable the instant the
    /// transaction commits.
    pub async fn send_event(
        &self,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> EventResult<()> {
        match self.database.send_event(message, options).await {
            Ok(()) => {
                self.publisher_wakeup.notify_one();
                Ok(())
            }
            Err(TransactionalEventError::NotInTransaction) => {
                Err(TransactionalEventError::TransactionNotStarted)
            }
            Err(err) => Err(err),
        }
    }

    /// Next batch from the child transport, unchanged.
    pub async fn fetch_events(&self) -> EventResult<EventBatch> {
        Ok(self.child.fetch_events().await?)
    }

    /// Process a batch of inbound messages through `handler`.
    ///
    /// Per message: a fresh transaction is started, the message claimed
    /// in the dedup index, and the handler run inside that transaction.
    /// On handler success the transaction commits and only then is the
    /// message acknowledged, so the processed-event row is durable
    /// before the broker forgets the delivery. Duplicates are rolled
    /// back and acknowledged without invoking the handler. On handler
    /// failure the transaction rolls back, the message is left
    /// unacknowledged for redelivery, and the error is surfaced;
    /// messages later in the batch are also redelivered.
    ///
    /// Returns the number of messages handled (duplicates excluded).
    pub async fn consume<H, Fut>(
        &self,
        messages: Vec<EventMessage>,
        handler: H,
    ) -> EventResult<usize>
    where
        H: Fn(EventMessage) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut handled = 0;

        for message in messages {
            self.database.start_transaction().await?;

            match self.deduplicator.check_and_claim(&message).await {
                Ok(()) => {}
                Err(err) if err.is_duplicate() => {
                    self.database.rollback_transaction().await?;
                    self.child.acknowledge(&message).await?;
                    debug!(
                        message_id = %message.id,
                        "Duplicate message acknowledged without handling"
                    );
                    continue;
                }
                Err(err) => {
                    self.database.rollback_transaction().await.ok();
                    return Err(err);
                }
            }

            match handler(message.clone()).await {
                Ok(()) => {
                    self.database.commit_transaction().await?;
                    self.child.acknowledge(&message).await?;
                    handled += 1;
                }
                Err(err) => {
                    self.database.rollback_transaction().await?;
                    warn!(
                        message_id = %message.id,
                        error = %err,
                        "Handler failed, message left for redelivery"
                    );
                    return Err(TransactionalEventError::Handler(err));
                }
            }
        }

        Ok(handled)
    }

    pub async fn start_listening_for(
        &self,
        api_name: &str,
        event_name: &str,
    ) -> EventResult<()> {
        Ok(self.child.start_listening_for(api_name, event_name).await?)
    }

    pub async fn stop_listening_for(&self, api_name: &str, event_name: &str) -> EventResult<()> {
        Ok(self.child.stop_listening_for(api_name, event_name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;
    use bus_core::DebugEventTransport;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn message(id: &str) -> EventMessage {
        EventMessage::new("api", "event", kwargs(json!({"field": "abc"}))).with_id(id)
    }

    fn transport() -> TransactionalEventTransport<MemoryDatabase, DebugEventTransport> {
        TransactionalEventTransport::new(
            Arc::new(MemoryDatabase::new()),
            Arc::new(DebugEventTransport::new()),
        )
    }

    #[tokio::test]
    async fn send_event_requires_a_transaction() {
        let transport = transport();
        let err = transport
            .send_event(&message("123"), &PublishOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransactionalEventError::TransactionNotStarted
        ));
    }

    #[tokio::test]
    async fn committed_send_is_visible_to_the_outbox() {
        let transport = transport();
        let database = transport.database();

        database.start_transaction().await.unwrap();
        transport
            .send_event(&message("123"), &PublishOptions::new())
            .await
            .unwrap();
        database.commit_transaction().await.unwrap();

        let pending = database.consume_pending_events(None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.id, "123");
    }

    #[tokio::test]
    async fn handler_runs_once_across_duplicate_deliveries() {
        let transport = transport();
        let child = transport.child();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            transport
                .consume(vec![message("123")], move |_message| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Both deliveries were acknowledged: once after commit, once as a
        // recognized duplicate.
        assert_eq!(child.acknowledged_ids(), ["123", "123"]);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_and_withholds_ack() {
        let transport = transport();
        let child = transport.child();
        let database = transport.database();

        let err = transport
            .consume(vec![message("123")], |_message| async {
                anyhow::bail!("boom")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionalEventError::Handler(_)));
        assert!(child.acknowledged_ids().is_empty());

        // The claim was rolled back, so the redelivery is handled.
        assert!(!database.is_event_duplicate(&message("123")).await.unwrap());
        let handled = transport
            .consume(vec![message("123")], |_message| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(handled, 1);
        assert_eq!(child.acknowledged_ids(), ["123"]);
    }

    #[tokio::test]
    async fn listening_delegates_to_child() {
        let transport = transport();
        transport
            .start_listening_for("api", "event")
            .await
            .unwrap();
        assert!(transport.child().subscriptions().contains("api.event"));
        transport.stop_listening_for("api", "event").await.unwrap();
        assert!(transport.child().subscriptions().is_empty());
    }
}
