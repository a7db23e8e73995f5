//! Background publisher draining the outbox through the child transport.

use bus_core::EventTransport;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::PublisherSettings;
use crate::database::DatabaseConnection;
use crate::error::{EventResult, TransactionalEventError};
use crate::metrics::OutboxMetrics;

/// Long-lived activity publishing committed-but-unpublished outbox rows.
///
/// The publisher owns a database connection distinct from any
/// application connection. Each drain cycle runs inside one transaction:
/// the batch is fetched with row locks where the backend supports them
/// (so concurrent publishers own disjoint slices), each row is published
/// strictly in insertion order and removed after the child transport
/// acknowledges it. A publish failure halts the cycle without skipping
/// the row; the cycle's earlier removals are committed so acknowledged
/// publishes are not re-sent, and the remaining rows are retried after
/// backoff. When the outbox is empty the publisher blocks on the
/// in-process wakeup fired by `send_event`, with the poll interval as
/// fallback.
pub struct OutboxPublisher<D, C> {
    database: Arc<D>,
    child: Arc<C>,
    settings: PublisherSettings,
    wakeup: Arc<Notify>,
    metrics: Option<OutboxMetrics>,
}

impl<D: DatabaseConnection, C: EventTransport> OutboxPublisher<D, C> {
    pub fn new(
        database: Arc<D>,
        child: Arc<C>,
        settings: PublisherSettings,
        wakeup: Arc<Notify>,
    ) -> Self {
        Self {
            database,
            child,
            settings,
            wakeup,
            metrics: None,
        }
    }

    /// Also update Prometheus gauges once per cycle.
    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until a database error on the dedicated connection.
    ///
    /// Publish failures are retried here after backoff and never
    /// propagate; database errors are fatal to this publisher instance
    /// and left to the surrounding bus client's supervision. The first
    /// cycle drains whatever a previous process left behind.
    pub async fn run(&self) -> EventResult<()> {
        info!(
            batch_size = self.settings.batch_size,
            retry_backoff_ms = self.settings.retry_backoff_ms,
            poll_interval_ms = self.settings.poll_interval_ms,
            "Outbox publisher starting"
        );

        loop {
            let drained = match self.drain_once().await {
                Ok(count) => {
                    if count > 0 {
                        info!(published_count = count, "Published events from outbox");
                    }
                    count
                }
                Err(err) if err.is_publish_failure() => {
                    error!(error = %err, "Publish failed, outbox row retained");
                    tokio::time::sleep(self.settings.retry_backoff()).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.update_metrics().await;

            if drained == 0 {
                tokio::select! {
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                }
            }
        }
    }

    /// Publish one batch of pending rows, in insertion order. Returns
    /// the number of rows published and removed.
    pub async fn drain_once(&self) -> EventResult<usize> {
        self.database.start_transaction().await?;

        let pending = match self
            .database
            .consume_pending_events(None, self.settings.batch_size)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                self.database.rollback_transaction().await.ok();
                return Err(err);
            }
        };

        let mut published = 0;
        for row in pending {
            match self.child.send_event(&row.message, &row.options).await {
                Ok(()) => {
                    if let Err(err) = self.database.remove_pending_event(&row.message.id).await {
                        self.database.rollback_transaction().await.ok();
                        return Err(err);
                    }
                    published += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_published();
                    }
                    debug!(message_id = %row.message.id, "Outbox row published and removed");
                }
                Err(err) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_publish_failure();
                    }
                    // Keep the removals already earned; the failed row and
                    // everything after it stay in the outbox for the retry.
                    self.database.commit_transaction().await?;
                    return Err(TransactionalEventError::Transport(err));
                }
            }
        }

        self.database.commit_transaction().await?;
        Ok(published)
    }

    async fn update_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            match self.database.outbox_stats().await {
                Ok(stats) => metrics.observe_backlog(stats),
                Err(err) => debug!(error = %err, "Failed to read outbox stats"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;
    use async_trait::async_trait;
    use bus_core::{
        EventBatch, EventMessage, PublishOptions, TransportError, TransportResult,
    };
    use serde_json::Map;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChild {
        sent: Mutex<Vec<String>>,
        failing: Mutex<HashSet<String>>,
    }

    impl RecordingChild {
        fn fail_for(&self, id: &str) {
            self.failing.lock().unwrap().insert(id.to_string());
        }

        fn recover(&self, id: &str) {
            self.failing.lock().unwrap().remove(id);
        }

        fn sent_ids(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventTransport for RecordingChild {
        async fn send_event(
            &self,
            message: &EventMessage,
            _options: &PublishOptions,
        ) -> TransportResult<()> {
            if self.failing.lock().unwrap().contains(&message.id) {
                return Err(TransportError::PublishFailed(format!(
                    "refusing to publish {}",
                    message.id
                )));
            }
            self.sent.lock().unwrap().push(message.id.clone());
            Ok(())
        }

        async fn fetch_events(&self) -> TransportResult<EventBatch> {
            Ok(EventBatch::empty())
        }

        async fn start_listening_for(&self, _: &str, _: &str) -> TransportResult<()> {
            Ok(())
        }

        async fn stop_listening_for(&self, _: &str, _: &str) -> TransportResult<()> {
            Ok(())
        }
    }

    fn message(id: &str) -> EventMessage {
        EventMessage::new("api", "event", Map::new()).with_id(id)
    }

    async fn seed_outbox(database: &MemoryDatabase, ids: &[&str]) {
        database.start_transaction().await.unwrap();
        for id in ids {
            database
                .send_event(&message(id), &PublishOptions::new())
                .await
                .unwrap();
        }
        database.commit_transaction().await.unwrap();
    }

    fn publisher(
        database: &MemoryDatabase,
        child: Arc<RecordingChild>,
    ) -> OutboxPublisher<MemoryDatabase, RecordingChild> {
        OutboxPublisher::new(
            Arc::new(database.connect()),
            child,
            PublisherSettings::default(),
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test]
    async fn drains_committed_rows_in_order() {
        let database = MemoryDatabase::new();
        seed_outbox(&database, &["1", "2", "3"]).await;

        let child = Arc::new(RecordingChild::default());
        let publisher = publisher(&database, child.clone());

        let published = publisher.drain_once().await.unwrap();
        assert_eq!(published, 3);
        assert_eq!(child.sent_ids(), ["1", "2", "3"]);
        assert!(database
            .consume_pending_events(None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn publish_failure_halts_without_skipping() {
        let database = MemoryDatabase::new();
        seed_outbox(&database, &["1", "2", "3"]).await;

        let child = Arc::new(RecordingChild::default());
        child.fail_for("2");
        let publisher = publisher(&database, child.clone());

        let err = publisher.drain_once().await.unwrap_err();
        assert!(err.is_publish_failure());

        // Row 1 was published and removed, rows 2 and 3 remain in order.
        assert_eq!(child.sent_ids(), ["1"]);
        let remaining: Vec<_> = database
            .consume_pending_events(None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.message.id)
            .collect();
        assert_eq!(remaining, ["2", "3"]);

        // Once the child recovers the retry picks up exactly where the
        // failure happened.
        child.recover("2");
        let published = publisher.drain_once().await.unwrap();
        assert_eq!(published, 2);
        assert_eq!(child.sent_ids(), ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn empty_outbox_drains_nothing() {
        let database = MemoryDatabase::new();
        let child = Arc::new(RecordingChild::default());
        let publisher = publisher(&database, child.clone());

        assert_eq!(publisher.drain_once().await.unwrap(), 0);
        assert!(child.sent_ids().is_empty());
    }

    #[tokio::test]
    async fn metrics_track_published_rows_and_failures() {
        let database = MemoryDatabase::new();
        seed_outbox(&database, &["1", "2", "3"]).await;

        let child = Arc::new(RecordingChild::default());
        child.fail_for("3");
        let registry = prometheus::Registry::new();
        let metrics = OutboxMetrics::register(&registry, "test").unwrap();
        let publisher = publisher(&database, child.clone()).with_metrics(metrics.clone());

        publisher.drain_once().await.unwrap_err();
        assert_eq!(metrics.published_total(), 2);
        assert_eq!(metrics.publish_failures_total(), 1);

        child.recover("3");
        publisher.drain_once().await.unwrap();
        assert_eq!(metrics.published_total(), 3);

        metrics.observe_backlog(database.outbox_stats().await.unwrap());
        assert_eq!(metrics.pending_rows(), 0);
    }
}
