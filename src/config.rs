//! Configuration structures and the transport factory registry.
//!
//! Each transport declares its own typed options struct;
//! [`ChildTransportConfig`] is a tagged variant over the registry, so a
//! config document selects the transport by name:
//!
//! ```json
//! {
//!     "child_transport": {"transport": "redis", "url": "redis://my_host:6379/0"},
//!     "database": {"dsn": "postgres://postgres@localhost:5432/postgres"},
//!     "publisher": {"batch_size": 100}
//! }
//! ```
//!
//! Configuration is built once during startup and threaded through
//! constructors as a value; nothing here reads the environment.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use bus_core::{DebugEventTransport, EventTransport};
use redis_transport::{RedisEventTransport, RedisTransportConfig};
use transactional_events::{
    DatabaseConfig, DatabaseConnection, OutboxMetrics, OutboxPublisher, PostgresConnection,
    PublisherSettings, TransactionalEventTransport,
};

/// Options for the in-process debug transport.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugTransportConfig {}

/// The registry of child transports the transactional layer can wrap,
/// keyed by the `transport` tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ChildTransportConfig {
    Redis(RedisTransportConfig),
    Debug(DebugTransportConfig),
}

impl ChildTransportConfig {
    /// Construct the configured transport.
    pub async fn build(&self) -> anyhow::Result<Arc<dyn EventTransport>> {
        match self {
            ChildTransportConfig::Redis(config) => {
                Ok(Arc::new(RedisEventTransport::connect(config.clone()).await?))
            }
            ChildTransportConfig::Debug(_) => Ok(Arc::new(DebugEventTransport::new())),
        }
    }
}

/// Top-level configuration for the transactional event transport.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionalEventsConfig {
    /// Which child transport to wrap, and its options
    pub child_transport: ChildTransportConfig,

    /// Database the outbox and processed-events tables live in
    pub database: DatabaseConfig,

    /// Outbox publisher tuning
    #[serde(default)]
    pub publisher: PublisherSettings,
}

/// A wired transport/publisher pair sharing one child transport. The
/// publisher holds its own database connection, distinct from the
/// transport's; spawn [`OutboxPublisher::run`] as a background task.
pub struct TransactionalEventStack {
    pub transport: TransactionalEventTransport<PostgresConnection, Arc<dyn EventTransport>>,
    pub publisher: OutboxPublisher<PostgresConnection, Arc<dyn EventTransport>>,
}

impl TransactionalEventsConfig {
    /// Connect the database (twice: application side and publisher
    /// side), run migrations when configured, build the child transport
    /// and wire the pair together.
    pub async fn connect(&self) -> anyhow::Result<TransactionalEventStack> {
        let child = self.child_transport.build().await?;

        let application_db = Arc::new(PostgresConnection::connect(&self.database.dsn).await?);
        if self.database.migrate_on_startup {
            application_db.migrate().await?;
            info!("Event tables migrated on startup");
        }
        let publisher_db = Arc::new(PostgresConnection::connect(&self.database.dsn).await?);

        let transport = TransactionalEventTransport::new(application_db, Arc::new(child.clone()));
        let publisher = OutboxPublisher::new(
            publisher_db,
            Arc::new(child),
            self.publisher.clone(),
            transport.publisher_wakeup(),
        );

        // A second stack in the same process would collide on the shared
        // registry; that publisher just runs unmetered.
        let publisher = match OutboxMetrics::register(prometheus::default_registry(), "default") {
            Ok(metrics) => publisher.with_metrics(metrics),
            Err(err) => {
                warn!(error = %err, "Outbox metrics not registered, publisher runs without them");
                publisher
            }
        };

        Ok(TransactionalEventStack {
            transport,
            publisher,
        })
    }
}
