//! # Transactional Event Transport
//!
//! Ties event publication and consumption to a local database
//! transaction, wrapping any child event transport:
//!
//! 1. `send_event` writes the message to an outbox table inside the
//!    application's own transaction, so business writes and the pending
//!    event commit or roll back together.
//! 2. A background [`OutboxPublisher`] drains committed rows through the
//!    child transport, removing each row only after its publish
//!    acknowledgement (at-least-once publication).
//! 3. On the consuming side, every delivery is claimed in a
//!    processed-events table inside the handler's transaction before the
//!    handler runs; redeliveries find the claim and are acknowledged
//!    without re-invoking the handler (exactly-once processing).
//!
//! ## Usage sketch
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use transactional_events::{
//!     DatabaseConnection, OutboxPublisher, PostgresConnection, PublisherSettings,
//!     TransactionalEventTransport,
//! };
//! use bus_core::{DebugEventTransport, EventMessage, PublishOptions};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let database = Arc::new(PostgresConnection::connect("postgres://localhost/bus").await?);
//! database.migrate().await?;
//!
//! let child = Arc::new(DebugEventTransport::new());
//! let transport = TransactionalEventTransport::new(database.clone(), child.clone());
//!
//! // The publisher gets its own connection, distinct from the
//! // application's.
//! let publisher = OutboxPublisher::new(
//!     Arc::new(PostgresConnection::connect("postgres://localhost/bus").await?),
//!     child,
//!     PublisherSettings::default(),
//!     transport.publisher_wakeup(),
//! );
//! tokio::spawn(async move { publisher.run().await });
//!
//! // Publish atomically with application state.
//! database.start_transaction().await?;
//! let message = EventMessage::new("my_company.auth", "user_registered", Default::default());
//! transport.send_event(&message, &PublishOptions::new()).await?;
//! database.commit_transaction().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod database;
mod dedup;
mod error;
mod memory;
pub mod metrics;
mod publisher;
mod transport;

pub use config::{DatabaseConfig, PublisherSettings};
pub use database::{DatabaseConnection, OutboxStats, PendingEvent, PostgresConnection};
pub use dedup::EventDeduplicator;
pub use error::{EventResult, TransactionalEventError};
pub use memory::MemoryDatabase;
pub use metrics::OutboxMetrics;
pub use publisher::OutboxPublisher;
pub use transport::TransactionalEventTransport;
