//! Lightbus: pluggable event transports with a transactional core.
//!
//! The pieces compose like this: [`bus_core`] defines the message model
//! and the abstract transport contract, [`redis_transport`] speaks Redis
//! Streams, and [`transactional_events`] wraps any child transport so
//! publication rides the application's database transaction (outbox) and
//! consumption is deduplicated (inbox). This crate re-exports the lot
//! and adds the configuration registry that wires a ready transport and
//! publisher from a plain config value.

pub mod config;
pub mod logging;

pub use bus_core::{
    ContinuationToken, DebugEventTransport, EventBatch, EventMessage, EventTransport,
    PublishOptions, ReloadSignal, TransportError, TransportResult,
};
pub use redis_transport::{RedisEventTransport, RedisTransportConfig};
pub use transactional_events::{
    DatabaseConfig, DatabaseConnection, EventDeduplicator, EventResult, MemoryDatabase,
    OutboxMetrics, OutboxPublisher, OutboxStats, PendingEvent, PostgresConnection,
    PublisherSettings, TransactionalEventError, TransactionalEventTransport,
};

pub use config::{
    ChildTransportConfig, DebugTransportConfig, TransactionalEventStack, TransactionalEventsConfig,
};
