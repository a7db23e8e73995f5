//! Core message model and transport contract for the bus.
//!
//! This crate defines what an event *is* ([`EventMessage`],
//! [`PublishOptions`]) and what a transport *does* ([`EventTransport`]),
//! without committing to a medium. Concrete transports (Redis Streams,
//! the in-process debug transport, the transactional wrapper) build on
//! these types.

mod debug;
mod error;
mod message;
mod transport;

pub use debug::DebugEventTransport;
pub use error::{TransportError, TransportResult};
pub use message::{EventMessage, PublishOptions};
pub use transport::{ContinuationToken, EventBatch, EventTransport, ReloadSignal};
