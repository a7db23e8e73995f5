//! Error types shared by event transports.

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur on the event-transport seam.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport could not durably publish a message
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// The transport could not produce the next batch of messages
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// A publish option value cannot be represented as JSON
    #[error("option {key:?} is not JSON-representable: {source}")]
    UnsupportedOptionValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Message serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
