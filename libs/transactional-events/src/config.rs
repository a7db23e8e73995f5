//! Typed configuration for the transactional transport and its
//! publisher. The surrounding bus client passes these in as values; the
//! core reads no environment variables.

use serde::Deserialize;
use std::time::Duration;

/// Connection settings for the publisher's private database connection.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string, e.g. `postgres://postgres@localhost:5432/postgres`
    pub dsn: String,

    /// Run `migrate()` at startup
    #[serde(default = "default_migrate_on_startup")]
    pub migrate_on_startup: bool,
}

fn default_migrate_on_startup() -> bool {
    true
}

/// Outbox publisher tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherSettings {
    /// Maximum rows per drain cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Backoff between failed drains, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Fallback poll cadence when no notification arrives, in
    /// milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_batch_size() -> i64 {
    100
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    5000
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            retry_backoff_ms: default_retry_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PublisherSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
