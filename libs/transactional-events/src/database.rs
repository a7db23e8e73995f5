//! Database adapter: transaction control, the event outbox and the
//! processed-events table.

use async_trait::async_trait;
use bus_core::{EventMessage, PublishOptions, TransportError};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Connection, Executor, PgConnection, Row};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{is_unique_violation, EventResult, TransactionalEventError};

/// One outbox row awaiting publication.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub message: EventMessage,
    pub options: PublishOptions,
}

/// Outbox backlog summary used by the publisher metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxStats {
    /// Rows currently awaiting publication
    pub pending: i64,
    /// Age in seconds of the oldest pending row, 0 when none are pending
    pub oldest_age_seconds: i64,
}

/// Thin adapter over a relational backend exposing transaction control,
/// the outbox table and the processed-events table.
///
/// A connection is single-threaded: at most one transaction is open at a
/// time, and a connection is never shared between tasks.
/// `store_processed_event` and `send_event` require an open transaction
/// and fail with [`TransactionalEventError::NotInTransaction`] otherwise.
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    /// Idempotently create the outbox and processed-events tables. Safe
    /// to call on every startup.
    async fn migrate(&self) -> EventResult<()>;

    /// Begin a transaction on the underlying connection.
    async fn start_transaction(&self) -> EventResult<()>;

    /// Commit the current transaction.
    async fn commit_transaction(&self) -> EventResult<()>;

    /// Roll back the current transaction. The connection remains usable
    /// and a fresh transaction may be started.
    async fn rollback_transaction(&self) -> EventResult<()>;

    /// Record a message as processed. Fails with
    /// [`TransactionalEventError::DuplicateEvent`] when the
    /// `(api_name, event_name, message_id)` triple already exists.
    async fn store_processed_event(&self, message: &EventMessage) -> EventResult<()>;

    /// Whether a processed-event row exists for the message's triple.
    async fn is_event_duplicate(&self, message: &EventMessage) -> EventResult<bool>;

    /// Insert an outbox row for the message inside the open transaction.
    async fn send_event(
        &self,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> EventResult<()>;

    /// Outbox rows in insertion order (`created_at`, then primary key),
    /// at most `limit`; when `message_id` is given, that row only. The
    /// ordering guarantee is per publisher instance.
    async fn consume_pending_events(
        &self,
        message_id: Option<&str>,
        limit: i64,
    ) -> EventResult<Vec<PendingEvent>>;

    /// Delete one outbox row by id. A no-op when the row is already
    /// absent.
    async fn remove_pending_event(&self, message_id: &str) -> EventResult<()>;

    /// Pending count and oldest pending age for the outbox.
    async fn outbox_stats(&self) -> EventResult<OutboxStats>;
}

/// PostgreSQL implementation over a single dedicated connection.
///
/// Transaction scope is explicit `BEGIN`/`COMMIT`/`ROLLBACK`; the
/// connection lives behind a tokio mutex so the orchestrator and its
/// caller can share it within one task. When a transaction is open,
/// `consume_pending_events` takes row locks with `SKIP LOCKED` so
/// concurrent publishers own disjoint slices of the outbox.
pub struct PostgresConnection {
    inner: Mutex<Inner>,
}

struct Inner {
    conn: PgConnection,
    in_transaction: bool,
}

impl PostgresConnection {
    pub fn new(conn: PgConnection) -> Self {
        Self {
            inner: Mutex::new(Inner {
                conn,
                in_transaction: false,
            }),
        }
    }

    pub async fn connect(dsn: &str) -> EventResult<Self> {
        let conn = PgConnection::connect(dsn).await?;
        Ok(Self::new(conn))
    }
}

fn object(value: Value, column: &str) -> EventResult<serde_json::Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(TransactionalEventError::Other(anyhow::anyhow!(
            "outbox column {column} does not hold a JSON object"
        ))),
    }
}

fn pending_event_from_row(row: &PgRow) -> EventResult<PendingEvent> {
    let payload: Value = row.try_get("payload")?;
    let metadata: Value = row.try_get("metadata")?;
    let options: Value = row.try_get("options")?;

    let kwargs = object(payload, "payload")?;
    let metadata = object(metadata, "metadata")?;
    let options = PublishOptions(object(options, "options")?.into_iter().collect());

    let message = EventMessage::from_stored(&metadata, kwargs)
        .map_err(TransactionalEventError::Transport)?;
    Ok(PendingEvent { message, options })
}

/// Serialize the options map, naming the offending key when a value has
/// no JSON representation.
fn encode_options(options: &PublishOptions) -> EventResult<String> {
    for (key, value) in options.iter() {
        serde_json::to_string(value).map_err(|source| {
            TransactionalEventError::Transport(TransportError::UnsupportedOptionValue {
                key: key.clone(),
                source,
            })
        })?;
    }
    serde_json::to_string(options)
        .map_err(TransportError::Serialization)
        .map_err(TransactionalEventError::Transport)
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    async fn migrate(&self) -> EventResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .conn
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS lightbus_event_outbox (
                    message_id TEXT PRIMARY KEY,
                    api_name TEXT NOT NULL,
                    event_name TEXT NOT NULL,
                    payload JSON NOT NULL,
                    metadata JSON NOT NULL,
                    options JSON NOT NULL,
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
                );
                CREATE TABLE IF NOT EXISTS lightbus_processed_events (
                    api_name TEXT NOT NULL,
                    event_name TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    PRIMARY KEY (api_name, event_name, message_id)
                );
                CREATE INDEX IF NOT EXISTS lightbus_event_outbox_created_at_idx
                    ON lightbus_event_outbox (created_at);
                "#,
            )
            .await?;

        debug!("Event tables migrated");
        Ok(())
    }

    async fn start_transaction(&self) -> EventResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.in_transaction {
            return Err(TransactionalEventError::Other(anyhow::anyhow!(
                "a transaction is already open on this connection"
            )));
        }
        inner.conn.execute("BEGIN").await?;
        inner.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&self) -> EventResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.in_transaction {
            return Err(TransactionalEventError::NotInTransaction);
        }
        inner.conn.execute("COMMIT").await?;
        inner.in_transaction = false;
        Ok(())
    }

    async fn rollback_transaction(&self) -> EventResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.in_transaction {
            return Err(TransactionalEventError::NotInTransaction);
        }
        inner.conn.execute("ROLLBACK").await?;
        inner.in_transaction = false;
        Ok(())
    }

    async fn store_processed_event(&self, message: &EventMessage) -> EventResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.in_transaction {
            return Err(TransactionalEventError::NotInTransaction);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO lightbus_processed_events (api_name, event_name, message_id)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&message.api_name)
        .bind(&message.event_name)
        .bind(&message.id)
        .execute(&mut inner.conn)
        .await;

        match result {
            Ok(_) => {
                debug!(
                    api_name = %message.api_name,
                    event_name = %message.event_name,
                    message_id = %message.id,
                    "Event recorded as processed"
                );
                Ok(())
            }
            Err(err) if is_unique_violation(&err) => {
                Err(TransactionalEventError::DuplicateEvent {
                    api_name: message.api_name.clone(),
                    event_name: message.event_name.clone(),
                    message_id: message.id.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn is_event_duplicate(&self, message: &EventMessage) -> EventResult<bool> {
        let mut inner = self.inner.lock().await;
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM lightbus_processed_events
                WHERE api_name = $1 AND event_name = $2 AND message_id = $3
            )
            "#,
        )
        .bind(&message.api_name)
        .bind(&message.event_name)
        .bind(&message.id)
        .fetch_one(&mut inner.conn)
        .await?;
        Ok(exists)
    }

    async fn send_event(
        &self,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> EventResult<()> {
        let options_json = encode_options(options)?;
        let payload_json = serde_json::to_string(&message.kwargs)
            .map_err(TransportError::Serialization)
            .map_err(TransactionalEventError::Transport)?;
        let metadata_json = serde_json::to_string(&message.metadata())
            .map_err(TransportError::Serialization)
            .map_err(TransactionalEventError::Transport)?;

        let mut inner = self.inner.lock().await;
        if !inner.in_transaction {
            return Err(TransactionalEventError::NotInTransaction);
        }
        sqlx::query(
            r#"
            INSERT INTO lightbus_event_outbox
                (message_id, api_name, event_name, payload, metadata, options)
            VALUES ($1, $2, $3, $4::json, $5::json, $6::json)
            "#,
        )
        .bind(&message.id)
        .bind(&message.api_name)
        .bind(&message.event_name)
        .bind(&payload_json)
        .bind(&metadata_json)
        .bind(&options_json)
        .execute(&mut inner.conn)
        .await?;

        debug!(
            api_name = %message.api_name,
            event_name = %message.event_name,
            message_id = %message.id,
            "Event written to outbox"
        );
        Ok(())
    }

    async fn consume_pending_events(
        &self,
        message_id: Option<&str>,
        limit: i64,
    ) -> EventResult<Vec<PendingEvent>> {
        let mut inner = self.inner.lock().await;

        // Lock rows only when the caller established transaction scope;
        // plain reads stay lock-free.
        let locking = if inner.in_transaction {
            "FOR UPDATE SKIP LOCKED"
        } else {
            ""
        };
        let rows = match message_id {
            Some(id) => {
                let sql = format!(
                    "SELECT message_id, payload, metadata, options \
                     FROM lightbus_event_outbox \
                     WHERE message_id = $1 \
                     ORDER BY created_at ASC, message_id ASC \
                     LIMIT $2 {locking}"
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(limit)
                    .fetch_all(&mut inner.conn)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT message_id, payload, metadata, options \
                     FROM lightbus_event_outbox \
                     ORDER BY created_at ASC, message_id ASC \
                     LIMIT $1 {locking}"
                );
                sqlx::query(&sql)
                    .bind(limit)
                    .fetch_all(&mut inner.conn)
                    .await?
            }
        };

        let events = rows
            .iter()
            .map(pending_event_from_row)
            .collect::<EventResult<Vec<_>>>()?;
        debug!(count = events.len(), "Fetched pending outbox events");
        Ok(events)
    }

    async fn remove_pending_event(&self, message_id: &str) -> EventResult<()> {
        let mut inner = self.inner.lock().await;
        let result = sqlx::query("DELETE FROM lightbus_event_outbox WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut inner.conn)
            .await?;

        if result.rows_affected() == 0 {
            debug!(message_id = %message_id, "Outbox row already removed");
        } else {
            debug!(message_id = %message_id, "Outbox row removed");
        }
        Ok(())
    }

    async fn outbox_stats(&self) -> EventResult<OutboxStats> {
        let mut inner = self.inner.lock().await;
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (LOCALTIMESTAMP - MIN(created_at)))::BIGINT, 0)
                    AS age_seconds
            FROM lightbus_event_outbox
            "#,
        )
        .fetch_one(&mut inner.conn)
        .await?;

        Ok(OutboxStats {
            pending: row.try_get("pending").unwrap_or(0),
            oldest_age_seconds: row.try_get("age_seconds").unwrap_or(0),
        })
    }
}
