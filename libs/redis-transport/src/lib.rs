//! Redis Streams event transport.
//!
//! Publishes each `api.event` pair to its own stream
//! (`{api_name}.{event_name}:stream`) and consumes through a consumer
//! group, so parallel bus clients share the work and unacknowledged
//! deliveries are redelivered. Designed to be wrapped by the
//! transactional transport, which acknowledges only after its database
//! commit.

use async_trait::async_trait;
use bus_core::{
    EventBatch, EventMessage, EventTransport, PublishOptions, ReloadSignal, TransportError,
    TransportResult,
};
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Options for [`RedisEventTransport`].
#[derive(Debug, Clone, Deserialize)]
pub struct RedisTransportConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`
    pub url: String,

    /// Consumer group name shared by cooperating bus clients
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Consumer name within the group; defaults to a per-instance id
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// Maximum entries per stream per fetch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Wait between empty reads, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_consumer_group() -> String {
    "lightbus".to_string()
}

fn default_consumer_name() -> String {
    format!("consumer-{}", Uuid::new_v4())
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    100
}

/// Stream key naming convention, shared with every other bus client.
fn stream_key(api_name: &str, event_name: &str) -> String {
    format!("{api_name}.{event_name}:stream")
}

fn publish_error(err: redis::RedisError) -> TransportError {
    TransportError::PublishFailed(err.to_string())
}

fn fetch_error(err: redis::RedisError) -> TransportError {
    TransportError::FetchFailed(err.to_string())
}

/// Event transport over Redis Streams with consumer groups.
pub struct RedisEventTransport {
    manager: ConnectionManager,
    config: RedisTransportConfig,
    subscriptions: Mutex<BTreeSet<(String, String)>>,
    ensured_groups: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<String, Delivery>>,
    reload: ReloadSignal,
}

/// Where an unacknowledged message came from.
struct Delivery {
    stream: String,
    entry_id: String,
}

impl RedisEventTransport {
    pub async fn connect(config: RedisTransportConfig) -> TransportResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| TransportError::Other(anyhow::anyhow!("invalid Redis URL: {e}")))?;
        let manager = ConnectionManager::new(client).await.map_err(|e| {
            TransportError::Other(anyhow::anyhow!("failed to connect to Redis: {e}"))
        })?;
        info!(
            consumer_group = %config.consumer_group,
            consumer_name = %config.consumer_name,
            "Redis event transport connected"
        );
        Ok(Self {
            manager,
            config,
            subscriptions: Mutex::new(BTreeSet::new()),
            ensured_groups: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            reload: ReloadSignal::new(),
        })
    }

    fn subscribed_streams(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(api, event)| stream_key(api, event))
            .collect()
    }

    /// Create the consumer group on each newly subscribed stream
    /// (idempotent; existing groups are left alone).
    async fn ensure_groups(&self, streams: &[String]) {
        let missing: Vec<String> = {
            let ensured = self.ensured_groups.lock().unwrap();
            streams
                .iter()
                .filter(|key| !ensured.contains(*key))
                .cloned()
                .collect()
        };

        let mut conn = self.manager.clone();
        for key in missing {
            let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&key)
                .arg(&self.config.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            match created {
                Ok(()) => debug!(stream = %key, "Consumer group created"),
                // BUSYGROUP means the group already exists
                Err(err) => debug!(stream = %key, error = %err, "Consumer group not created"),
            }
            self.ensured_groups.lock().unwrap().insert(key);
        }
    }

    fn message_from_entry(&self, stream: &str, entry: &StreamId) -> Option<EventMessage> {
        let id: String = entry.get("id")?;
        let api_name: String = entry.get("api_name")?;
        let event_name: String = entry.get("event_name")?;
        let kwargs_json: String = entry.get("kwargs")?;
        let kwargs: Map<String, Value> = match serde_json::from_str(&kwargs_json) {
            Ok(kwargs) => kwargs,
            Err(err) => {
                warn!(stream = %stream, entry_id = %entry.id, error = %err,
                      "Discarding stream entry with malformed kwargs");
                return None;
            }
        };

        self.in_flight.lock().unwrap().insert(
            id.clone(),
            Delivery {
                stream: stream.to_string(),
                entry_id: entry.id.clone(),
            },
        );
        Some(EventMessage::new(api_name, event_name, kwargs).with_id(id))
    }

    async fn read_once(&self, streams: &[String]) -> TransportResult<Vec<EventMessage>> {
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
        let options = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.consumer_name)
            .count(self.config.batch_size);

        let mut conn = self.manager.clone();
        let reply: StreamReadReply = conn
            .xread_options(streams, &ids, &options)
            .await
            .map_err(fetch_error)?;

        let mut messages = Vec::new();
        for stream in reply.keys {
            for entry in &stream.ids {
                if let Some(message) = self.message_from_entry(&stream.key, entry) {
                    messages.push(message);
                }
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl EventTransport for RedisEventTransport {
    async fn send_event(
        &self,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> TransportResult<()> {
        let key = stream_key(&message.api_name, &message.event_name);
        let kwargs_json = serde_json::to_string(&message.kwargs)?;
        let options_json = serde_json::to_string(options)?;

        let mut conn = self.manager.clone();
        let entry_id: String = conn
            .xadd(
                &key,
                "*",
                &[
                    ("id", message.id.as_str()),
                    ("api_name", message.api_name.as_str()),
                    ("event_name", message.event_name.as_str()),
                    ("kwargs", kwargs_json.as_str()),
                    ("options", options_json.as_str()),
                ],
            )
            .await
            .map_err(publish_error)?;

        debug!(
            stream = %key,
            entry_id = %entry_id,
            message_id = %message.id,
            "Event published to stream"
        );
        Ok(())
    }

    async fn fetch_events(&self) -> TransportResult<EventBatch> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        let streams = self.subscribed_streams();
        if streams.is_empty() {
            tokio::select! {
                _ = self.reload.wait() => {}
                _ = tokio::time::sleep(poll) => {}
            }
            return Ok(EventBatch::empty());
        }

        self.ensure_groups(&streams).await;

        let messages = self.read_once(&streams).await?;
        if !messages.is_empty() {
            return Ok(EventBatch {
                messages,
                cursor: None,
            });
        }

        // Nothing ready: wait one poll interval, unless a subscription
        // reload interrupts, in which case the batch is empty so the
        // caller re-fetches against the new subscription set.
        tokio::select! {
            _ = self.reload.wait() => {
                debug!("Event transport reloading");
                Ok(EventBatch::empty())
            }
            _ = tokio::time::sleep(poll) => {
                let messages = self.read_once(&self.subscribed_streams()).await?;
                Ok(EventBatch {
                    messages,
                    cursor: None,
                })
            }
        }
    }

    async fn start_listening_for(&self, api_name: &str, event_name: &str) -> TransportResult<()> {
        info!("Beginning to listen for {api_name}.{event_name}");
        let inserted = self
            .subscriptions
            .lock()
            .unwrap()
            .insert((api_name.to_string(), event_name.to_string()));
        if inserted {
            self.reload.trigger();
        }
        Ok(())
    }

    async fn stop_listening_for(&self, api_name: &str, event_name: &str) -> TransportResult<()> {
        let removed = self
            .subscriptions
            .lock()
            .unwrap()
            .remove(&(api_name.to_string(), event_name.to_string()));
        if removed {
            self.reload.trigger();
        }
        Ok(())
    }

    async fn acknowledge(&self, message: &EventMessage) -> TransportResult<()> {
        let delivery = self.in_flight.lock().unwrap().remove(&message.id);
        let Some(delivery) = delivery else {
            debug!(message_id = %message.id, "No in-flight delivery to acknowledge");
            return Ok(());
        };

        let mut conn = self.manager.clone();
        let _acked: i64 = conn
            .xack(
                &delivery.stream,
                &self.config.consumer_group,
                &[&delivery.entry_id],
            )
            .await
            .map_err(fetch_error)?;

        debug!(
            stream = %delivery.stream,
            entry_id = %delivery.entry_id,
            message_id = %message.id,
            "Delivery acknowledged"
        );
        Ok(())
    }

    async fn history(
        &self,
        api_name: &str,
        event_name: &str,
    ) -> TransportResult<Vec<EventMessage>> {
        let key = stream_key(api_name, event_name);
        let mut conn = self.manager.clone();
        let reply: StreamRangeReply = conn.xrange_all(&key).await.map_err(fetch_error)?;

        let mut messages = Vec::new();
        for entry in &reply.ids {
            let (Some(id), Some(api), Some(event), Some(kwargs_json)) = (
                entry.get::<String>("id"),
                entry.get::<String>("api_name"),
                entry.get::<String>("event_name"),
                entry.get::<String>("kwargs"),
            ) else {
                warn!(stream = %key, entry_id = %entry.id, "Skipping malformed stream entry");
                continue;
            };
            match serde_json::from_str::<Map<String, Value>>(&kwargs_json) {
                Ok(kwargs) => messages.push(EventMessage::new(api, event, kwargs).with_id(id)),
                Err(err) => {
                    warn!(stream = %key, entry_id = %entry.id, error = %err,
                          "Skipping stream entry with malformed kwargs");
                }
            }
        }
        Ok(messages)
    }
}
