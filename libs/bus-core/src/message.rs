//! Event messages and publish options.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{TransportError, TransportResult};

/// A single fire-and-forget event on the bus.
///
/// Events are identified by `(api_name, event_name, id)`. The `id` is the
/// deduplication key and must be globally unique per publisher; the
/// constructor assigns a v4 UUID, [`EventMessage::with_id`] overrides it.
/// The keyword arguments are the opaque payload carried to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Globally unique message id, used for deduplication
    pub id: String,

    /// Name of the API the event belongs to (e.g. "my_company.auth")
    pub api_name: String,

    /// Name of the event within the API (e.g. "user_registered")
    pub event_name: String,

    /// Event payload as JSON keyword arguments
    pub kwargs: Map<String, Value>,
}

impl EventMessage {
    pub fn new(
        api_name: impl Into<String>,
        event_name: impl Into<String>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs,
        }
    }

    /// Replace the generated id with a caller-supplied one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Dotted `api_name.event_name` pair, used for stream naming and
    /// subscription bookkeeping.
    pub fn fully_qualified_name(&self) -> String {
        format!("{}.{}", self.api_name, self.event_name)
    }

    /// The metadata map persisted alongside the payload: the identifying
    /// triple of the message.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("api_name".to_string(), Value::String(self.api_name.clone()));
        metadata.insert(
            "event_name".to_string(),
            Value::String(self.event_name.clone()),
        );
        metadata.insert("id".to_string(), Value::String(self.id.clone()));
        metadata
    }

    /// Rebuild a message from a stored `(metadata, kwargs)` pair, the
    /// inverse of [`EventMessage::metadata`].
    pub fn from_stored(metadata: &Map<String, Value>, kwargs: Map<String, Value>) -> TransportResult<Self> {
        let field = |key: &str| -> TransportResult<String> {
            metadata
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    TransportError::Other(anyhow::anyhow!(
                        "stored event metadata is missing {key:?}"
                    ))
                })
        };
        Ok(Self {
            id: field("id")?,
            api_name: field("api_name")?,
            event_name: field("event_name")?,
            kwargs,
        })
    }
}

/// Options carried alongside a message from the application to the child
/// transport, as a string-keyed map of JSON values.
///
/// Values enter through [`PublishOptions::try_insert`], which rejects
/// anything that cannot be represented as JSON with
/// [`TransportError::UnsupportedOptionValue`] naming the offending key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublishOptions(pub BTreeMap<String, Value>);

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `value` and store it under `key`.
    pub fn try_insert(
        &mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> TransportResult<()> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .map_err(|source| TransportError::UnsupportedOptionValue {
                key: key.clone(),
                source,
            })?;
        self.0.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for PublishOptions {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use serde_json::json;

    struct NotJson;

    impl Serialize for NotJson {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("value has no JSON representation"))
        }
    }

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn metadata_holds_identifying_triple() {
        let message = EventMessage::new("api", "event", kwargs(json!({"field": "abc"})))
            .with_id("123");
        let metadata = message.metadata();
        assert_eq!(metadata.get("api_name"), Some(&json!("api")));
        assert_eq!(metadata.get("event_name"), Some(&json!("event")));
        assert_eq!(metadata.get("id"), Some(&json!("123")));
    }

    #[test]
    fn stored_form_round_trips() {
        let message = EventMessage::new("api", "event", kwargs(json!({"field": "abc"})))
            .with_id("123");
        let rebuilt =
            EventMessage::from_stored(&message.metadata(), message.kwargs.clone()).unwrap();
        assert_eq!(rebuilt, message);
    }

    #[test]
    fn from_stored_rejects_incomplete_metadata() {
        let mut metadata = Map::new();
        metadata.insert("api_name".to_string(), json!("api"));
        let result = EventMessage::from_stored(&metadata, Map::new());
        assert!(result.is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = EventMessage::new("api", "event", Map::new());
        let b = EventMessage::new("api", "event", Map::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn options_accept_json_values() {
        let mut options = PublishOptions::new();
        options.try_insert("key", "value").unwrap();
        options.try_insert("nested", json!({"a": [1, 2, 3]})).unwrap();
        assert_eq!(options.get("key"), Some(&json!("value")));
    }

    #[test]
    fn options_reject_unrepresentable_values() {
        let mut options = PublishOptions::new();
        let err = options.try_insert("key", NotJson).unwrap_err();
        match err {
            TransportError::UnsupportedOptionValue { key, .. } => assert_eq!(key, "key"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(options.is_empty());
    }
}
