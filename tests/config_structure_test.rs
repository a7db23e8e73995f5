//! Configuration structure tests: the tagged transport registry and the
//! defaulting behavior.

use lightbus::{ChildTransportConfig, TransactionalEventsConfig};
use serde_json::json;

#[test]
fn redis_child_transport_is_selected_by_tag() {
    let config: TransactionalEventsConfig = serde_json::from_value(json!({
        "child_transport": {
            "transport": "redis",
            "url": "redis://my_host:9999/0"
        },
        "database": {
            "dsn": "postgres://postgres@localhost:5432/postgres"
        }
    }))
    .unwrap();

    match &config.child_transport {
        ChildTransportConfig::Redis(redis) => {
            assert_eq!(redis.url, "redis://my_host:9999/0");
            assert_eq!(redis.consumer_group, "lightbus");
        }
        other => panic!("expected redis child transport, got {other:?}"),
    }
    assert!(config.database.migrate_on_startup);
}

#[test]
fn debug_child_transport_is_selected_by_tag() {
    let config: TransactionalEventsConfig = serde_json::from_value(json!({
        "child_transport": {"transport": "debug"},
        "database": {"dsn": "postgres://postgres@localhost:5432/postgres"}
    }))
    .unwrap();

    assert!(matches!(
        config.child_transport,
        ChildTransportConfig::Debug(_)
    ));
}

#[test]
fn publisher_settings_default_when_omitted() {
    let config: TransactionalEventsConfig = serde_json::from_value(json!({
        "child_transport": {"transport": "debug"},
        "database": {"dsn": "postgres://postgres@localhost:5432/postgres"}
    }))
    .unwrap();

    assert_eq!(config.publisher.batch_size, 100);
    assert_eq!(config.publisher.retry_backoff_ms, 1000);
    assert_eq!(config.publisher.poll_interval_ms, 5000);
}

#[test]
fn publisher_settings_can_be_overridden() {
    let config: TransactionalEventsConfig = serde_json::from_value(json!({
        "child_transport": {"transport": "debug"},
        "database": {
            "dsn": "postgres://postgres@localhost:5432/postgres",
            "migrate_on_startup": false
        },
        "publisher": {"batch_size": 10, "retry_backoff_ms": 50, "poll_interval_ms": 250}
    }))
    .unwrap();

    assert!(!config.database.migrate_on_startup);
    assert_eq!(config.publisher.batch_size, 10);
    assert_eq!(config.publisher.retry_backoff_ms, 50);
    assert_eq!(config.publisher.poll_interval_ms, 250);
}

#[test]
fn unknown_transport_tags_are_rejected() {
    let result = serde_json::from_value::<TransactionalEventsConfig>(json!({
        "child_transport": {"transport": "carrier_pigeon"},
        "database": {"dsn": "postgres://postgres@localhost:5432/postgres"}
    }));
    assert!(result.is_err());
}
