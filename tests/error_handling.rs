//! Error handling and edge case tests.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tidemark::{
    Backend, Bus, BusConfig, BusError, ChannelBroker, FileBackend, FileBackendConfig, LockConfig,
    MemoryBackend, MessageInput, ReconcileRequest, RepositoryId, SequenceId, TopicRule,
};

fn test_bus_with(backend: Arc<dyn Backend>, config: BusConfig) -> Bus {
    let (broker, receiver) = ChannelBroker::unbounded();
    // Deliveries are not inspected here.
    drop(receiver);
    Bus::new(backend, Arc::new(broker), config).unwrap()
}

fn test_bus() -> Bus {
    test_bus_with(Arc::new(MemoryBackend::new()), BusConfig::default())
}

// --- Publish Errors ---

#[test]
fn test_broker_failure_does_not_fail_publish() {
    let bus = test_bus();

    assert_eq!(bus.publish(MessageInput::new("a")).unwrap(), SequenceId(1));
    assert_eq!(bus.publish(MessageInput::new("b")).unwrap(), SequenceId(2));
    assert_eq!(bus.publisher().pending_count().unwrap(), 2);
    assert!(!bus.flush().unwrap());
}

#[test]
fn test_reserved_kwarg() {
    let bus = test_bus();
    let result = bus.publish(MessageInput::new("a").kwarg("ws_extra", json!({})));
    assert!(matches!(result, Err(BusError::ReservedKwarg(_))));
}

#[test]
fn test_lock_timeout_surfaces() {
    let config = BusConfig {
        lock: LockConfig {
            wait: Duration::from_millis(25),
            ..LockConfig::default()
        },
        ..BusConfig::default()
    };
    let bus = test_bus_with(Arc::new(MemoryBackend::new()), config);

    let _held = bus.publisher().lock().acquire(false, None).unwrap().unwrap();

    assert!(matches!(
        bus.publish(MessageInput::new("a")),
        Err(BusError::LockTimeout { .. })
    ));
    assert!(matches!(
        bus.remove_repository(RepositoryId(1)),
        Err(BusError::LockTimeout { .. })
    ));
    assert!(matches!(
        bus.clean(SequenceId(1)),
        Err(BusError::LockTimeout { .. })
    ));
    // Nothing was allocated.
    assert_eq!(bus.last_sequence_id().unwrap(), SequenceId(0));
}

#[test]
fn test_crashed_holder_lock_expires() {
    let config = BusConfig {
        lock: LockConfig {
            ttl: Duration::from_millis(30),
            wait: Duration::from_secs(2),
            ..LockConfig::default()
        },
        ..BusConfig::default()
    };
    let bus = test_bus_with(Arc::new(MemoryBackend::new()), config);

    let stale = bus.publisher().lock().acquire(false, None).unwrap().unwrap();
    std::mem::forget(stale);

    assert_eq!(bus.publish(MessageInput::new("a")).unwrap(), SequenceId(1));
}

// --- Reconcile Errors ---

#[test]
fn test_reconcile_errors_are_replies() {
    let bus = test_bus();
    for _ in 0..3 {
        bus.publish(MessageInput::new("front.issue")).unwrap();
    }
    let rules = vec![TopicRule::prefix("tidemark.front.")];

    let inverted = bus
        .reconcile(&ReconcileRequest::new(SequenceId(3), rules.clone()).until(SequenceId(1)))
        .unwrap();
    assert_eq!(inverted.error_code(), Some("REC0001"));

    let unknown = bus
        .reconcile(&ReconcileRequest::new(SequenceId(9), rules.clone()))
        .unwrap();
    assert_eq!(unknown.error_code(), Some("REC0002"));

    let future = bus
        .reconcile(&ReconcileRequest::new(SequenceId(1), rules).until(SequenceId(9)))
        .unwrap();
    assert_eq!(future.error_code(), Some("REC0003"));
}

#[test]
fn test_reconcile_json_rejects_garbage() {
    let bus = test_bus();
    bus.publish(MessageInput::new("front.issue")).unwrap();

    let garbage = [
        json!(null),
        json!([]),
        json!({"topics": []}),
        json!({"last_received_id": true}),
    ];
    for request in garbage {
        let reply = bus.reconcile_json(&request).unwrap();
        assert_eq!(reply.error_code(), Some("REC0001"), "{}", request);
    }
}

#[test]
fn test_empty_rules_subscribe_to_nothing() {
    let bus = test_bus();
    bus.publish(MessageInput::new("front.issue")).unwrap();
    bus.publish(MessageInput::new("front.issue")).unwrap();

    let response = bus
        .reconcile(&ReconcileRequest::new(SequenceId(1), vec![]))
        .unwrap()
        .into_result()
        .unwrap();
    assert!(response.missed_messages.is_empty());
    assert_eq!(response.max_sequence_id, SequenceId(2));
}

// --- Edge Cases ---

#[test]
fn test_inverted_range_is_empty() {
    let bus = test_bus();
    bus.publish(MessageInput::new("a")).unwrap();
    bus.publish(MessageInput::new("b")).unwrap();

    assert!(bus
        .get_messages(Some(SequenceId(2)), Some(SequenceId(1)), None)
        .unwrap()
        .is_empty());
}

#[test]
fn test_remove_unknown_repository() {
    let bus = test_bus();
    assert_eq!(bus.remove_repository(RepositoryId(404)).unwrap(), 0);
}

#[test]
fn test_clean_empty_bus() {
    let bus = test_bus();
    assert_eq!(bus.clean(SequenceId(100)).unwrap(), 0);
    let stats = bus.stats().unwrap();
    assert_eq!(stats.oldest_retained_sequence_id, None);
    assert_eq!(stats.index_entries, 0);
}

#[test]
fn test_topic_already_namespaced_is_kept() {
    let bus = test_bus();
    bus.publish(MessageInput::new("tidemark.front.issue")).unwrap();
    bus.publish(MessageInput::new("front.issue")).unwrap();

    let topics: Vec<_> = bus
        .get_messages(None, None, None)
        .unwrap()
        .into_iter()
        .map(|m| m.envelope.topic)
        .collect();
    assert_eq!(topics, vec!["tidemark.front.issue", "tidemark.front.issue"]);
}

// --- Storage Errors ---

#[test]
fn test_file_backend_single_owner() {
    let dir = TempDir::new().unwrap();
    let config = FileBackendConfig {
        path: dir.path().join("bus"),
        ..FileBackendConfig::default()
    };

    let _owner = FileBackend::open_or_create(config.clone()).unwrap();
    assert!(matches!(
        FileBackend::open_or_create(config),
        Err(BusError::Locked)
    ));
}

#[test]
fn test_corrupted_journal_refuses_to_open() {
    let dir = TempDir::new().unwrap();
    let config = FileBackendConfig {
        path: dir.path().join("bus"),
        ..FileBackendConfig::default()
    };

    {
        let backend = Arc::new(FileBackend::open_or_create(config.clone()).unwrap());
        let bus = test_bus_with(backend, BusConfig::default());
        bus.publish(MessageInput::new("a")).unwrap();
        bus.publish(MessageInput::new("b")).unwrap();
    }

    // Damage a byte inside the first frame's payload.
    let journal = config.path.join("journal.log");
    let mut bytes = std::fs::read(&journal).unwrap();
    bytes[12] ^= 0xFF;
    std::fs::write(&journal, bytes).unwrap();

    assert!(matches!(
        FileBackend::open_or_create(config),
        Err(BusError::Corruption(_))
    ));
}

#[test]
fn test_invalid_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bus.json");
    std::fs::write(&path, r#"{"lock": {"ttl": 0}}"#).unwrap();

    assert!(matches!(
        BusConfig::from_json_file(&path),
        Err(BusError::InvalidConfig(_))
    ));
    assert!(matches!(
        BusConfig::from_json_file(dir.path().join("missing.json")),
        Err(BusError::Io(_))
    ));
}
