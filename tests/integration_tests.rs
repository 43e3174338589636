//! Integration tests for the relay
//!
//! These tests verify:
//! - Batched draining leaves exactly the undelivered tail queued
//! - A failed send is retried with the same batch, without loss or duplication
//! - Direct mode surfaces delivery failures to the caller
//! - Undelivered entries survive a stop and are delivered after restart
//! - Failover to a secondary agent
//! - Encryption at rest
//! - End-to-end delivery over TCP

use parking_lot::Mutex;
use rust_logger_relay::appenders::RelayAppender;
use rust_logger_relay::core::{Appender, LogEntry, LogLevel, RelayError, RelayMetrics};
use rust_logger_relay::relay::cipher::{KeyProviderRegistry, SecretKey};
use rust_logger_relay::relay::codec;
use rust_logger_relay::relay::store::{DurableStore, StoreOptions};
use rust_logger_relay::relay::transport::tcp::{read_request, ACK_OK};
use rust_logger_relay::relay::transport::{MemoryConnector, Timeouts};
use rust_logger_relay::relay::writer::Drainer;
use rust_logger_relay::relay::{Agent, Event, FailoverSender, ForwardingMode, RelayManager};
use std::collections::BTreeMap;
use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn event(id: &str) -> Event {
    Event::with_id(id, BTreeMap::new(), format!("body of {}", id).into_bytes())
}

fn ids(range: std::ops::RangeInclusive<u32>) -> Vec<String> {
    range.map(|i| format!("E{}", i)).collect()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn stored_ids(dir: &Path) -> Vec<String> {
    let store = DurableStore::open(StoreOptions::directory(dir), Arc::new(RelayMetrics::new()))
        .expect("Failed to open store");
    store
        .scan_oldest_first(usize::MAX)
        .expect("Failed to scan store")
        .into_iter()
        .map(|f| String::from_utf8(f.key).expect("Non UTF-8 key"))
        .collect()
}

/// Store, sender and drainer wired by hand, for stepping drain cycles
struct DrainFixture {
    store: Arc<DurableStore>,
    connector: MemoryConnector,
    drainer: Drainer,
}

impl DrainFixture {
    fn new(batch_size: usize) -> Self {
        let metrics = Arc::new(RelayMetrics::new());
        let store = Arc::new(
            DurableStore::open(StoreOptions::in_memory(), Arc::clone(&metrics))
                .expect("Failed to open store"),
        );
        let connector = MemoryConnector::new();
        let sender = FailoverSender::new(
            vec![Agent::new("collector", 4141)],
            Arc::new(connector.clone()),
            Timeouts::default(),
            1,
        )
        .expect("Failed to create sender");
        let drainer = Drainer::new(
            Arc::clone(&store),
            Arc::new(Mutex::new(sender)),
            None,
            Arc::new(AtomicU64::new(0)),
            metrics,
            batch_size,
        );
        Self {
            store,
            connector,
            drainer,
        }
    }

    fn send(&self, id: &str) {
        let event = event(id);
        self.store
            .put(&event.key(), &codec::encode(&event).unwrap())
            .unwrap();
    }

    fn stored(&self) -> Vec<String> {
        self.store
            .scan_oldest_first(usize::MAX)
            .unwrap()
            .into_iter()
            .map(|f| String::from_utf8(f.key).unwrap())
            .collect()
    }
}

#[test]
fn test_first_cycle_sends_oldest_full_batch() {
    let fixture = DrainFixture::new(3);
    for id in ids(1..=5) {
        fixture.send(&id);
    }

    assert_eq!(fixture.drainer.drain_cycle().unwrap(), Some(3));
    assert_eq!(fixture.connector.batches(), vec![ids(1..=3)]);
    assert_eq!(fixture.stored(), ids(4..=5));
}

#[test]
fn test_failed_batch_retried_unchanged() {
    let fixture = DrainFixture::new(3);
    for id in ids(1..=5) {
        fixture.send(&id);
    }

    fixture.connector.fail_next_sends(1);
    let err = fixture.drainer.drain_cycle().unwrap_err();
    assert!(err.is_delivery());
    assert_eq!(fixture.stored(), ids(1..=5));

    assert_eq!(fixture.drainer.drain_cycle().unwrap(), Some(3));
    assert_eq!(fixture.stored(), ids(4..=5));
    assert_eq!(fixture.connector.batches(), vec![ids(1..=3)]);
}

#[test]
fn test_manager_drains_full_batch_immediately() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let connector = MemoryConnector::new();
    let manager = RelayManager::builder()
        .connector(Arc::new(connector.clone()))
        .data_dir(dir.path())
        .batch_size(3)
        .delay(Duration::from_secs(60))
        .build()
        .unwrap();
    manager.start().unwrap();

    for id in ids(1..=5) {
        manager.send(&event(&id)).unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || connector.delivered_count() == 3));
    assert!(wait_until(Duration::from_secs(5), || manager.pending_count() == 2));
    assert_eq!(connector.batches(), vec![ids(1..=3)]);

    // The tail is flushed on stop
    manager.stop(Duration::from_secs(5)).unwrap();
    assert_eq!(connector.batches(), vec![ids(1..=3), ids(4..=5)]);
    assert!(stored_ids(dir.path()).is_empty());
}

#[test]
fn test_manager_retries_after_failure_without_loss() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let connector = MemoryConnector::new();
    connector.fail_next_sends(1);
    let manager = RelayManager::builder()
        .connector(Arc::new(connector.clone()))
        .data_dir(dir.path())
        .batch_size(3)
        .delay(Duration::from_millis(100))
        .build()
        .unwrap();
    manager.start().unwrap();

    for id in ids(1..=5) {
        manager.send(&event(&id)).unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || connector.delivered_count() == 5));
    manager.stop(Duration::from_secs(5)).unwrap();

    assert_eq!(connector.delivered_ids(), ids(1..=5));
    assert_eq!(manager.metrics().send_failures(), 1);
    assert_eq!(manager.metrics().delivered(), 5);
}

#[test]
fn test_direct_mode_failure_is_synchronous() {
    let connector = MemoryConnector::new();
    let manager = RelayManager::builder()
        .connector(Arc::new(connector.clone()))
        .mode(ForwardingMode::Direct)
        .batch_size(1)
        .build()
        .unwrap();
    manager.start().unwrap();

    manager.send(&event("E1")).unwrap();
    assert_eq!(connector.delivered_ids(), vec!["E1"]);

    connector.fail_next_sends(1);
    assert!(matches!(
        manager.send(&event("E2")),
        Err(RelayError::DeliveryFailure { .. })
    ));
    manager.stop(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_undelivered_entries_survive_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Agent::new("collector", 4141);
    let connector = MemoryConnector::new();
    connector.set_available(&agent, false);

    let build = || {
        RelayManager::builder()
            .agent(agent.host.clone(), agent.port)
            .connector(Arc::new(connector.clone()))
            .data_dir(dir.path())
            .batch_size(10)
            .delay(Duration::from_secs(60))
            .build()
            .unwrap()
    };

    let manager = build();
    manager.start().unwrap();
    for id in ids(1..=3) {
        manager.send(&event(&id)).unwrap();
    }
    manager.stop(Duration::from_secs(5)).unwrap();
    drop(manager);

    assert_eq!(stored_ids(dir.path()), ids(1..=3));
    assert_eq!(connector.delivered_count(), 0);

    connector.set_available(&agent, true);
    let restarted = build();
    restarted.start().unwrap();
    assert_eq!(restarted.pending_count(), 3);
    restarted.stop(Duration::from_secs(5)).unwrap();

    assert_eq!(connector.delivered_ids(), ids(1..=3));
    assert!(stored_ids(dir.path()).is_empty());
}

#[test]
fn test_fails_over_to_secondary_agent() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let connector = MemoryConnector::new();
    connector.set_available(&Agent::new("primary", 4141), false);
    let manager = RelayManager::builder()
        .hosts("primary:4141,secondary:4141")
        .connector(Arc::new(connector.clone()))
        .data_dir(dir.path())
        .build()
        .unwrap();
    manager.start().unwrap();

    manager.send(&event("E1")).unwrap();
    assert!(wait_until(Duration::from_secs(5), || connector.delivered_count() == 1));
    manager.stop(Duration::from_secs(5)).unwrap();

    let deliveries = connector.deliveries();
    assert_eq!(deliveries[0].agent, Agent::new("secondary", 4141));
}

fn database_bytes(dir: &Path) -> Vec<u8> {
    let mut bytes = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("relay.db"))
        {
            bytes.extend(std::fs::read(path).unwrap());
        }
    }
    bytes
}

fn queue_offline(dir: &Path, key_provider: Option<&str>, registry: KeyProviderRegistry) {
    let agent = Agent::new("collector", 4141);
    let connector = MemoryConnector::new();
    connector.set_available(&agent, false);
    let mut builder = RelayManager::builder()
        .agent(agent.host.clone(), agent.port)
        .connector(Arc::new(connector))
        .data_dir(dir)
        .key_registry(registry);
    if let Some(name) = key_provider {
        builder = builder.key_provider(name);
    }
    let manager = builder.build().unwrap();
    manager.start().unwrap();
    manager
        .send(&Event::with_id("E1", BTreeMap::new(), b"very-secret-payload".to_vec()))
        .unwrap();
    manager.stop(Duration::from_secs(5)).unwrap();
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn test_frames_encrypted_at_rest() {
    let mut registry = KeyProviderRegistry::new();
    registry.register_static("fixed", SecretKey::derive(b"passphrase"));

    let plain = TempDir::new().expect("Failed to create temp dir");
    queue_offline(plain.path(), None, registry.clone());
    assert!(contains(&database_bytes(plain.path()), b"very-secret-payload"));

    let sealed = TempDir::new().expect("Failed to create temp dir");
    queue_offline(sealed.path(), Some("fixed"), registry);
    assert!(!contains(&database_bytes(sealed.path()), b"very-secret-payload"));
    assert_eq!(stored_ids(sealed.path()), vec!["E1"]);
}

#[test]
fn test_appender_end_to_end_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind collector");
    let port = listener.local_addr().unwrap().port();
    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let collector = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("Collector accept failed");
        while let Some(events) = read_request(&mut stream).expect("Bad request") {
            for event in events {
                events_tx.send(event).unwrap();
            }
            stream.write_all(&[ACK_OK]).unwrap();
        }
    });

    let manager = Arc::new(
        RelayManager::builder()
            .agent("127.0.0.1", port)
            .in_memory()
            .batch_size(2)
            .delay(Duration::from_millis(200))
            .build()
            .unwrap(),
    );
    let mut appender = RelayAppender::builder(Arc::clone(&manager))
        .mdc_prefix("mdc.")
        .compress_body(false)
        .build()
        .unwrap();

    for i in 0..5 {
        appender
            .append(&LogEntry::new(LogLevel::Info, format!("message {}", i)).with_context("seq", i.to_string()))
            .unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 5 {
        match events_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(event) => received.push(event),
            Err(_) => break,
        }
    }
    appender.stop(Duration::from_secs(5)).unwrap();
    collector.join().expect("Collector panicked");

    assert_eq!(received.len(), 5);
    for (i, event) in received.iter().enumerate() {
        let seq = i.to_string();
        assert_eq!(event.header("mdc.seq"), Some(seq.as_str()));
        assert!(String::from_utf8_lossy(event.body()).ends_with(&format!("message {}", i)));
    }
}
