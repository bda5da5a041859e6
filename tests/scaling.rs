//! Scaling tests with synthetic histories of 20k messages.
//!
//! Measures the key operations:
//! - Publishing across many repositories and topics
//! - Reconciliation over short and long gaps
//! - Retention cleanup
//! - Restart (journal replay) and compaction of the file backend

use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tidemark::{
    Backend, Bus, BusConfig, ChannelBroker, FileBackend, FileBackendConfig, MemoryBackend,
    MessageInput, ReconcileRequest, RepositoryId, SequenceId, TopicRule,
};

const MESSAGE_COUNT: usize = 20_000;
const REPOSITORY_COUNT: u64 = 50;

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report(&self) {
        println!("  {} took {:.2}ms", self.name, self.elapsed_ms());
    }

    fn report_with_count(&self, count: usize) {
        let ms = self.elapsed_ms();
        let per_item = if count > 0 { ms / count as f64 } else { 0.0 };
        println!(
            "  {} took {:.2}ms ({} items, {:.4}ms/item, {:.0} items/sec)",
            self.name,
            ms,
            count,
            per_item,
            if ms > 0.0 { count as f64 / (ms / 1000.0) } else { 0.0 }
        );
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn bus_over(backend: Arc<dyn Backend>) -> (Bus, crossbeam_channel::Receiver<tidemark::Delivery>) {
    let (broker, receiver) = ChannelBroker::unbounded();
    let bus = Bus::new(backend, Arc::new(broker), BusConfig::default()).unwrap();
    (bus, receiver)
}

/// Global every fifth message, the rest spread over repositories and kinds.
fn message(i: usize) -> MessageInput {
    let kinds = ["issue", "card", "label", "milestone"];
    let kind = kinds[i % kinds.len()];
    let input = MessageInput::new(format!("front.{}.{}", kind, i % 100))
        .kwarg("index", i as u64)
        .kwarg("title", format!("Item {}", i));

    if i % 5 == 0 {
        input
    } else {
        input.in_repository(RepositoryId((i / 5) as u64 % REPOSITORY_COUNT))
    }
}

fn populate(bus: &Bus, count: usize) {
    for i in 0..count {
        bus.publish(message(i)).unwrap();
    }
}

// =============================================================================
// Test: 20k messages, in-memory backend
// =============================================================================

#[test]
fn test_scaling_publish_and_reconcile() {
    init_logging();
    println!("\n=== 20k Messages, Memory Backend ===");

    let (bus, receiver) = bus_over(Arc::new(MemoryBackend::new()));

    let timer = Timer::new("Publish 20k messages");
    populate(&bus, MESSAGE_COUNT);
    timer.report_with_count(MESSAGE_COUNT);
    assert_eq!(receiver.try_iter().count(), MESSAGE_COUNT);

    let stats = bus.stats().unwrap();
    println!(
        "  Stats: {} global, {} repositories, {} index entries",
        stats.global.messages,
        stats.repositories.len(),
        stats.index_entries
    );
    assert_eq!(stats.repositories.len(), REPOSITORY_COUNT as usize);
    assert_eq!(stats.index_entries, MESSAGE_COUNT);

    let everything = vec![TopicRule::prefix("tidemark.front.")];
    let issues = vec![TopicRule::wildcard("tidemark.front.issue.")];

    // Short gap: the common reconnect
    let timer = Timer::new("Reconcile last 100 (100 times)");
    for _ in 0..100 {
        let last = SequenceId((MESSAGE_COUNT - 100) as u64);
        let response = bus
            .reconcile(&ReconcileRequest::new(last, everything.clone()))
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(response.missed_messages.len(), 100);
    }
    timer.report_with_count(100);

    // Long gap, filtered
    let timer = Timer::new("Reconcile 10k gap, issues only");
    let response = bus
        .reconcile(&ReconcileRequest::new(
            SequenceId((MESSAGE_COUNT / 2) as u64),
            issues,
        ))
        .unwrap()
        .into_result()
        .unwrap();
    timer.report_with_count(response.missed_messages.len());
    assert_eq!(response.missed_messages.len(), MESSAGE_COUNT / 2 / 4);

    // Unfiltered cross-scope scan
    let timer = Timer::new("Get all messages");
    let all = bus.get_messages(None, None, None).unwrap();
    timer.report_with_count(all.len());
    assert_eq!(all.len(), MESSAGE_COUNT);

    // Retention
    let timer = Timer::new("Clean first half");
    let removed = bus.clean(SequenceId((MESSAGE_COUNT / 2) as u64 + 1)).unwrap();
    timer.report_with_count(removed);
    assert_eq!(removed, MESSAGE_COUNT / 2);

    // Repository removal
    let timer = Timer::new("Remove one repository");
    let moved = bus.remove_repository(RepositoryId(1)).unwrap();
    timer.report_with_count(moved);
    assert_eq!(bus.get_messages(None, None, None).unwrap().len(), MESSAGE_COUNT / 2);

    println!("  ✓ Memory backend test passed");
}

// =============================================================================
// Test: file backend restart and compaction
// =============================================================================

#[test]
fn test_scaling_file_backend() {
    init_logging();
    println!("\n=== 10k Messages, File Backend ===");

    let count = MESSAGE_COUNT / 2;
    let dir = TempDir::new().unwrap();
    let config = FileBackendConfig {
        path: dir.path().join("bus"),
        create_if_missing: true,
        sync_interval: 1000,
    };

    {
        let timer = Timer::new("Create backend");
        let backend = Arc::new(FileBackend::create(config.clone()).unwrap());
        timer.report();

        let (bus, _receiver) = bus_over(backend.clone());

        let timer = Timer::new("Publish 10k messages");
        populate(&bus, count);
        timer.report_with_count(count);

        let timer = Timer::new("Sync to disk");
        backend.sync().unwrap();
        timer.report();

        bus.clean(SequenceId((count / 2) as u64 + 1)).unwrap();

        let timer = Timer::new("Compact journal");
        let (before, after) = backend.compact().unwrap();
        timer.report();
        println!("  Journal {} -> {} bytes", before, after);
        assert!(after < before);
    }

    let timer = Timer::new("Reopen (replay journal)");
    let backend = Arc::new(FileBackend::open(config).unwrap());
    timer.report();

    let (bus, _receiver) = bus_over(backend);
    assert_eq!(bus.last_sequence_id().unwrap(), SequenceId(count as u64));

    let timer = Timer::new("Reconcile after reopen");
    let response = bus
        .reconcile(&ReconcileRequest::new(
            SequenceId((count / 2) as u64 + 1),
            vec![TopicRule::prefix("tidemark.front.")],
        ))
        .unwrap()
        .into_result()
        .unwrap();
    timer.report_with_count(response.missed_messages.len());
    assert_eq!(response.missed_messages.len(), count / 2 - 1);

    println!("  ✓ File backend test passed");
}
