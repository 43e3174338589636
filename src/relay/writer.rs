//! Writer thread: drains the durable store into the failover sender
//!
//! The thread cycles through four states:
//!
//! - `Idle` waits on the drain gate until a full batch is pending or the
//!   drain deadline passes.
//! - `Draining` scans the oldest entries and decodes them.
//! - `Committing` sends the batch and, only on success, deletes it.
//! - `ShuttingDown` makes one final pass over what is left, then exits.
//!
//! A failed send leaves the batch in place; the next cycle presents the
//! same entries in the same order.

use super::cipher::CipherGate;
use super::codec;
use super::event::Event;
use super::gate::DrainGate;
use super::join_with_timeout;
use super::sender::FailoverSender;
use super::store::{DurableStore, StoredFrame};
use crate::core::{RelayMetrics, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Shortest drain interval; a zero delay would spin on an empty store
pub const MIN_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    Draining,
    Committing,
    ShuttingDown,
}

/// Events read back from the store together with their keys
#[derive(Debug, Default)]
pub struct Batch {
    keys: Vec<Vec<u8>>,
    events: Vec<Event>,
}

impl Batch {
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// One drain step over the store, without any scheduling
///
/// The writer thread drives this; tests can call it directly.
pub struct Drainer {
    store: Arc<DurableStore>,
    sender: Arc<Mutex<FailoverSender>>,
    cipher: Option<CipherGate>,
    pending: Arc<AtomicU64>,
    metrics: Arc<RelayMetrics>,
    batch_size: usize,
}

impl Drainer {
    pub fn new(
        store: Arc<DurableStore>,
        sender: Arc<Mutex<FailoverSender>>,
        cipher: Option<CipherGate>,
        pending: Arc<AtomicU64>,
        metrics: Arc<RelayMetrics>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            sender,
            cipher,
            pending,
            metrics,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Reset the pending counter from the store's entry count
    pub fn resync_pending(&self) -> Result<u64> {
        let count = self.store.count()?;
        self.pending.store(count, Ordering::Release);
        Ok(count)
    }

    /// Scan and decode up to `batch_size` of the oldest entries
    ///
    /// Frames that cannot be opened or decoded are quarantined and left
    /// out of the batch. Returns `None` when the store is empty.
    pub fn next_batch(&self) -> Result<Option<Batch>> {
        let frames = self.store.scan_oldest_first(self.batch_size)?;
        if frames.is_empty() {
            return Ok(None);
        }

        let mut batch = Batch::default();
        let mut unreadable = Vec::new();
        let mut reason = String::new();
        for StoredFrame { key, frame } in frames {
            match self.read_frame(&frame) {
                Ok(event) => {
                    batch.keys.push(key);
                    batch.events.push(event);
                }
                Err(e) => {
                    tracing::warn!(key = %String::from_utf8_lossy(&key), error = %e, "Unreadable frame");
                    if reason.is_empty() {
                        reason = e.to_string();
                    }
                    unreadable.push(key);
                }
            }
        }

        if !unreadable.is_empty() {
            let moved = self.store.quarantine(&unreadable, &reason)?;
            self.release_pending(moved);
        }
        Ok(Some(batch))
    }

    fn read_frame(&self, frame: &[u8]) -> Result<Event> {
        match &self.cipher {
            Some(cipher) => codec::decode(&cipher.open(frame)?),
            None => codec::decode(frame),
        }
    }

    /// Send `batch` and delete it from the store once accepted
    ///
    /// Returns how many events were delivered.
    pub fn commit(&self, batch: Batch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.sender.lock().send_batch(&batch.events) {
            self.metrics.record_send_failure();
            return Err(e);
        }
        self.metrics.record_batch_sent(batch.len());

        let deleted = self.store.delete_batch(&batch.keys)?;
        self.release_pending(deleted);
        tracing::trace!(events = batch.len(), "Batch delivered");
        Ok(batch.len())
    }

    /// Scan and commit one batch; `None` when there was nothing to drain
    pub fn drain_cycle(&self) -> Result<Option<usize>> {
        match self.next_batch()? {
            Some(batch) => self.commit(batch).map(Some),
            None => Ok(None),
        }
    }

    fn release_pending(&self, n: usize) {
        let n = n as u64;
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some(p.saturating_sub(n))
            });
    }
}

/// Handle to the running writer thread
pub struct WriterThread {
    shutdown: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
    gate: Arc<DrainGate>,
    state: Arc<Mutex<WriterState>>,
}

impl WriterThread {
    /// Start draining
    ///
    /// `delay` bounds how long an incomplete batch waits; `flush_timeout`
    /// bounds the final pass made on shutdown.
    pub fn spawn(
        drainer: Drainer,
        gate: Arc<DrainGate>,
        delay: Duration,
        flush_timeout: Duration,
    ) -> Result<Self> {
        // Never sent on; dropping the sender is the stop signal
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let state = Arc::new(Mutex::new(WriterState::Idle));

        let worker = WriterLoop {
            drainer,
            gate: Arc::clone(&gate),
            shutdown: shutdown_rx,
            state: Arc::clone(&state),
            delay: delay.max(MIN_DELAY),
            flush_timeout,
            batch: None,
        };
        let handle = thread::Builder::new()
            .name("relay-writer".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            gate,
            state,
        })
    }

    pub fn state(&self) -> WriterState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the thread to flush and exit, waiting up to `timeout`
    ///
    /// Returns `false` if it had not exited in time.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        drop(self.shutdown.take());
        self.gate.open();
        match self.handle.take() {
            Some(handle) => join_with_timeout(handle, timeout, "writer"),
            None => true,
        }
    }
}

impl Drop for WriterThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown(Duration::from_secs(5));
        }
    }
}

struct WriterLoop {
    drainer: Drainer,
    gate: Arc<DrainGate>,
    shutdown: Receiver<()>,
    state: Arc<Mutex<WriterState>>,
    delay: Duration,
    flush_timeout: Duration,
    batch: Option<Batch>,
}

impl WriterLoop {
    fn run(mut self) {
        tracing::debug!(batch_size = self.drainer.batch_size(), delay = ?self.delay, "Writer thread started");
        let mut deadline = Instant::now() + self.delay;
        let mut state = WriterState::Idle;

        loop {
            *self.state.lock() = state;
            state = match state {
                WriterState::Idle => self.idle(&mut deadline),
                WriterState::Draining => match self.drainer.next_batch() {
                    Ok(Some(batch)) => {
                        self.batch = Some(batch);
                        WriterState::Committing
                    }
                    Ok(None) => {
                        deadline = Instant::now() + self.delay;
                        WriterState::Idle
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read batch from durable store");
                        self.back_off(&mut deadline)
                    }
                },
                WriterState::Committing => {
                    let batch = self.batch.take().unwrap_or_default();
                    match self.drainer.commit(batch) {
                        Ok(_) => {
                            deadline = Instant::now() + self.delay;
                            WriterState::Idle
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Batch not delivered, will retry");
                            self.back_off(&mut deadline)
                        }
                    }
                }
                WriterState::ShuttingDown => {
                    self.final_flush();
                    break;
                }
            };
        }
        tracing::debug!("Writer thread exiting");
    }

    fn shutdown_requested(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn idle(&self, deadline: &mut Instant) -> WriterState {
        loop {
            if self.shutdown_requested() {
                return WriterState::ShuttingDown;
            }

            let pending = match self.drainer.resync_pending() {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to count pending entries");
                    return self.back_off(deadline);
                }
            };

            let now = Instant::now();
            if pending >= self.drainer.batch_size() as u64 {
                return WriterState::Draining;
            }
            if now >= *deadline {
                if pending > 0 {
                    return WriterState::Draining;
                }
                *deadline = now + self.delay;
                continue;
            }

            self.gate.wait_for_open(*deadline - now);
            self.gate.close();
        }
    }

    /// Sleep for the drain delay unless shutdown arrives first
    fn back_off(&self, deadline: &mut Instant) -> WriterState {
        match self.shutdown.recv_timeout(self.delay) {
            Err(RecvTimeoutError::Disconnected) => WriterState::ShuttingDown,
            _ => {
                *deadline = Instant::now() + self.delay;
                WriterState::Idle
            }
        }
    }

    fn final_flush(&mut self) {
        let start = Instant::now();
        let mut delivered = 0;

        // A batch scanned before shutdown is still in the store
        self.batch = None;
        loop {
            if start.elapsed() >= self.flush_timeout {
                tracing::warn!(timeout = ?self.flush_timeout, "Final flush timed out");
                break;
            }
            match self.drainer.drain_cycle() {
                Ok(Some(n)) => delivered += n,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Final flush failed, remaining entries stay queued");
                    break;
                }
            }
        }
        tracing::debug!(delivered, "Final flush complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::agent::Agent;
    use crate::relay::cipher::SecretKey;
    use crate::relay::store::StoreOptions;
    use crate::relay::transport::{MemoryConnector, Timeouts};
    use std::collections::BTreeMap;

    struct Fixture {
        store: Arc<DurableStore>,
        pending: Arc<AtomicU64>,
        metrics: Arc<RelayMetrics>,
        connector: MemoryConnector,
        sender: Arc<Mutex<FailoverSender>>,
    }

    impl Fixture {
        fn new() -> Self {
            let metrics = Arc::new(RelayMetrics::new());
            let store = Arc::new(
                DurableStore::open(StoreOptions::in_memory(), Arc::clone(&metrics)).unwrap(),
            );
            let connector = MemoryConnector::new();
            let sender = FailoverSender::new(
                vec![Agent::new("collector", 1)],
                Arc::new(connector.clone()),
                Timeouts::default(),
                1,
            )
            .unwrap();
            Self {
                store,
                pending: Arc::new(AtomicU64::new(0)),
                metrics,
                connector,
                sender: Arc::new(Mutex::new(sender)),
            }
        }

        fn drainer(&self, batch_size: usize, cipher: Option<CipherGate>) -> Drainer {
            Drainer::new(
                Arc::clone(&self.store),
                Arc::clone(&self.sender),
                cipher,
                Arc::clone(&self.pending),
                Arc::clone(&self.metrics),
                batch_size,
            )
        }

        fn put(&self, id: &str) {
            let event = Event::with_id(id, BTreeMap::new(), id.as_bytes().to_vec());
            self.store
                .put(&event.key(), &codec::encode(&event).unwrap())
                .unwrap();
            self.pending.fetch_add(1, Ordering::AcqRel);
        }

        fn stored_ids(&self) -> Vec<String> {
            self.store
                .scan_oldest_first(usize::MAX)
                .unwrap()
                .into_iter()
                .map(|f| String::from_utf8(f.key).unwrap())
                .collect()
        }
    }

    #[test]
    fn test_drain_cycle_sends_oldest_batch() {
        let fixture = Fixture::new();
        for id in ["e1", "e2", "e3", "e4", "e5"] {
            fixture.put(id);
        }
        let drainer = fixture.drainer(3, None);

        assert_eq!(drainer.drain_cycle().unwrap(), Some(3));
        assert_eq!(fixture.connector.batches(), vec![vec!["e1", "e2", "e3"]]);
        assert_eq!(fixture.stored_ids(), vec!["e4", "e5"]);
        assert_eq!(fixture.pending.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_failed_send_keeps_batch() {
        let fixture = Fixture::new();
        for id in ["e1", "e2", "e3", "e4", "e5"] {
            fixture.put(id);
        }
        let drainer = fixture.drainer(3, None);
        fixture.connector.fail_next_sends(1);

        assert!(drainer.drain_cycle().unwrap_err().is_delivery());
        assert_eq!(fixture.stored_ids(), vec!["e1", "e2", "e3", "e4", "e5"]);
        assert_eq!(fixture.metrics.send_failures(), 1);

        let batch = drainer.next_batch().unwrap().unwrap();
        let ids: Vec<&str> = batch.events().iter().map(Event::id).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
        assert_eq!(drainer.commit(batch).unwrap(), 3);
        assert_eq!(fixture.stored_ids(), vec!["e4", "e5"]);
    }

    #[test]
    fn test_empty_store() {
        let fixture = Fixture::new();
        let drainer = fixture.drainer(3, None);
        assert_eq!(drainer.drain_cycle().unwrap(), None);
        assert!(fixture.connector.connect_attempts().is_empty());
    }

    #[test]
    fn test_unreadable_frames_quarantined() {
        let fixture = Fixture::new();
        fixture.put("e1");
        fixture.store.put(b"junk", b"not a frame").unwrap();
        fixture.pending.fetch_add(1, Ordering::AcqRel);
        fixture.put("e2");

        let drainer = fixture.drainer(10, None);
        assert_eq!(drainer.drain_cycle().unwrap(), Some(2));
        assert_eq!(fixture.connector.delivered_ids(), vec!["e1", "e2"]);
        assert!(fixture.stored_ids().is_empty());
        assert_eq!(fixture.store.quarantined_count().unwrap(), 1);
        assert_eq!(fixture.pending.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_sealed_frames_opened() {
        let fixture = Fixture::new();
        let cipher = CipherGate::new(&SecretKey::derive(b"key")).unwrap();
        let event = Event::with_id("e1", BTreeMap::new(), b"secret".to_vec());
        let sealed = cipher.seal(&codec::encode(&event).unwrap()).unwrap();
        fixture.store.put(&event.key(), &sealed).unwrap();

        let drainer = fixture.drainer(1, Some(cipher));
        assert_eq!(drainer.drain_cycle().unwrap(), Some(1));
        assert_eq!(fixture.connector.deliveries()[0].events[0], event);
    }

    #[test]
    fn test_resync_pending() {
        let fixture = Fixture::new();
        fixture.put("e1");
        fixture.pending.store(42, Ordering::Release);
        assert_eq!(fixture.drainer(1, None).resync_pending().unwrap(), 1);
        assert_eq!(fixture.pending.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_thread_drains_when_gate_opens() {
        let fixture = Fixture::new();
        let gate = Arc::new(DrainGate::new());
        let mut writer = WriterThread::spawn(
            fixture.drainer(2, None),
            Arc::clone(&gate),
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .unwrap();

        fixture.put("e1");
        fixture.put("e2");
        gate.open();

        let start = Instant::now();
        while fixture.connector.delivered_count() < 2 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(fixture.connector.batches(), vec![vec!["e1", "e2"]]);
        assert!(writer.shutdown(Duration::from_secs(5)));
        assert_eq!(writer.state(), WriterState::ShuttingDown);
    }

    #[test]
    fn test_thread_drains_partial_batch_after_delay() {
        let fixture = Fixture::new();
        let gate = Arc::new(DrainGate::new());
        let _writer = WriterThread::spawn(
            fixture.drainer(100, None),
            gate,
            Duration::from_millis(50),
            Duration::from_secs(5),
        )
        .unwrap();

        fixture.put("e1");
        let start = Instant::now();
        while fixture.connector.delivered_count() < 1 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(fixture.connector.delivered_ids(), vec!["e1"]);
    }

    #[test]
    fn test_shutdown_flushes_remaining() {
        let fixture = Fixture::new();
        let mut writer = WriterThread::spawn(
            fixture.drainer(2, None),
            Arc::new(DrainGate::new()),
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .unwrap();

        fixture.put("e1");
        assert!(writer.shutdown(Duration::from_secs(5)));
        assert_eq!(fixture.connector.delivered_ids(), vec!["e1"]);
        assert!(fixture.stored_ids().is_empty());
    }

    #[test]
    fn test_shutdown_interrupts_back_off() {
        let fixture = Fixture::new();
        fixture
            .connector
            .set_available(&Agent::new("collector", 1), false);
        fixture.put("e1");

        let mut writer = WriterThread::spawn(
            fixture.drainer(1, None),
            Arc::new(DrainGate::new()),
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        assert!(writer.shutdown(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(fixture.stored_ids(), vec!["e1"]);
    }
}
