//! Relay manager: owns the store, sender and writer thread
//!
//! # Example
//!
//! ```no_run
//! use rust_logger_relay::relay::{Event, RelayManager};
//! use std::collections::BTreeMap;
//! use std::time::Duration;
//!
//! let manager = RelayManager::builder()
//!     .hosts("collector-a:4141,collector-b:4141")
//!     .batch_size(100)
//!     .data_dir("/var/lib/myapp/relay")
//!     .build()
//!     .expect("Invalid relay configuration");
//!
//! manager.start().expect("Failed to start relay");
//! manager
//!     .send(&Event::new(BTreeMap::new(), b"hello".to_vec()))
//!     .expect("Failed to queue event");
//! manager.stop(Duration::from_secs(30)).expect("Unclean shutdown");
//! ```

use super::agent::Agent;
use super::cipher::{CipherGate, KeyProviderRegistry};
use super::codec;
use super::config::{ForwardingMode, RelayConfig};
use super::event::Event;
use super::gate::DrainGate;
use super::sender::FailoverSender;
use super::store::DurableStore;
use super::store_worker::StoreWriter;
use super::transport::AgentConnector;
use super::writer::{Drainer, WriterThread};
use crate::core::{RelayError, RelayMetrics, Result};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long `stop` waits for the sender while the writer may hold it
const SENDER_CLOSE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    Running,
}

struct DurablePipeline {
    store: Arc<DurableStore>,
    cipher: Option<CipherGate>,
    store_writer: StoreWriter,
    writer: WriterThread,
    sender: Arc<Mutex<FailoverSender>>,
    gate: Arc<DrainGate>,
    pending: Arc<AtomicU64>,
}

#[derive(Default)]
struct DirectBuffer {
    events: Vec<Event>,
    first_at: Option<Instant>,
}

struct DirectPipeline {
    sender: Mutex<FailoverSender>,
    buffer: Mutex<DirectBuffer>,
    batch_size: usize,
    delay: Duration,
}

enum Pipeline {
    Durable(DurablePipeline),
    Direct(DirectPipeline),
}

/// Accepts events from producers and forwards them to collector agents
///
/// `send` may be called from any number of threads. `stop` waits for
/// in-progress sends before tearing the pipeline down.
pub struct RelayManager {
    config: RelayConfig,
    agents: Vec<Agent>,
    connector: Arc<dyn AgentConnector>,
    key_registry: KeyProviderRegistry,
    metrics: Arc<RelayMetrics>,
    pipeline: RwLock<Option<Pipeline>>,
}

impl RelayManager {
    pub fn builder() -> RelayManagerBuilder {
        RelayManagerBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn state(&self) -> ManagerState {
        if self.pipeline.read().is_some() {
            ManagerState::Running
        } else {
            ManagerState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    /// Open the pipeline; starting a running manager is a no-op
    ///
    /// Failing to reach a collector here is not an error, the sender
    /// reconnects on demand.
    pub fn start(&self) -> Result<()> {
        let mut pipeline = self.pipeline.write();
        if pipeline.is_some() {
            tracing::debug!(relay = %self.config.name, "Relay already running");
            return Ok(());
        }

        let mut sender = FailoverSender::new(
            self.agents.clone(),
            Arc::clone(&self.connector),
            self.config.timeouts(),
            self.config.retries,
        )?;

        *pipeline = Some(match self.config.mode {
            ForwardingMode::Direct => {
                if !sender.connect() {
                    tracing::warn!(relay = %self.config.name, "No collector reachable at start");
                }
                Pipeline::Direct(DirectPipeline {
                    sender: Mutex::new(sender),
                    buffer: Mutex::new(DirectBuffer::default()),
                    batch_size: self.config.effective_batch_size(),
                    delay: self.config.delay(),
                })
            }
            ForwardingMode::Persistent => Pipeline::Durable(self.start_durable(sender)?),
        });

        tracing::debug!(
            relay = %self.config.name,
            mode = ?self.config.mode,
            agents = %Agent::describe(&self.agents),
            "Relay started"
        );
        Ok(())
    }

    fn start_durable(&self, mut sender: FailoverSender) -> Result<DurablePipeline> {
        let cipher = match &self.config.key_provider {
            Some(name) => Some(CipherGate::new(&self.key_registry.resolve(name)?)?),
            None => None,
        };

        let options = self.config.store_options();
        let wait_timeout =
            (options.lock_timeout + options.lock_retry_interval) * options.lock_timeout_retry_count;
        let retry_count = options.lock_timeout_retry_count;
        let store = Arc::new(DurableStore::open(options, Arc::clone(&self.metrics))?);

        let batch_size = self.config.effective_batch_size();
        let pending = Arc::new(AtomicU64::new(store.count()?));
        let gate = Arc::new(DrainGate::new());
        if pending.load(Ordering::Acquire) > 0 {
            tracing::debug!(
                pending = pending.load(Ordering::Acquire),
                "Recovered undelivered events from durable store"
            );
        }

        if !sender.connect() {
            tracing::warn!(relay = %self.config.name, "No collector reachable at start, events will queue");
        }
        let sender = Arc::new(Mutex::new(sender));

        let store_writer = StoreWriter::spawn(
            Arc::clone(&store),
            Arc::clone(&gate),
            Arc::clone(&pending),
            batch_size as u64,
            wait_timeout,
            retry_count,
        )?;
        let drainer = Drainer::new(
            Arc::clone(&store),
            Arc::clone(&sender),
            cipher.clone(),
            Arc::clone(&pending),
            Arc::clone(&self.metrics),
            batch_size,
        );
        let writer = WriterThread::spawn(
            drainer,
            Arc::clone(&gate),
            self.config.delay(),
            self.config.shutdown_timeout(),
        )?;

        if pending.load(Ordering::Acquire) >= batch_size as u64 {
            gate.open();
        }

        Ok(DurablePipeline {
            store,
            cipher,
            store_writer,
            writer,
            sender,
            gate,
            pending,
        })
    }

    /// Hand an event to the relay
    ///
    /// In persistent mode this returns once the event is durably queued;
    /// delivery problems never surface here. In direct mode delivery
    /// failures are returned to the caller.
    pub fn send(&self, event: &Event) -> Result<()> {
        let pipeline = self.pipeline.read();
        match pipeline.as_ref() {
            Some(Pipeline::Durable(durable)) => self.send_durable(durable, event),
            Some(Pipeline::Direct(direct)) => self.send_direct(direct, event),
            None => Err(RelayError::ManagerStopped),
        }
    }

    fn send_durable(&self, durable: &DurablePipeline, event: &Event) -> Result<()> {
        let frame = codec::encode(event)?;
        let frame = match &durable.cipher {
            Some(cipher) => cipher.seal(&frame)?,
            None => frame,
        };
        durable.store_writer.put(event.key(), frame)?;
        self.metrics.record_accepted();
        Ok(())
    }

    fn send_direct(&self, direct: &DirectPipeline, event: &Event) -> Result<()> {
        if direct.batch_size == 1 {
            return self.deliver_direct(direct, std::slice::from_ref(event));
        }

        let ready = {
            let mut buffer = direct.buffer.lock();
            buffer.events.push(event.clone());
            let first_at = *buffer.first_at.get_or_insert_with(Instant::now);
            if buffer.events.len() >= direct.batch_size || first_at.elapsed() >= direct.delay {
                buffer.first_at = None;
                std::mem::take(&mut buffer.events)
            } else {
                Vec::new()
            }
        };
        if ready.is_empty() {
            self.metrics.record_accepted();
            return Ok(());
        }
        self.deliver_direct(direct, &ready)
    }

    fn deliver_direct(&self, direct: &DirectPipeline, events: &[Event]) -> Result<()> {
        match direct.sender.lock().send_batch(events) {
            Ok(()) => {
                // Earlier buffered events were counted when queued
                self.metrics.record_accepted();
                self.metrics.record_batch_sent(events.len());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_send_failure();
                Err(e)
            }
        }
    }

    /// Drain early: in persistent mode wake the writer, in direct mode
    /// send whatever is buffered
    pub fn flush(&self) -> Result<()> {
        let pipeline = self.pipeline.read();
        match pipeline.as_ref() {
            Some(Pipeline::Durable(durable)) => {
                durable.gate.open();
                Ok(())
            }
            Some(Pipeline::Direct(direct)) => self.flush_direct(direct),
            None => Ok(()),
        }
    }

    fn flush_direct(&self, direct: &DirectPipeline) -> Result<()> {
        let events = {
            let mut buffer = direct.buffer.lock();
            buffer.first_at = None;
            std::mem::take(&mut buffer.events)
        };
        if events.is_empty() {
            return Ok(());
        }
        match direct.sender.lock().send_batch(&events) {
            Ok(()) => {
                self.metrics.record_batch_sent(events.len());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_send_failure();
                Err(e)
            }
        }
    }

    /// Events accepted but not yet delivered
    ///
    /// Approximate in persistent mode while the writer is mid-cycle.
    pub fn pending_count(&self) -> u64 {
        match self.pipeline.read().as_ref() {
            Some(Pipeline::Durable(durable)) => durable.pending.load(Ordering::Acquire),
            Some(Pipeline::Direct(direct)) => direct.buffer.lock().events.len() as u64,
            None => 0,
        }
    }

    /// Shut the pipeline down
    ///
    /// The writer gets `timeout` to flush; the store and sender are closed
    /// whether or not it finished. Every resource is closed even if an
    /// earlier one fails; the failures are reported together.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        let Some(pipeline) = self.pipeline.write().take() else {
            return Ok(());
        };

        let mut failed = Vec::new();
        match pipeline {
            Pipeline::Durable(durable) => self.stop_durable(durable, timeout, &mut failed),
            Pipeline::Direct(direct) => {
                if let Err(e) = self.flush_direct(&direct) {
                    tracing::error!(error = %e, "Buffered events lost on shutdown");
                    failed.push("buffered events".to_string());
                }
                if let Err(e) = direct.sender.lock().close() {
                    tracing::warn!(error = %e, "Failed to close failover sender");
                    failed.push("failover sender".to_string());
                }
            }
        }

        tracing::debug!(relay = %self.config.name, "Relay stopped");
        if failed.is_empty() {
            Ok(())
        } else {
            Err(RelayError::ResourceClose { resources: failed })
        }
    }

    fn stop_durable(&self, mut durable: DurablePipeline, timeout: Duration, failed: &mut Vec<String>) {
        let start = Instant::now();

        // No producer holds the pipeline any more, so its queue is empty
        if !durable.store_writer.shutdown(timeout) {
            failed.push("store writer".to_string());
        }
        if !durable.writer.shutdown(timeout.saturating_sub(start.elapsed())) {
            tracing::warn!(timeout = ?timeout, "Writer thread did not finish, closing anyway");
            failed.push("writer thread".to_string());
        }

        if let Err(e) = durable.store.close() {
            tracing::warn!(error = %e, "Failed to close durable store");
            failed.push("durable store".to_string());
        }
        match durable.sender.try_lock_for(SENDER_CLOSE_WAIT) {
            Some(mut sender) => {
                if let Err(e) = sender.close() {
                    tracing::warn!(error = %e, "Failed to close failover sender");
                    failed.push("failover sender".to_string());
                }
            }
            None => {
                tracing::warn!("Failover sender busy, not closed");
                failed.push("failover sender".to_string());
            }
        }
    }
}

impl Drop for RelayManager {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop(self.config.shutdown_timeout()) {
                tracing::warn!(error = %e, "Relay did not shut down cleanly");
            }
        }
    }
}

/// Builder for [`RelayManager`]
///
/// # Example
///
/// ```
/// use rust_logger_relay::relay::{ForwardingMode, RelayManager};
/// use rust_logger_relay::relay::transport::MemoryConnector;
/// use std::sync::Arc;
///
/// let manager = RelayManager::builder()
///     .agent("collector", 4141)
///     .mode(ForwardingMode::Direct)
///     .connector(Arc::new(MemoryConnector::new()))
///     .build()
///     .unwrap();
/// assert!(!manager.is_running());
/// ```
pub struct RelayManagerBuilder {
    config: RelayConfig,
    connector: Option<Arc<dyn AgentConnector>>,
    key_registry: KeyProviderRegistry,
    metrics: Option<Arc<RelayMetrics>>,
}

impl RelayManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
            connector: None,
            key_registry: KeyProviderRegistry::with_builtins(),
            metrics: None,
        }
    }

    /// Replace the whole configuration
    #[must_use]
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Append an agent; earlier agents are preferred
    #[must_use]
    pub fn agent(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.agents.push(Agent::new(host, port));
        self
    }

    #[must_use]
    pub fn hosts(mut self, hosts: impl Into<String>) -> Self {
        self.config.hosts = Some(hosts.into());
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: ForwardingMode) -> Self {
        self.config.mode = mode;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.config.delay_millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self.config.in_memory = false;
        self
    }

    /// Keep the queue in memory; nothing survives a restart
    #[must_use]
    pub fn in_memory(mut self) -> Self {
        self.config.in_memory = true;
        self
    }

    #[must_use]
    pub fn lock_timeout_retry_count(mut self, count: u32) -> Self {
        self.config.lock_timeout_retry_count = count;
        self
    }

    /// Encrypt stored frames with the key from the named provider
    #[must_use]
    pub fn key_provider(mut self, name: impl Into<String>) -> Self {
        self.config.key_provider = Some(name.into());
        self
    }

    #[must_use]
    pub fn key_registry(mut self, registry: KeyProviderRegistry) -> Self {
        self.key_registry = registry;
        self
    }

    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn AgentConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Share an existing metrics instance
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn build(self) -> Result<RelayManager> {
        self.config.validate()?;
        let agents = self.config.resolved_agents()?;
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };

        Ok(RelayManager {
            config: self.config,
            agents,
            connector,
            key_registry: self.key_registry,
            metrics: self.metrics.unwrap_or_default(),
            pipeline: RwLock::new(None),
        })
    }
}

impl Default for RelayManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "tcp-transport")]
fn default_connector() -> Result<Arc<dyn AgentConnector>> {
    Ok(Arc::new(super::transport::TcpConnector::new()))
}

#[cfg(not(feature = "tcp-transport"))]
fn default_connector() -> Result<Arc<dyn AgentConnector>> {
    Err(RelayError::config(
        "RelayManager",
        "no connector supplied and the tcp-transport feature is disabled",
    ))
}
