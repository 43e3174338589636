//! Relay appender: forwards log entries to collector agents
//!
//! Each entry becomes an [`Event`] whose headers carry the timestamp, a
//! unique id, the level, the thread and selected context fields, and whose
//! body is the rendered log line (gzip-compressed by default).

use crate::core::{Appender, LogEntry, RelayError, RelayMetrics, Result};
use crate::relay::event::{generate_id, Event, ID_HEADER, TIMESTAMP_HEADER};
use crate::relay::RelayManager;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

pub const LEVEL_HEADER: &str = "level";
pub const THREAD_HEADER: &str = "thread";

/// Records from loggers under this prefix are never forwarded
const OWN_LOGGER_PREFIX: &str = "rust_logger_relay";

/// Turns log entries into relay events
#[derive(Debug, Clone)]
pub struct EventFactory {
    event_prefix: String,
    mdc_prefix: String,
    mdc_includes: Vec<String>,
    mdc_excludes: Vec<String>,
    mdc_required: Vec<String>,
    compress_body: bool,
}

impl Default for EventFactory {
    fn default() -> Self {
        Self {
            event_prefix: String::new(),
            mdc_prefix: String::new(),
            mdc_includes: Vec::new(),
            mdc_excludes: Vec::new(),
            mdc_required: Vec::new(),
            compress_body: true,
        }
    }
}

impl EventFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the event for `entry`
    ///
    /// Fails with `MissingContext` if a required context key is absent.
    pub fn create(&self, entry: &LogEntry) -> Result<Event> {
        if let Some(key) = self
            .mdc_required
            .iter()
            .find(|key| !entry.context.contains_key(*key))
        {
            return Err(RelayError::missing_context(key.clone()));
        }

        let mut headers = BTreeMap::new();
        headers.insert(
            TIMESTAMP_HEADER.to_string(),
            entry.timestamp.timestamp_millis().to_string(),
        );
        headers.insert(LEVEL_HEADER.to_string(), entry.level.as_str().to_string());
        if let Some(thread) = &entry.thread_name {
            headers.insert(THREAD_HEADER.to_string(), thread.clone());
        }
        for (key, value) in &entry.data {
            headers.insert(format!("{}{}", self.event_prefix, key), value.clone());
        }
        for (key, value) in entry.context.iter().filter(|(key, _)| self.forwards(key)) {
            headers.insert(format!("{}{}", self.mdc_prefix, key), value.clone());
        }

        let body = self.body(entry.render().as_bytes())?;
        Ok(Event::with_id(generate_id(), headers, body))
    }

    /// Context filter: the include list wins over the exclude list
    fn forwards(&self, key: &str) -> bool {
        if !self.mdc_includes.is_empty() {
            self.mdc_includes.iter().any(|k| k == key)
        } else {
            !self.mdc_excludes.iter().any(|k| k == key)
        }
    }

    fn body(&self, rendered: &[u8]) -> Result<Vec<u8>> {
        if !self.compress_body || rendered.is_empty() {
            return Ok(rendered.to_vec());
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(rendered)?;
        Ok(encoder.finish()?)
    }
}

/// Appender handing entries to a [`RelayManager`]
///
/// # Example
///
/// ```no_run
/// use rust_logger_relay::appenders::RelayAppender;
/// use rust_logger_relay::prelude::*;
/// use std::sync::Arc;
///
/// let manager = RelayManager::builder()
///     .hosts("collector:4141")
///     .batch_size(50)
///     .build()
///     .expect("Invalid relay configuration");
/// let mut appender = RelayAppender::builder(Arc::new(manager))
///     .mdc_prefix("ctx.")
///     .build()
///     .expect("Failed to start relay");
///
/// appender
///     .append(&LogEntry::new(LogLevel::Info, "Order placed").with_context("orderId", "42"))
///     .expect("Failed to queue entry");
/// ```
pub struct RelayAppender {
    name: String,
    manager: Arc<RelayManager>,
    factory: EventFactory,
    ignore_exceptions: bool,
    metrics: Arc<RelayMetrics>,
}

impl RelayAppender {
    pub fn builder(manager: Arc<RelayManager>) -> RelayAppenderBuilder {
        RelayAppenderBuilder::new(manager)
    }

    pub fn manager(&self) -> &Arc<RelayManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    fn is_own_record(entry: &LogEntry) -> bool {
        entry
            .logger
            .as_deref()
            .is_some_and(|logger| logger.starts_with(OWN_LOGGER_PREFIX))
    }

    fn forward(&self, entry: &LogEntry) -> Result<()> {
        let event = self.factory.create(entry)?;
        self.manager.send(&event)
    }
}

impl Appender for RelayAppender {
    fn append(&mut self, entry: &LogEntry) -> Result<()> {
        if Self::is_own_record(entry) {
            return Ok(());
        }
        match self.forward(entry) {
            Ok(()) => Ok(()),
            Err(e) if self.ignore_exceptions => {
                self.metrics.record_ignored_error();
                tracing::warn!(appender = %self.name, error = %e, "Dropped log entry");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.manager.flush()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.manager.stop(timeout)
    }
}

/// Builder for [`RelayAppender`]
pub struct RelayAppenderBuilder {
    manager: Arc<RelayManager>,
    name: Option<String>,
    factory: EventFactory,
    ignore_exceptions: bool,
}

impl RelayAppenderBuilder {
    pub fn new(manager: Arc<RelayManager>) -> Self {
        Self {
            manager,
            name: None,
            factory: EventFactory::default(),
            ignore_exceptions: true,
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Prefix for headers taken from the entry's data fields
    #[must_use]
    pub fn event_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.factory.event_prefix = prefix.into();
        self
    }

    /// Prefix for headers taken from the entry's context
    #[must_use]
    pub fn mdc_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.factory.mdc_prefix = prefix.into();
        self
    }

    /// Forward only these context keys (comma separated)
    #[must_use]
    pub fn mdc_includes(mut self, keys: &str) -> Self {
        self.factory.mdc_includes = split_keys(keys);
        self
    }

    /// Forward every context key except these (comma separated)
    ///
    /// Ignored when an include list is set.
    #[must_use]
    pub fn mdc_excludes(mut self, keys: &str) -> Self {
        self.factory.mdc_excludes = split_keys(keys);
        self
    }

    /// Context keys every entry must carry (comma separated)
    #[must_use]
    pub fn mdc_required(mut self, keys: &str) -> Self {
        self.factory.mdc_required = split_keys(keys);
        self
    }

    #[must_use]
    pub fn compress_body(mut self, compress: bool) -> Self {
        self.factory.compress_body = compress;
        self
    }

    /// Swallow (and count) append failures instead of returning them
    ///
    /// Default: enabled
    #[must_use]
    pub fn ignore_exceptions(mut self, ignore: bool) -> Self {
        self.ignore_exceptions = ignore;
        self
    }

    /// Start the manager if needed and build the appender
    pub fn build(self) -> Result<RelayAppender> {
        self.manager.start()?;
        let metrics = Arc::clone(self.manager.metrics());
        Ok(RelayAppender {
            name: self
                .name
                .unwrap_or_else(|| self.manager.name().to_string()),
            manager: self.manager,
            factory: self.factory,
            ignore_exceptions: self.ignore_exceptions,
            metrics,
        })
    }
}

fn split_keys(keys: &str) -> Vec<String> {
    keys.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LogLevel;
    use crate::relay::transport::MemoryConnector;
    use crate::relay::ForwardingMode;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn entry() -> LogEntry {
        LogEntry::new(LogLevel::Warn, "disk almost full")
            .with_context("requestId", "r-1")
            .with_context("user", "alice")
            .with_data("volume", "/var")
    }

    #[test]
    fn test_event_headers() {
        let factory = EventFactory {
            event_prefix: "ev.".to_string(),
            mdc_prefix: "mdc.".to_string(),
            compress_body: false,
            ..EventFactory::default()
        };
        let entry = entry();
        let event = factory.create(&entry).unwrap();

        assert!(!event.id().is_empty());
        assert_eq!(event.header(ID_HEADER), Some(event.id()));
        assert_eq!(
            event.header(TIMESTAMP_HEADER),
            Some(entry.timestamp.timestamp_millis().to_string().as_str())
        );
        assert_eq!(event.header(LEVEL_HEADER), Some("WARN"));
        assert_eq!(event.header("ev.volume"), Some("/var"));
        assert_eq!(event.header("mdc.requestId"), Some("r-1"));
        assert_eq!(event.header("mdc.user"), Some("alice"));
        assert_eq!(event.body(), entry.render().as_bytes());
    }

    #[test]
    fn test_context_include_wins_over_exclude() {
        let factory = EventFactory {
            mdc_includes: vec!["requestId".to_string()],
            mdc_excludes: vec!["requestId".to_string()],
            ..EventFactory::default()
        };
        let event = factory.create(&entry()).unwrap();
        assert_eq!(event.header("requestId"), Some("r-1"));
        assert_eq!(event.header("user"), None);
    }

    #[test]
    fn test_context_exclude() {
        let factory = EventFactory {
            mdc_excludes: split_keys("user, other"),
            ..EventFactory::default()
        };
        let event = factory.create(&entry()).unwrap();
        assert_eq!(event.header("requestId"), Some("r-1"));
        assert_eq!(event.header("user"), None);
    }

    #[test]
    fn test_required_context() {
        let factory = EventFactory {
            mdc_required: split_keys("requestId,tenant"),
            ..EventFactory::default()
        };
        match factory.create(&entry()) {
            Err(RelayError::MissingContext { key }) => assert_eq!(key, "tenant"),
            other => panic!("expected missing context, got {:?}", other),
        }
    }

    #[test]
    fn test_body_compressed() {
        let entry = entry();
        let event = EventFactory::new().create(&entry).unwrap();

        let mut decoded = String::new();
        GzDecoder::new(event.body())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, entry.render());
    }

    fn direct_manager(connector: &MemoryConnector) -> Arc<RelayManager> {
        Arc::new(
            RelayManager::builder()
                .name("audit")
                .connector(Arc::new(connector.clone()))
                .mode(ForwardingMode::Direct)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_append_forwards_and_skips_own_records() {
        let connector = MemoryConnector::new();
        let mut appender = RelayAppender::builder(direct_manager(&connector))
            .build()
            .unwrap();
        assert_eq!(appender.name(), "audit");

        appender.append(&entry()).unwrap();
        appender
            .append(&entry().with_logger("rust_logger_relay::relay::writer"))
            .unwrap();
        assert_eq!(connector.delivered_count(), 1);
        appender.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_ignore_exceptions() {
        let connector = MemoryConnector::new();
        let manager = direct_manager(&connector);
        let mut appender = RelayAppender::builder(Arc::clone(&manager))
            .mdc_required("tenant")
            .build()
            .unwrap();
        appender.append(&entry()).unwrap();
        assert_eq!(appender.metrics().ignored_errors(), 1);

        let mut strict = RelayAppender::builder(manager)
            .mdc_required("tenant")
            .ignore_exceptions(false)
            .build()
            .unwrap();
        assert!(matches!(
            strict.append(&entry()),
            Err(RelayError::MissingContext { .. })
        ));
    }
}
