//! Core types shared by the relay and its appender

pub mod appender;
pub mod error;
pub mod log_entry;
pub mod metrics;

pub use appender::Appender;
pub use error::{RelayError, Result};
pub use log_entry::{LogEntry, LogLevel};
pub use metrics::RelayMetrics;
