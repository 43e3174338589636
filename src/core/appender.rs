//! Appender trait for log output destinations

use super::{error::Result, log_entry::LogEntry};
use std::time::Duration;

pub trait Appender: Send + Sync {
    fn append(&mut self, entry: &LogEntry) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn name(&self) -> &str;

    /// Release the destination's resources, waiting at most `timeout`
    fn stop(&mut self, _timeout: Duration) -> Result<()> {
        self.flush()
    }
}
