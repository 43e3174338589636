//! Collector RPC seam
//!
//! The relay talks to collectors only through [`AgentConnector`] and the
//! [`CollectorClient`] it produces. A TCP reference client is provided
//! behind the `tcp-transport` feature, and [`memory`] offers an
//! in-process collector.

pub mod memory;
#[cfg(feature = "tcp-transport")]
pub mod tcp;

use super::agent::Agent;
use super::event::Event;
use crate::core::Result;
use std::time::Duration;

pub use memory::MemoryConnector;
#[cfg(feature = "tcp-transport")]
pub use tcp::TcpConnector;

/// Smallest timeout honoured; shorter configured values fall back to the
/// transport default
pub const MINIMUM_TIMEOUT: Duration = Duration::from_millis(1000);

/// Connect and request timeouts handed to a connector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub request: Option<Duration>,
}

impl Timeouts {
    /// Build from millisecond settings, dropping values under the floor
    pub fn from_millis(connect_millis: u64, request_millis: u64) -> Self {
        Self {
            connect: floor(connect_millis),
            request: floor(request_millis),
        }
    }

    pub fn connect_or(&self, default: Duration) -> Duration {
        self.connect.unwrap_or(default)
    }

    pub fn request_or(&self, default: Duration) -> Duration {
        self.request.unwrap_or(default)
    }
}

fn floor(millis: u64) -> Option<Duration> {
    let timeout = Duration::from_millis(millis);
    if timeout < MINIMUM_TIMEOUT {
        if millis > 0 {
            tracing::debug!(millis, "Ignoring timeout below the minimum");
        }
        None
    } else {
        Some(timeout)
    }
}

/// A live connection to one collector
pub trait CollectorClient: Send {
    /// Deliver one event; returns once the collector acknowledged it
    fn append(&mut self, event: &Event) -> Result<()>;

    /// Deliver a batch; all or nothing from the caller's point of view
    fn append_batch(&mut self, events: &[Event]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Opens connections to collector agents
pub trait AgentConnector: Send + Sync {
    fn connect(&self, agent: &Agent, timeouts: &Timeouts) -> Result<Box<dyn CollectorClient>>;
}
