//! # Rust Logger Relay
//!
//! Durable, at-least-once forwarding of log events to remote collector
//! agents.
//!
//! ## Features
//!
//! - **Durable**: events are committed to an embedded SQLite queue before
//!   `send` returns and survive restarts
//! - **Failover**: collectors are tried in priority order, reconnecting lazily
//! - **Batched**: a single writer thread drains the queue in batches and
//!   deletes entries only after a collector accepted them
//! - **Encrypted at rest**: optional AES-256-GCM sealing of stored frames
//!
//! ## Example
//!
//! ```no_run
//! use rust_logger_relay::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let manager = Arc::new(
//!     RelayManager::builder()
//!         .hosts("collector-a:4141,collector-b:4141")
//!         .batch_size(100)
//!         .delay(Duration::from_secs(5))
//!         .build()
//!         .expect("Invalid relay configuration"),
//! );
//! let mut appender = RelayAppender::builder(Arc::clone(&manager))
//!     .build()
//!     .expect("Failed to start relay");
//!
//! appender
//!     .append(&LogEntry::new(LogLevel::Info, "Service started"))
//!     .expect("Failed to queue entry");
//! appender.stop(Duration::from_secs(30)).expect("Unclean shutdown");
//! ```

pub mod appenders;
pub mod core;
pub mod relay;

pub mod prelude {
    pub use crate::appenders::{EventFactory, RelayAppender, RelayAppenderBuilder};
    pub use crate::core::{Appender, LogEntry, LogLevel, RelayError, RelayMetrics, Result};
    pub use crate::relay::{
        Agent, Event, ForwardingMode, KeyProviderRegistry, RelayConfig, RelayManager,
        RelayManagerBuilder, SecretKey,
    };
}

pub use appenders::RelayAppender;
pub use core::{Appender, LogEntry, LogLevel, RelayError, RelayMetrics, Result};
pub use relay::{Event, RelayConfig, RelayManager};
