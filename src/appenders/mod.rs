//! Appender implementations

pub mod relay;

pub use relay::{EventFactory, RelayAppender, RelayAppenderBuilder};

pub use crate::core::Appender;
