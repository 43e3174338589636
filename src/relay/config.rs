//! Relay configuration
//!
//! Every field has a default, so a JSON document only needs to name what it
//! changes:
//!
//! ```
//! use rust_logger_relay::relay::{ForwardingMode, RelayConfig};
//!
//! let config = RelayConfig::from_json_str(
//!     r#"{ "hosts": "collector-a:4141,collector-b:4141", "batch_size": 100 }"#,
//! ).unwrap();
//!
//! assert_eq!(config.mode, ForwardingMode::Persistent);
//! assert_eq!(config.resolved_agents().unwrap().len(), 2);
//! ```

use super::agent::Agent;
use super::store::{StoreLocation, StoreOptions};
use super::transport::Timeouts;
use crate::core::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 1;
pub const DEFAULT_DELAY_MILLIS: u64 = 60_000;
pub const DEFAULT_LOCK_TIMEOUT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MILLIS: u64 = 60_000;
pub const DEFAULT_DATA_DIR: &str = ".relay/data";

/// How accepted events reach the collectors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingMode {
    /// Commit to the durable store, deliver from the writer thread
    #[default]
    Persistent,
    /// Send from the producer thread, buffering in memory when batching
    Direct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub name: String,
    pub agents: Vec<Agent>,
    /// Comma separated `host[:port]` list, appended after `agents`
    pub hosts: Option<String>,
    pub mode: ForwardingMode,
    pub batch_size: usize,
    /// Longest an incomplete batch waits before being drained
    pub delay_millis: u64,
    /// Passes over the agent list per connection attempt
    pub retries: u32,
    pub connect_timeout_millis: u64,
    pub request_timeout_millis: u64,
    pub lock_timeout_retry_count: u32,
    pub data_dir: PathBuf,
    pub in_memory: bool,
    /// Registered key provider enabling encryption at rest
    pub key_provider: Option<String>,
    pub shutdown_timeout_millis: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "relay".to_string(),
            agents: Vec::new(),
            hosts: None,
            mode: ForwardingMode::Persistent,
            batch_size: DEFAULT_BATCH_SIZE,
            delay_millis: DEFAULT_DELAY_MILLIS,
            retries: 0,
            connect_timeout_millis: 0,
            request_timeout_millis: 0,
            lock_timeout_retry_count: DEFAULT_LOCK_TIMEOUT_RETRY_COUNT,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            in_memory: false,
            key_provider: None,
            shutdown_timeout_millis: DEFAULT_SHUTDOWN_TIMEOUT_MILLIS,
        }
    }
}

impl RelayConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Agents in priority order: `agents` first, then `hosts`
    ///
    /// With neither configured the single default agent is used.
    pub fn resolved_agents(&self) -> Result<Vec<Agent>> {
        let mut agents = self.agents.clone();
        if let Some(hosts) = &self.hosts {
            agents.extend(Agent::parse_list(hosts)?);
        }
        if agents.is_empty() {
            agents.push(Agent::default());
        }
        Ok(agents)
    }

    /// Batch size with zero treated as one
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_millis)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from_millis(self.connect_timeout_millis, self.request_timeout_millis)
    }

    pub fn store_options(&self) -> StoreOptions {
        let location = if self.in_memory {
            StoreLocation::InMemory
        } else {
            StoreLocation::Directory(self.data_dir.clone())
        };
        let mut options = StoreOptions::new(location);
        options.lock_timeout_retry_count = self.lock_timeout_retry_count;
        options
    }

    /// Whether producers send directly without touching the store
    pub fn is_direct(&self) -> bool {
        self.mode == ForwardingMode::Direct
    }

    pub fn validate(&self) -> Result<()> {
        for agent in self.resolved_agents()? {
            if agent.host.trim().is_empty() {
                return Err(RelayError::config("RelayConfig", "agent with empty host"));
            }
            if agent.port == 0 {
                return Err(RelayError::config(
                    "RelayConfig",
                    format!("agent {} has port 0", agent.host),
                ));
            }
        }
        if self.lock_timeout_retry_count == 0 {
            return Err(RelayError::config(
                "RelayConfig",
                "lock_timeout_retry_count must be at least 1",
            ));
        }
        if !self.is_direct() && !self.in_memory && self.data_dir.as_os_str().is_empty() {
            return Err(RelayError::config("RelayConfig", "data_dir is empty"));
        }
        Ok(())
    }
}
