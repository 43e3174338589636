//! Collector agent addresses

use crate::core::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 35853;

/// A collector endpoint; position in a list expresses failover priority
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Agent {
    pub host: String,
    pub port: u16,
}

impl Agent {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse a comma separated `host[:port]` list, preserving order
    ///
    /// A missing port means [`DEFAULT_PORT`].
    pub fn parse_list(hosts: &str) -> Result<Vec<Agent>> {
        hosts
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }

    /// Render agents as `host:port,host:port`
    pub fn describe(agents: &[Agent]) -> String {
        agents
            .iter()
            .map(Agent::address)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Agent {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| RelayError::config("Agent", format!("invalid port in '{}'", s)))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };
        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        if port == 0 {
            return Err(RelayError::config("Agent", format!("port 0 in '{}'", s)));
        }
        Ok(Agent::new(host, port))
    }
}
