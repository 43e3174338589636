//! Failover sender: one lazily opened connection over a prioritized agent list

use super::agent::Agent;
use super::event::Event;
use super::transport::{AgentConnector, CollectorClient, Timeouts};
use crate::core::{RelayError, Result};
use std::sync::Arc;

/// Upper bound on connection passes over the agent list
pub const MAX_RECONNECTS: u32 = 3;

struct ActiveClient {
    agent: usize,
    client: Box<dyn CollectorClient>,
}

/// Sends events to the first reachable agent, in list order
///
/// The connection is cached until a send fails, at which point it is
/// closed and the next call reconnects starting again from the preferred
/// agent.
pub struct FailoverSender {
    agents: Vec<Agent>,
    connector: Arc<dyn AgentConnector>,
    timeouts: Timeouts,
    retries: u32,
    active: Option<ActiveClient>,
}

impl FailoverSender {
    /// `retries` is the number of passes over the agent list per connect,
    /// clamped to `1..=MAX_RECONNECTS`
    pub fn new(
        agents: Vec<Agent>,
        connector: Arc<dyn AgentConnector>,
        timeouts: Timeouts,
        retries: u32,
    ) -> Result<Self> {
        if agents.is_empty() {
            return Err(RelayError::config("FailoverSender", "no agents configured"));
        }
        Ok(Self {
            agents,
            connector,
            timeouts,
            retries: retries.clamp(1, MAX_RECONNECTS),
            active: None,
        })
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agents_description(&self) -> String {
        Agent::describe(&self.agents)
    }

    /// Total connection attempts one `connect` may make
    pub fn max_attempts(&self) -> usize {
        self.retries as usize * self.agents.len()
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    /// The agent currently connected, if any
    pub fn connected_agent(&self) -> Option<&Agent> {
        self.active.as_ref().map(|active| &self.agents[active.agent])
    }

    /// Ensure a connection exists, trying agents in priority order
    ///
    /// Returns `false` when every attempt failed.
    pub fn connect(&mut self) -> bool {
        if self.active.is_some() {
            return true;
        }

        for pass in 1..=self.retries {
            for (index, agent) in self.agents.iter().enumerate() {
                match self.connector.connect(agent, &self.timeouts) {
                    Ok(client) => {
                        tracing::debug!(%agent, pass, "Connected to collector agent");
                        self.active = Some(ActiveClient {
                            agent: index,
                            client,
                        });
                        return true;
                    }
                    Err(e) => {
                        tracing::debug!(%agent, pass, error = %e, "Collector agent unreachable");
                    }
                }
            }
        }

        tracing::warn!(
            agents = %self.agents_description(),
            attempts = self.max_attempts(),
            "No collector agent reachable"
        );
        false
    }

    pub fn send(&mut self, event: &Event) -> Result<()> {
        self.deliver(|client| client.append(event))
    }

    /// Send the batch as one request; an empty batch is a no-op
    pub fn send_batch(&mut self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.deliver(|client| client.append_batch(events))
    }

    fn deliver<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CollectorClient) -> Result<()>,
    {
        if !self.connect() {
            return Err(RelayError::agents_unavailable(self.agents_description()));
        }
        let Some(active) = self.active.as_mut() else {
            return Err(RelayError::agents_unavailable(self.agents_description()));
        };

        match op(active.client.as_mut()) {
            Ok(()) => Ok(()),
            Err(e) => {
                let agent = self.agents[active.agent].address();
                tracing::warn!(%agent, error = %e, "Send failed, dropping connection");
                self.disconnect();
                Err(match e {
                    RelayError::DeliveryFailure { .. } => e,
                    other => RelayError::delivery(agent, other.to_string()),
                })
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.client.close() {
                tracing::debug!(error = %e, "Error closing failed collector connection");
            }
        }
    }

    /// Close the current connection, if any
    pub fn close(&mut self) -> Result<()> {
        match self.active.take() {
            Some(mut active) => active.client.close(),
            None => Ok(()),
        }
    }
}

impl Drop for FailoverSender {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
