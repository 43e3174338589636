//! In-process collector
//!
//! Records everything delivered to it and can be told to refuse
//! connections or fail sends, which makes delivery behaviour observable
//! without a network.

use super::{AgentConnector, CollectorClient, Timeouts};
use crate::core::{RelayError, Result};
use crate::relay::agent::Agent;
use crate::relay::event::Event;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// One accepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub agent: Agent,
    pub events: Vec<Event>,
}

impl Delivery {
    pub fn ids(&self) -> Vec<String> {
        self.events.iter().map(|e| e.id().to_string()).collect()
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    down: HashSet<Agent>,
    failing_sends: u32,
    connects: Vec<Agent>,
    deliveries: Vec<Delivery>,
    closes: usize,
}

/// Connector whose clients all feed one shared in-memory collector
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<CollectorState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) connections to `agent`
    pub fn set_available(&self, agent: &Agent, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.down.remove(agent);
        } else {
            state.down.insert(agent.clone());
        }
    }

    /// Make the next `count` sends fail with a delivery error
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().failing_sends = count;
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().deliveries.clone()
    }

    /// Ids of every batch delivered, in delivery order
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.state.lock().deliveries.iter().map(Delivery::ids).collect()
    }

    pub fn delivered_ids(&self) -> Vec<String> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.state
            .lock()
            .deliveries
            .iter()
            .map(|d| d.events.len())
            .sum()
    }

    /// Every connection attempt, successful or not
    pub fn connect_attempts(&self) -> Vec<Agent> {
        self.state.lock().connects.clone()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }
}

impl AgentConnector for MemoryConnector {
    fn connect(&self, agent: &Agent, _timeouts: &Timeouts) -> Result<Box<dyn CollectorClient>> {
        let mut state = self.state.lock();
        state.connects.push(agent.clone());
        if state.down.contains(agent) {
            return Err(RelayError::delivery(agent.address(), "connection refused"));
        }
        Ok(Box::new(MemoryClient {
            agent: agent.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryClient {
    agent: Agent,
    state: Arc<Mutex<CollectorState>>,
}

impl CollectorClient for MemoryClient {
    fn append(&mut self, event: &Event) -> Result<()> {
        self.append_batch(std::slice::from_ref(event))
    }

    fn append_batch(&mut self, events: &[Event]) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected send failure",
            )));
        }
        state.deliveries.push(Delivery {
            agent: self.agent.clone(),
            events: events.to_vec(),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().closes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_records_deliveries() {
        let connector = MemoryConnector::new();
        let agent = Agent::new("collector", 1);
        let mut client = connector.connect(&agent, &Timeouts::default()).unwrap();

        let event = Event::with_id("e1", BTreeMap::new(), Vec::new());
        client.append(&event).unwrap();
        assert_eq!(connector.batches(), vec![vec!["e1".to_string()]]);
        assert_eq!(connector.deliveries()[0].agent, agent);
    }

    #[test]
    fn test_injected_failures() {
        let connector = MemoryConnector::new();
        let agent = Agent::new("collector", 1);
        connector.set_available(&agent, false);
        assert!(connector.connect(&agent, &Timeouts::default()).is_err());

        connector.set_available(&agent, true);
        connector.fail_next_sends(1);
        let mut client = connector.connect(&agent, &Timeouts::default()).unwrap();
        let event = Event::with_id("e1", BTreeMap::new(), Vec::new());
        assert!(client.append(&event).is_err());
        client.append(&event).unwrap();
        assert_eq!(connector.delivered_count(), 1);
        assert_eq!(connector.connect_attempts().len(), 2);
    }
}
