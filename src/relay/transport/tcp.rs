//! TCP collector client
//!
//! Each request is a batch: a big-endian `u32` event count followed by one
//! `[u32 length][frame]` record per event, frames in the relay's persisted
//! frame format. The collector answers with a single status byte,
//! [`ACK_OK`] on acceptance.

use super::{AgentConnector, CollectorClient, Timeouts};
use crate::core::{RelayError, Result};
use crate::relay::agent::Agent;
use crate::relay::codec;
use crate::relay::event::Event;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Status byte for an accepted request
pub const ACK_OK: u8 = 0;

/// Timeout used when none (or one below the floor) is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Connector producing [`TcpCollectorClient`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl AgentConnector for TcpConnector {
    fn connect(&self, agent: &Agent, timeouts: &Timeouts) -> Result<Box<dyn CollectorClient>> {
        Ok(Box::new(TcpCollectorClient::connect(agent, timeouts)?))
    }
}

pub struct TcpCollectorClient {
    stream: Option<TcpStream>,
    address: String,
}

impl TcpCollectorClient {
    pub fn connect(agent: &Agent, timeouts: &Timeouts) -> Result<Self> {
        let address = agent.address();
        let connect_timeout = timeouts.connect_or(DEFAULT_TIMEOUT);
        let request_timeout = timeouts.request_or(DEFAULT_TIMEOUT);

        let mut last_error = None;
        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_write_timeout(Some(request_timeout))?;
                    stream.set_read_timeout(Some(request_timeout))?;
                    stream.set_nodelay(true)?;
                    tracing::debug!(agent = %address, "Connected to collector");
                    return Ok(Self {
                        stream: Some(stream),
                        address,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => RelayError::delivery(address, e.to_string()),
            None => RelayError::delivery(address, "address did not resolve"),
        })
    }

    fn exchange(&mut self, events: &[Event]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RelayError::delivery(self.address.clone(), "connection closed"))?;

        let request = encode_request(events)?;
        stream.write_all(&request)?;
        stream.flush()?;

        let mut status = [0u8; 1];
        stream.read_exact(&mut status)?;
        if status[0] != ACK_OK {
            return Err(RelayError::delivery(
                self.address.clone(),
                format!("collector rejected batch with status {}", status[0]),
            ));
        }
        Ok(())
    }
}

impl CollectorClient for TcpCollectorClient {
    fn append(&mut self, event: &Event) -> Result<()> {
        self.exchange(std::slice::from_ref(event))
    }

    fn append_batch(&mut self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.exchange(events)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            match stream.shutdown(Shutdown::Both) {
                Ok(()) => {}
                // Peer already gone
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for TcpCollectorClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Encode `events` as one request
pub fn encode_request(events: &[Event]) -> Result<Vec<u8>> {
    let count = u32::try_from(events.len())
        .map_err(|_| RelayError::codec("too many events in one request"))?;
    let mut request = Vec::new();
    request.extend_from_slice(&count.to_be_bytes());
    for event in events {
        let frame = codec::encode(event)?;
        let len = u32::try_from(frame.len())
            .map_err(|_| RelayError::codec("frame too large for request"))?;
        request.extend_from_slice(&len.to_be_bytes());
        request.extend_from_slice(&frame);
    }
    Ok(request)
}

/// Read one request from `reader`; the collector side of the exchange
///
/// Returns `Ok(None)` on a clean end of stream before a new request.
pub fn read_request(reader: &mut impl Read) -> Result<Option<Vec<Event>>> {
    let mut word = [0u8; 4];
    match reader.read_exact(&mut word) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let count = u32::from_be_bytes(word);

    let mut events = Vec::new();
    for _ in 0..count {
        reader.read_exact(&mut word)?;
        let mut frame = vec![0u8; u32::from_be_bytes(word) as usize];
        reader.read_exact(&mut frame)?;
        events.push(codec::decode(&frame)?);
    }
    Ok(Some(events))
}
