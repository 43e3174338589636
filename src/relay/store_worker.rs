//! Dedicated worker running producer writes against the durable store
//!
//! Producers never run a store transaction on their own thread. They hand
//! the write to this worker and block on its reply; giving up on the reply
//! only abandons the wait, never the transaction.

use super::gate::DrainGate;
use super::join_with_timeout;
use super::store::DurableStore;
use crate::core::{RelayError, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const REQUEST_QUEUE_CAPACITY: usize = 1024;

struct WriteRequest {
    key: Vec<u8>,
    frame: Vec<u8>,
    reply: Sender<Result<()>>,
}

pub struct StoreWriter {
    requests: Option<Sender<WriteRequest>>,
    handle: Option<thread::JoinHandle<()>>,
    wait_timeout: Duration,
    retry_count: u32,
}

impl StoreWriter {
    /// Start the worker
    ///
    /// After each committed put the shared pending counter is bumped and
    /// the gate opened once it reaches `batch_size`.
    pub fn spawn(
        store: Arc<DurableStore>,
        gate: Arc<DrainGate>,
        pending: Arc<AtomicU64>,
        batch_size: u64,
        wait_timeout: Duration,
        retry_count: u32,
    ) -> Result<Self> {
        let (sender, receiver) = bounded::<WriteRequest>(REQUEST_QUEUE_CAPACITY);

        let handle = thread::Builder::new()
            .name("relay-store-writer".to_string())
            .spawn(move || {
                for request in receiver.iter() {
                    let result = store.put(&request.key, &request.frame);
                    if result.is_ok() && pending.fetch_add(1, Ordering::AcqRel) + 1 >= batch_size {
                        gate.open();
                    }
                    if request.reply.send(result).is_err() {
                        tracing::debug!("Producer stopped waiting before its write completed");
                    }
                }
                tracing::trace!("Store writer exiting");
            })?;

        Ok(Self {
            requests: Some(sender),
            handle: Some(handle),
            wait_timeout,
            retry_count,
        })
    }

    /// Durably write `frame` under `key`, blocking until it commits
    ///
    /// A wait that runs past `wait_timeout` is retried once; after that the
    /// caller gets `StoreContention` while the write itself may still land.
    pub fn put(&self, key: Vec<u8>, frame: Vec<u8>) -> Result<()> {
        let requests = self.requests.as_ref().ok_or(RelayError::WorkerUnavailable)?;
        let (reply, response) = bounded(1);
        requests
            .send(WriteRequest { key, frame, reply })
            .map_err(|_| RelayError::WorkerUnavailable)?;

        for wait in 1..=2 {
            match response.recv_timeout(self.wait_timeout) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(wait, timeout = ?self.wait_timeout, "Durable write still pending");
                }
                Err(RecvTimeoutError::Disconnected) => return Err(RelayError::WorkerUnavailable),
            }
        }
        Err(RelayError::contention(self.retry_count))
    }

    /// Stop accepting writes and wait for queued ones to finish
    ///
    /// Returns `false` if the worker did not exit within `timeout`.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        drop(self.requests.take());
        match self.handle.take() {
            Some(handle) => join_with_timeout(handle, timeout, "store writer"),
            None => true,
        }
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown(Duration::from_secs(5));
        }
    }
}
