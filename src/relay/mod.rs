//! Durable, at-least-once forwarding of events to collector agents
//!
//! Producers hand events to a [`RelayManager`]. In persistent mode each
//! event is encoded, optionally sealed, and committed to a [`DurableStore`]
//! before `send` returns; a single writer thread drains the store in
//! batches through a [`FailoverSender`] and deletes entries only once a
//! collector has accepted them.

pub mod agent;
pub mod cipher;
pub mod codec;
pub mod config;
pub mod event;
pub mod gate;
pub mod manager;
pub mod sender;
pub mod store;
pub mod store_worker;
pub mod transport;
pub mod writer;

pub use agent::Agent;
pub use cipher::{CipherGate, KeyProvider, KeyProviderRegistry, SecretKey};
pub use config::{ForwardingMode, RelayConfig};
pub use event::Event;
pub use gate::DrainGate;
pub use manager::{ManagerState, RelayManager, RelayManagerBuilder};
pub use sender::FailoverSender;
pub use store::{DurableStore, StoreLocation, StoreOptions};
pub use transport::{AgentConnector, CollectorClient, Timeouts};

use std::thread;
use std::time::{Duration, Instant};

/// Join a worker thread, giving up after `timeout`
///
/// Returns `false` if the thread panicked or is still running.
pub(crate) fn join_with_timeout(
    handle: thread::JoinHandle<()>,
    timeout: Duration,
    what: &str,
) -> bool {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            if let Err(e) = handle.join() {
                tracing::error!(worker = what, panic = ?e, "Worker thread panicked");
                return false;
            }
            return true;
        }

        if start.elapsed() >= timeout {
            tracing::warn!(worker = what, ?timeout, "Worker thread did not finish within timeout");
            return false;
        }

        thread::sleep(Duration::from_millis(10));
    }
}
