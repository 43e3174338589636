//! Binary signal used to wake the writer thread before its deadline

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Open/close flag with timed waiting
///
/// Producers `open` the gate when enough events are pending; the writer
/// `close`s it right after waking so a later `open` is never lost.
#[derive(Debug, Default)]
pub struct DrainGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl DrainGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.cond.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock() = false;
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Block until the gate is open or `timeout` elapses
    ///
    /// Returns `true` if the gate was open on return.
    pub fn wait_for_open(&self, timeout: Duration) -> bool {
        let mut open = self.open.lock();
        if !*open {
            self.cond.wait_while_for(&mut open, |open| !*open, timeout);
        }
        *open
    }
}
