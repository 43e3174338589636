//! Relay metrics for observability
//!
//! Counters for monitoring the health of the forwarding queue: how many
//! events were accepted, how many reached a collector, and how often the
//! store or the transport pushed back.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for relay observability
///
/// # Example
///
/// ```
/// use rust_logger_relay::RelayMetrics;
///
/// let metrics = RelayMetrics::new();
/// metrics.record_accepted();
/// metrics.record_batch_sent(1);
///
/// assert_eq!(metrics.accepted(), 1);
/// assert_eq!(metrics.delivered(), 1);
/// assert_eq!(metrics.in_flight(), 0);
/// ```
#[derive(Debug)]
pub struct RelayMetrics {
    /// Events accepted by `send` (durably queued or directly sent)
    accepted: AtomicU64,

    /// Events confirmed delivered to a collector
    delivered: AtomicU64,

    /// Batches confirmed delivered
    batches_sent: AtomicU64,

    /// Failed send attempts (single or batch)
    send_failures: AtomicU64,

    /// Store operations that hit a lock conflict and were retried
    contention_retries: AtomicU64,

    /// Frames moved aside because they could not be read back
    quarantined: AtomicU64,

    /// Appends swallowed because the appender ignores exceptions
    ignored_errors: AtomicU64,
}

impl RelayMetrics {
    /// Create a new metrics instance with all counters at zero
    pub const fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            contention_retries: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            ignored_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn batches_sent(&self) -> u64 {
        self.batches_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn contention_retries(&self) -> u64 {
        self.contention_retries.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn quarantined(&self) -> u64 {
        self.quarantined.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ignored_errors(&self) -> u64 {
        self.ignored_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_accepted(&self) -> u64 {
        self.accepted.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a confirmed delivery of `events` events
    #[inline]
    pub fn record_batch_sent(&self, events: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(events as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_send_failure(&self) -> u64 {
        self.send_failures.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_contention_retry(&self) -> u64 {
        self.contention_retries.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_quarantined(&self, frames: usize) {
        self.quarantined.fetch_add(frames as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ignored_error(&self) -> u64 {
        self.ignored_errors.fetch_add(1, Ordering::Relaxed)
    }

    /// Events accepted but not yet confirmed delivered
    ///
    /// Duplicate deliveries after a failed delete can push `delivered`
    /// past `accepted`; the result saturates at zero.
    pub fn in_flight(&self) -> u64 {
        self.accepted().saturating_sub(self.delivered())
    }

    pub fn reset(&self) {
        for counter in [
            &self.accepted,
            &self.delivered,
            &self.batches_sent,
            &self.send_failures,
            &self.contention_retries,
            &self.quarantined,
            &self.ignored_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for RelayMetrics {
    /// Create a snapshot of the current metrics values
    fn clone(&self) -> Self {
        Self {
            accepted: AtomicU64::new(self.accepted()),
            delivered: AtomicU64::new(self.delivered()),
            batches_sent: AtomicU64::new(self.batches_sent()),
            send_failures: AtomicU64::new(self.send_failures()),
            contention_retries: AtomicU64::new(self.contention_retries()),
            quarantined: AtomicU64::new(self.quarantined()),
            ignored_errors: AtomicU64::new(self.ignored_errors()),
        }
    }
}
