use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::RwLock;

lazy_static! {
    pub static ref METRICS: InternalMetrics = InternalMetrics::default();
}

/* WARNINGS */

/// An outgoing packet could not be handed to the send task.
pub const SEND_FAIL: &str = "send_fail";

/// The unsolicited-key lookup queue was full and a key was dropped.
pub const UNSOLICITED_LOOKUP_DROPPED: &str = "unsolicited_lookup_dropped";

/// The continuous-timeout counter crossed the NTP failure threshold.
pub const CLOCK_DRIFT_SUSPECTED: &str = "clock_drift_suspected";

/* EVICTIONS */

/// A node was evicted from the unsolicited-node cache to make room.
pub const UNSOLICITED_CACHE_EVICTION: &str = "unsolicited_cache_eviction";

/// A key was evicted from the unknown-keys cache to make room.
pub const UNKNOWN_KEYS_EVICTION: &str = "unknown_keys_eviction";

/// Counters for warnings and cache churn that occur throughout the course of
/// server operation, keyed by a static name.
#[derive(Debug, Default)]
pub struct EventMetrics {
    /// Total number of counted events.
    pub total: AtomicUsize,
    /// Individual events that have occurred, with their associated counts.
    pub events: RwLock<HashMap<&'static str, AtomicUsize>>,
}

impl EventMetrics {
    pub fn increment(&self, event: &'static str) {
        self.total.fetch_add(1, Ordering::Relaxed);

        {
            let lock = self.events.read();
            if let Some(count) = lock.get(event) {
                count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.events
            .write()
            .entry(event)
            .or_insert_with(|| 0.into())
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn as_raw(&self) -> HashMap<&'static str, usize> {
        self.events
            .read()
            .iter()
            .map(|(k, v)| (*k, v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// A collection of metrics used throughout the server.
pub struct InternalMetrics {
    /// The number of reply matchers currently awaiting a response.
    pub pending_requests: AtomicUsize,
    /// The number of bytes sent.
    pub bytes_sent: AtomicUsize,
    /// The number of bytes received.
    pub bytes_recv: AtomicUsize,
    /// Counted warnings and cache evictions.
    pub events: EventMetrics,
}

impl Default for InternalMetrics {
    fn default() -> Self {
        InternalMetrics {
            pending_requests: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            bytes_recv: AtomicUsize::new(0),
            events: EventMetrics::default(),
        }
    }
}

impl InternalMetrics {
    pub fn add_recv_bytes(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_sent_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn event(&self, event: &'static str) {
        self.events.increment(event);
    }
}

/// The publicly accessible metrics that can be obtained from the discovery
/// server.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// The number of reply matchers currently awaiting a response.
    pub pending_requests: usize,
    /// The number of bytes sent.
    pub bytes_sent: usize,
    /// The number of bytes received.
    pub bytes_recv: usize,
    /// Counts of warnings and cache evictions, keyed by event name.
    pub events: HashMap<&'static str, usize>,
}

impl From<&METRICS> for Metrics {
    fn from(internal_metrics: &METRICS) -> Self {
        Metrics {
            pending_requests: internal_metrics.pending_requests.load(Ordering::Relaxed),
            bytes_sent: internal_metrics.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: internal_metrics.bytes_recv.load(Ordering::Relaxed),
            events: internal_metrics.events.as_raw(),
        }
    }
}
