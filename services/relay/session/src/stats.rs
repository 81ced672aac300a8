//! Process-wide connection and exchange counters.
//!
//! Counters are purely observational: nothing reads them to make a decision.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters shared by the driver, coordinator and sweeper
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connections_opened: AtomicU64,
    disconnections: AtomicU64,
    requests: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
    stale_swept: AtomicU64,
    malformed_dropped: AtomicU64,
    /// Last probe RTT in microseconds, 0 when unmeasured
    last_rtt_micros: AtomicU64,
    /// Gauges mirrored from the driver; not cleared by `reset`
    epoch: AtomicU64,
    reconnect_attempts: AtomicU32,
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Transports that reached the open state
    pub connects: u64,
    /// Open transports that were lost or closed
    pub disconnects: u64,
    /// Request envelopes handed to the transport
    pub requests: u64,
    /// Resubmissions after a timeout
    pub retries: u64,
    /// Submissions that ended in an error
    pub errors: u64,
    /// Entries failed by the stale sweeper
    pub stale_swept: u64,
    /// Inbound frames dropped as unparseable
    pub malformed_dropped: u64,
    /// Exchanges currently awaiting a reply
    pub in_flight: usize,
    /// Most recent liveness probe round trip in milliseconds
    pub last_rtt_ms: Option<f64>,
    /// Sequence number of the current (or last) transport
    pub epoch: u64,
    /// Consecutive failed reconnection attempts
    pub reconnect_attempts: u32,
}

impl ConnectionStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a transport reaching the open state
    pub fn record_connect(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an open transport being lost
    pub fn record_disconnect(&self) {
        self.disconnections.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request envelope handed to the transport
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a resubmission after a timeout
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a submission that ended in an error
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count entries failed by the sweeper
    pub fn record_stale(&self, count: usize) {
        self.stale_swept.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Count an inbound frame dropped as unparseable
    pub fn record_malformed(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the latest probe round trip
    pub fn record_rtt(&self, rtt: Duration) {
        let micros = (rtt.as_micros() as u64).max(1);
        self.last_rtt_micros.store(micros, Ordering::Relaxed);
    }

    pub(crate) fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Relaxed);
    }

    pub(crate) fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
    }

    /// Clear all counters (operator action). Gauges are kept.
    pub fn reset(&self) {
        for counter in [
            &self.connections_opened,
            &self.disconnections,
            &self.requests,
            &self.retries,
            &self.errors,
            &self.stale_swept,
            &self.malformed_dropped,
            &self.last_rtt_micros,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Copy the counters; `in_flight` comes from the correlation table
    pub fn snapshot(&self, in_flight: usize) -> StatsSnapshot {
        let rtt = self.last_rtt_micros.load(Ordering::Relaxed);
        StatsSnapshot {
            connects: self.connections_opened.load(Ordering::Relaxed),
            disconnects: self.disconnections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            stale_swept: self.stale_swept.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            in_flight,
            last_rtt_ms: (rtt > 0).then(|| rtt as f64 / 1000.0),
            epoch: self.epoch.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}
