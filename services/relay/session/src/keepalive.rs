//! Liveness probing with Ping/Pong and RTT measurement.
//!
//! [`LivenessMonitor`] is a pure state object: the connection driver asks it
//! when to wake up, whether a probe is due, and whether the outstanding probe
//! has expired. Probe payloads carry a monotonic correlation stamp so the
//! matching Pong yields a round-trip time.

use bytes::Bytes;
use once_cell::sync::Lazy;
use std::time::{Duration, Instant as StdInstant};
use tokio::time::Instant;

static CLOCK_ANCHOR: Lazy<StdInstant> = Lazy::new(StdInstant::now);

/// Generate a correlation stamp based on monotonic time
pub fn now_corr_id() -> u64 {
    // Monotonic nanoseconds since the anchor, truncated to u64
    (CLOCK_ANCHOR.elapsed().as_nanos() & 0xFFFF_FFFF_FFFF_FFFF) as u64
}

/// Calculate RTT from a correlation stamp echoed back in a Pong
pub fn calc_rtt_from_corr(peer_corr_id: u64) -> Option<Duration> {
    let now_ns = CLOCK_ANCHOR.elapsed().as_nanos() as u64;
    now_ns.checked_sub(peer_corr_id).map(Duration::from_nanos)
}

/// Build a Ping payload stamped with the current correlation id
pub fn build_probe() -> Bytes {
    Bytes::copy_from_slice(&now_corr_id().to_be_bytes())
}

/// Extract the RTT from a Pong payload produced by [`build_probe`]
pub fn rtt_from_probe(payload: &[u8]) -> Option<Duration> {
    let stamp: [u8; 8] = payload.try_into().ok()?;
    calc_rtt_from_corr(u64::from_be_bytes(stamp))
}

/// Far enough ahead to never fire
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `now + period`, with the period clamped to [`FAR_FUTURE`]
pub fn deadline_after(now: Instant, period: Duration) -> Instant {
    now + period.min(FAR_FUTURE)
}

/// Probe schedule and deadline for one open transport
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    heartbeat_interval: Duration,
    pong_timeout: Duration,
    last_seen: Instant,
    next_probe: Instant,
    probe_deadline: Option<Instant>,
}

impl LivenessMonitor {
    /// Start monitoring a transport that opened at `now`
    pub fn start(heartbeat_interval: Duration, pong_timeout: Duration, now: Instant) -> Self {
        Self {
            heartbeat_interval,
            pong_timeout,
            last_seen: now,
            next_probe: deadline_after(now, heartbeat_interval),
            probe_deadline: None,
        }
    }

    /// Any inbound traffic proves liveness and disarms the deadline
    pub fn observe(&mut self, now: Instant) {
        self.last_seen = now;
        self.probe_deadline = None;
    }

    /// Whether a probe should be sent now
    pub fn probe_due(&self, now: Instant) -> bool {
        self.probe_deadline.is_none() && now >= self.next_probe
    }

    /// Record that a probe went out at `now` and arm the deadline
    pub fn on_probe_sent(&mut self, now: Instant) {
        self.next_probe = deadline_after(now, self.heartbeat_interval);
        self.probe_deadline = Some(deadline_after(now, self.pong_timeout));
    }

    /// Whether the outstanding probe went unanswered past its deadline
    pub fn is_expired(&self, now: Instant) -> bool {
        self.probe_deadline.map_or(false, |deadline| now >= deadline)
    }

    /// Next instant at which the driver must check the monitor
    pub fn next_wakeup(&self) -> Instant {
        self.probe_deadline.unwrap_or(self.next_probe)
    }

    /// Last time any inbound traffic was observed
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Whether a probe is outstanding
    pub fn awaiting_pong(&self) -> bool {
        self.probe_deadline.is_some()
    }
}
