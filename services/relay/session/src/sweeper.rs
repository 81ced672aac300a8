//! Periodic backstop that fails entries whose timeout never fired.

use crate::correlation::CorrelationTable;
use crate::stats::ConnectionStats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Spawn the sweep task. It exits once `shutting_down` is set.
pub fn spawn_sweeper(
    table: Arc<CorrelationTable>,
    stats: Arc<ConnectionStats>,
    period: Duration,
    margin: Duration,
    shutting_down: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        debug!("Starting stale-entry sweeper (period: {:?}, margin: {:?})", period, margin);

        loop {
            ticker.tick().await;
            if shutting_down.load(Ordering::Acquire) {
                debug!("Stale-entry sweeper stopping");
                break;
            }

            let swept = table.sweep_stale(Instant::now(), margin);
            if swept > 0 {
                stats.record_stale(swept);
                warn!("Swept {} stale pending exchange(s)", swept);
            }
        }
    })
}
