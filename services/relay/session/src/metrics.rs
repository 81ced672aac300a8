//! Periodic statistics reporting and health checks

use crate::connection::{ConnectionHandle, ConnectionState};
use crate::stats::StatsSnapshot;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Logs a statistics snapshot on a fixed interval
#[derive(Debug)]
pub struct StatsReporter {
    /// Connection being reported on
    connection: ConnectionHandle,
    /// Reporting interval
    report_interval: Duration,
}

impl StatsReporter {
    /// Create a reporter with a 30 second interval
    pub fn new(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            report_interval: Duration::from_secs(30),
        }
    }

    /// Set the reporting interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Start the reporting task. It exits once the connection shuts down.
    pub fn start_reporting_task(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.report_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            info!("Starting connection stats reporting (interval: {:?})", self.report_interval);

            loop {
                ticker.tick().await;
                if self.connection.is_shutting_down() {
                    debug!("Stats reporting stopped");
                    break;
                }

                let stats = self.connection.stats();
                let state = self.connection.state();
                self.log_metrics(state, &stats);
                for warning in HealthReport::from_stats(state, &stats).warnings {
                    warn!("{}", warning);
                }
            }
        })
    }

    fn log_metrics(&self, state: ConnectionState, stats: &StatsSnapshot) {
        info!(
            "Connection Metrics - State: {}, Epoch: {}, Connects: {}, Disconnects: {}, Requests: {}, Retries: {}, Errors: {}, In flight: {}",
            state,
            stats.epoch,
            stats.connects,
            stats.disconnects,
            stats.requests,
            stats.retries,
            stats.errors,
            stats.in_flight
        );
        debug!(
            "Detailed connection breakdown: stale_swept={}, malformed_dropped={}, last_rtt_ms={:?}, reconnect_attempts={}",
            stats.stale_swept, stats.malformed_dropped, stats.last_rtt_ms, stats.reconnect_attempts
        );
    }
}

/// Health assessment of a single snapshot
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    /// errors / requests, as a percentage
    pub error_rate: f64,
    /// retries / requests, as a percentage
    pub retry_rate: f64,
    /// Human-readable issues, empty when healthy
    pub warnings: Vec<String>,
}

impl HealthReport {
    /// Assess `stats` observed while in `state`
    pub fn from_stats(state: ConnectionState, stats: &StatsSnapshot) -> Self {
        let mut report = Self::default();

        if stats.requests > 0 {
            report.error_rate = (stats.errors as f64 / stats.requests as f64) * 100.0;
            report.retry_rate = (stats.retries as f64 / stats.requests as f64) * 100.0;

            if report.error_rate > 10.0 {
                report.warnings.push(format!(
                    "High exchange error rate: {:.1}% ({}/{})",
                    report.error_rate, stats.errors, stats.requests
                ));
            }
            if report.retry_rate > 20.0 {
                report.warnings.push(format!(
                    "High retry rate: {:.1}% ({}/{})",
                    report.retry_rate, stats.retries, stats.requests
                ));
            }
        }

        if state != ConnectionState::Open {
            report.warnings.push(format!(
                "Connection is {} (reconnect attempts: {})",
                state, stats.reconnect_attempts
            ));
        }
        if stats.stale_swept > 0 {
            report.warnings.push(format!(
                "{} exchange(s) were failed by the stale sweep",
                stats.stale_swept
            ));
        }

        report
    }

    /// Whether no issues were found
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_report() {
        let healthy = StatsSnapshot {
            connects: 1,
            requests: 100,
            retries: 5,
            errors: 2,
            epoch: 1,
            ..Default::default()
        };
        let report = HealthReport::from_stats(ConnectionState::Open, &healthy);
        assert!(report.is_healthy());
        assert!((report.error_rate - 2.0).abs() < 0.01);

        let degraded = StatsSnapshot {
            requests: 10,
            retries: 5,
            errors: 3,
            stale_swept: 1,
            reconnect_attempts: 4,
            ..Default::default()
        };
        let report = HealthReport::from_stats(ConnectionState::Disconnected, &degraded);
        assert_eq!(report.warnings.len(), 4);
        assert!((report.retry_rate - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_idle_connection_has_no_rates() {
        let report = HealthReport::from_stats(ConnectionState::Open, &StatsSnapshot::default());
        assert_eq!(report.error_rate, 0.0);
        assert!(report.is_healthy());
    }
}
