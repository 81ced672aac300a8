//! Relay operator binary.
//!
//! Holds one resilient WebSocket to a remote counterparty and drives it from
//! newline-delimited JSON commands on stdin. Results and notifications are
//! printed to stdout as JSON lines; logs go to stderr.

use anyhow::Context;
use clap::Parser;
use relay_session::{Connection, ExchangeCoordinator, StatsReporter};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod driver;
mod logging;

use config::RelayConfig;
use driver::{forward_notifications, run_operator, write_output};
use logging::RelayLogFormatter;

/// How long to wait for buffered output after shutdown
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Resilient WebSocket request relay
#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Resilient WebSocket request relay")]
struct Args {
    /// Remote WebSocket URL, e.g. ws://127.0.0.1:9944
    #[arg(long)]
    target: Option<String>,

    /// Configuration file path (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Liveness probe interval, e.g. 30s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Time allowed for inbound traffic after a probe, e.g. 10s
    #[arg(long)]
    pong_timeout: Option<humantime::Duration>,

    /// Statistics log interval, e.g. 30s
    #[arg(long)]
    stats_interval: Option<humantime::Duration>,

    /// Reconnection attempts before giving up
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,
}

impl Args {
    /// Command-line flags take precedence over file and environment
    fn apply_to(&self, config: &mut RelayConfig) {
        if let Some(target) = &self.target {
            config.target = target.clone();
        }
        if let Some(interval) = self.heartbeat_interval {
            config.heartbeat_interval_ms = as_millis(Duration::from(interval));
        }
        if let Some(timeout) = self.pong_timeout {
            config.pong_timeout_ms = as_millis(Duration::from(timeout));
        }
        if let Some(interval) = self.stats_interval {
            config.stats_interval_ms = as_millis(Duration::from(interval));
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = attempts;
        }
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("relay={}", args.log_level).parse()?)
        .add_directive(format!("relay_session={}", args.log_level).parse()?)
        .add_directive(format!("relay_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(RelayLogFormatter::new("relay".to_string()))
        .init();

    info!("Starting relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => RelayConfig::load_from_file(path)?,
        None => RelayConfig::from_environment(),
    };
    args.apply_to(&mut config);
    info!(
        "Relay configuration: target={}, max_reconnect_attempts={}, request_timeout={}ms, retry_budget={}",
        config.target, config.max_reconnect_attempts, config.request_timeout_ms, config.retry_budget
    );

    let (notification_tx, notification_rx) = mpsc::unbounded_channel();
    let handle = Connection::new(config.session_config())
        .with_notification_sender(notification_tx)
        .start()
        .context("invalid relay configuration")?;

    StatsReporter::new(handle.clone())
        .with_interval(config.stats_interval())
        .start_reporting_task();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_output(out_rx));
    tokio::spawn(forward_notifications(notification_rx, out_tx.clone()));

    let coordinator = ExchangeCoordinator::new(handle);
    let stdin = BufReader::new(tokio::io::stdin());

    tokio::select! {
        result = run_operator(coordinator.clone(), stdin, out_tx) => {
            result.context("failed to read operator input")?;
            info!("Operator input finished, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
        }
    }

    coordinator.shutdown().await;

    // The writer ends once the driver and notification forwarder drop their senders
    match tokio::time::timeout(OUTPUT_DRAIN, writer).await {
        Ok(Ok(Err(e))) => warn!("Failed to write output: {}", e),
        Ok(Err(e)) => warn!("Output writer panicked: {}", e),
        Err(_) => warn!("Timed out flushing output"),
        Ok(Ok(Ok(()))) => {}
    }

    info!("Relay stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "relay",
            "--target",
            "ws://10.1.1.1:9000",
            "--heartbeat-interval",
            "5s",
            "--pong-timeout",
            "1500ms",
        ]);
        let mut config = RelayConfig::default();
        args.apply_to(&mut config);

        assert_eq!(config.target, "ws://10.1.1.1:9000");
        assert_eq!(config.heartbeat_interval_ms, 5_000);
        assert_eq!(config.pong_timeout_ms, 1_500);
        assert_eq!(config.stats_interval_ms, 30_000);
    }
}
