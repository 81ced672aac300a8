//! Configuration handling for the relay binary.
//!
//! Values come from an optional YAML file, then `RELAY_*` environment
//! variables, then command-line flags (applied in `main`).

use anyhow::Result;
use relay_session::{BackoffPolicy, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Relay binary configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the remote counterparty
    pub target: String,
    /// Transport open timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Reconnect delay curve
    pub reconnect: BackoffConfig,
    /// Attempts before giving up until a forced reconnect
    pub max_reconnect_attempts: u32,
    /// Default per-attempt request timeout (milliseconds)
    pub request_timeout_ms: u64,
    /// Default retry budget for `call` commands
    pub retry_budget: u32,
    /// Request retry delay curve
    pub retry: BackoffConfig,
    /// Liveness probe interval (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// Time allowed for inbound traffic after a probe (milliseconds)
    pub pong_timeout_ms: u64,
    /// Stale sweep period (milliseconds)
    pub sweep_interval_ms: u64,
    /// Grace beyond an entry's timeout before the sweep fails it (milliseconds)
    pub stale_margin_ms: u64,
    /// Statistics log interval (milliseconds)
    pub stats_interval_ms: u64,
}

/// Backoff curve as it appears in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub growth_factor: f64,
    pub jitter_ms: u64,
}

impl From<&BackoffPolicy> for BackoffConfig {
    fn from(policy: &BackoffPolicy) -> Self {
        Self {
            base_delay_ms: millis(policy.base_delay),
            max_delay_ms: millis(policy.max_delay),
            growth_factor: policy.growth_factor,
            jitter_ms: millis(policy.jitter),
        }
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            growth_factor: config.growth_factor,
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        (&BackoffPolicy::default()).into()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            target: session.target.clone(),
            connect_timeout_ms: millis(session.connect_timeout),
            reconnect: (&session.reconnect_backoff).into(),
            max_reconnect_attempts: session.max_reconnect_attempts,
            request_timeout_ms: millis(session.request_timeout),
            retry_budget: session.retry_budget,
            retry: (&session.retry_backoff).into(),
            heartbeat_interval_ms: millis(session.heartbeat_interval),
            pong_timeout_ms: millis(session.pong_timeout),
            sweep_interval_ms: millis(session.sweep_interval),
            stale_margin_ms: millis(session.stale_margin),
            stats_interval_ms: 30_000,
        }
    }
}

/// Root configuration structure (matches the YAML layout)
#[derive(Debug, Deserialize)]
struct RootConfig {
    relay: Option<RelayConfig>,
}

impl RelayConfig {
    /// Load configuration from file, then apply environment overrides.
    ///
    /// A missing or unparsable file is logged and defaults are used.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    info!("Loaded configuration from {:?}", path);
                    root.relay.unwrap_or_default()
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?}, using defaults: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_environment() -> Self {
        let mut config = Self::default();
        config.apply_environment_overrides();
        config
    }

    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `RELAY_*` overrides read through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(target) = lookup("RELAY_TARGET") {
            info!("Target overridden by environment: {}", target);
            self.target = target;
        }

        if let Some(value) = lookup("RELAY_MAX_RECONNECT_ATTEMPTS") {
            match value.parse::<u32>() {
                Ok(attempts) => {
                    self.max_reconnect_attempts = attempts;
                    info!("Max reconnect attempts overridden by environment: {}", attempts);
                }
                Err(_) => warn!("Ignoring invalid RELAY_MAX_RECONNECT_ATTEMPTS: {}", value),
            }
        }

        if let Some(value) = lookup("RELAY_REQUEST_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(ms) => {
                    self.request_timeout_ms = ms;
                    info!("Request timeout overridden by environment: {}ms", ms);
                }
                Err(_) => warn!("Ignoring invalid RELAY_REQUEST_TIMEOUT_MS: {}", value),
            }
        }

        if let Some(value) = lookup("RELAY_RETRY_BUDGET") {
            match value.parse::<u32>() {
                Ok(budget) => {
                    self.retry_budget = budget;
                    info!("Retry budget overridden by environment: {}", budget);
                }
                Err(_) => warn!("Ignoring invalid RELAY_RETRY_BUDGET: {}", value),
            }
        }
    }

    /// Library configuration for the connection engine
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            target: self.target.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_backoff: (&self.reconnect).into(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            retry_budget: self.retry_budget,
            retry_backoff: (&self.retry).into(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            stale_margin: Duration::from_millis(self.stale_margin_ms),
        }
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
