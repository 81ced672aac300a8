//! Session configuration.

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;
use std::time::Duration;

/// Configuration for the connection engine
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// WebSocket URL of the remote counterparty
    pub target: String,
    /// Upper bound on a single transport open attempt
    pub connect_timeout: Duration,
    /// Delay curve between reconnection attempts
    pub reconnect_backoff: BackoffPolicy,
    /// Consecutive failed attempts before giving up until a forced reconnect
    pub max_reconnect_attempts: u32,
    /// Per-attempt timeout used by `submit_default`
    pub request_timeout: Duration,
    /// Retry budget used by `submit_default`
    pub retry_budget: u32,
    /// Delay curve between request retries
    pub retry_backoff: BackoffPolicy,
    /// Interval between liveness probes
    pub heartbeat_interval: Duration,
    /// Time allowed for any inbound traffic after a probe
    pub pong_timeout: Duration,
    /// Period of the stale-entry sweep
    pub sweep_interval: Duration,
    /// Grace added to an entry's own timeout before the sweeper fails it
    pub stale_margin: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: "ws://127.0.0.1:9944".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_backoff: BackoffPolicy {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                growth_factor: 2.0,
                jitter: Duration::from_millis(1000),
            },
            max_reconnect_attempts: 10,
            request_timeout: Duration::from_secs(30),
            retry_budget: 0,
            retry_backoff: BackoffPolicy {
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                growth_factor: 2.0,
                jitter: Duration::from_millis(250),
            },
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            stale_margin: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Default configuration pointed at `target`
    pub fn with_target(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.trim().is_empty() {
            return Err(ConfigError::EmptyTarget);
        }

        let periods = [
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("pong_timeout", self.pong_timeout),
            ("sweep_interval", self.sweep_interval),
        ];
        for (name, value) in periods {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        validate_backoff("reconnect", &self.reconnect_backoff)?;
        validate_backoff("retry", &self.retry_backoff)?;
        Ok(())
    }
}

fn validate_backoff(name: &'static str, policy: &BackoffPolicy) -> Result<(), ConfigError> {
    if policy.base_delay > policy.max_delay {
        return Err(ConfigError::Backoff {
            name,
            reason: "base delay exceeds max delay",
        });
    }
    if !policy.growth_factor.is_finite() || policy.growth_factor < 1.0 {
        return Err(ConfigError::Backoff {
            name,
            reason: "growth factor must be a finite number >= 1",
        });
    }
    Ok(())
}
