//! Error types surfaced by the session engine.

use serde_json::Value;
use thiserror::Error;

/// Result delivered to a waiting caller
pub type ExchangeResult = Result<Value, ExchangeError>;

/// Why an exchange did not produce a payload
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    /// Connection was not open when the request was submitted
    #[error("not connected")]
    NotConnected,

    /// Transport dropped while the exchange was in flight
    #[error("connection closed")]
    ConnectionClosed,

    /// No reply within the timeout and retry budget
    #[error("timed out after {attempts} attempt(s)")]
    Timeout {
        /// Number of transmissions made
        attempts: u32,
    },

    /// Counterparty rejected the request; payload passed through verbatim
    #[error("remote error: {0}")]
    RemoteError(Value),

    /// Entry outlived its timeout plus the stale margin
    #[error("stale request")]
    StaleRequest,

    /// Shutdown in progress
    #[error("shutting down")]
    ShuttingDown,

    /// Inbound data that could not be parsed (never delivered to a caller)
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Request rejected before transmission
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ExchangeError {
    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::NotConnected => "not_connected",
            ExchangeError::ConnectionClosed => "connection_closed",
            ExchangeError::Timeout { .. } => "timeout",
            ExchangeError::RemoteError(_) => "remote_error",
            ExchangeError::StaleRequest => "stale_request",
            ExchangeError::ShuttingDown => "shutting_down",
            ExchangeError::MalformedMessage(_) => "malformed_message",
            ExchangeError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<relay_wire::WireError> for ExchangeError {
    fn from(err: relay_wire::WireError) -> Self {
        ExchangeError::MalformedMessage(err.to_string())
    }
}

/// Invalid session configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Transport target is empty
    #[error("target address is empty")]
    EmptyTarget,

    /// A period that drives a timer is zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Backoff parameters are inconsistent
    #[error("invalid {name} backoff: {reason}")]
    Backoff {
        /// Which policy is invalid
        name: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}
