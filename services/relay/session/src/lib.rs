//! Connection resilience and request correlation over a single WebSocket.
//!
//! A [`Connection`] owns one transport to a remote counterparty and keeps it
//! alive: exponential backoff reconnects, a ping/pong liveness monitor, and
//! a periodic sweep of exchanges nobody is waiting on any more. Requests go
//! through an [`ExchangeCoordinator`], which tags each one with a fresh
//! [`RequestId`](relay_wire::RequestId), waits for the correlated reply, and
//! retries timed-out attempts within a budget.
//!
//! ```no_run
//! use relay_session::{Connection, ConnectionState, ExchangeCoordinator, SessionConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = Connection::new(SessionConfig::with_target("ws://127.0.0.1:9944")).start()?;
//! handle.wait_for_state(ConnectionState::Open, Duration::from_secs(5)).await;
//!
//! let coordinator = ExchangeCoordinator::new(handle);
//! let quote = coordinator
//!     .submit("Quote", json!({"symbol": "ABC"}), Duration::from_secs(30), 2)
//!     .await?;
//! println!("{quote}");
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod correlation;
pub mod error;
pub mod keepalive;
pub mod metrics;
pub mod stats;
pub mod sweeper;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use backoff::{BackoffPolicy, RetryState};
pub use config::SessionConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionState};
pub use coordinator::ExchangeCoordinator;
pub use correlation::{CorrelationTable, PendingExchange};
pub use error::{ConfigError, ExchangeError, ExchangeResult};
pub use keepalive::LivenessMonitor;
pub use metrics::{HealthReport, StatsReporter};
pub use stats::{ConnectionStats, StatsSnapshot};
