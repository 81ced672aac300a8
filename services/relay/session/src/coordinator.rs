//! Request/response exchanges over a shared connection.
//!
//! Each attempt gets a fresh id, is registered in the correlation table, and
//! waits on its completion handle with a timeout. A timed-out attempt is
//! removed from the table before the coordinator decides whether to retry, so
//! a late reply to an abandoned id is dropped rather than delivered to the
//! wrong attempt.

use crate::backoff::{BackoffPolicy, RetryState};
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::correlation::PendingExchange;
use crate::error::{ExchangeError, ExchangeResult};
use crate::stats::StatsSnapshot;
use relay_wire::{Envelope, RequestId};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of a single attempt
enum Attempt {
    Done(ExchangeResult),
    TimedOut,
}

/// Issues requests and retries timed-out attempts
#[derive(Debug, Clone)]
pub struct ExchangeCoordinator {
    connection: ConnectionHandle,
    retry_backoff: BackoffPolicy,
}

impl ExchangeCoordinator {
    /// Create a coordinator using the connection's configured retry curve
    pub fn new(connection: ConnectionHandle) -> Self {
        let retry_backoff = connection.config().retry_backoff.clone();
        Self {
            connection,
            retry_backoff,
        }
    }

    /// Override the delay curve between retries
    pub fn with_retry_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.retry_backoff = policy;
        self
    }

    /// The underlying connection
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Current transport state
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// See [`ConnectionHandle::force_reconnect`]
    pub fn force_reconnect(&self) {
        self.connection.force_reconnect();
    }

    /// See [`ConnectionHandle::shutdown`]
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }

    /// Snapshot of the connection statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.connection.stats()
    }

    /// Zero the statistics counters
    pub fn reset_stats(&self) {
        self.connection.reset_stats();
    }

    /// [`submit`](Self::submit) with the configured timeout and retry budget
    pub async fn submit_default(&self, method: &str, params: Value) -> ExchangeResult {
        let config = self.connection.config();
        let (timeout, retries) = (config.request_timeout, config.retry_budget);
        self.submit(method, params, timeout, retries).await
    }

    /// Send `{method: params}` and wait for the correlated reply.
    ///
    /// Fails fast with `NotConnected` when the transport is not open; no entry
    /// is created in that case. Each timed-out attempt consumes one retry from
    /// `retries`, and the delay before the next attempt follows the retry
    /// backoff curve.
    pub async fn submit(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        retries: u32,
    ) -> ExchangeResult {
        let result = self.run_exchange(method, params, timeout, retries).await;
        if let Err(e) = &result {
            self.connection.counters().record_error();
            debug!("Exchange {} failed: {}", method, e);
        }
        result
    }

    async fn run_exchange(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        retries: u32,
    ) -> ExchangeResult {
        if method.is_empty() {
            return Err(ExchangeError::InvalidRequest(
                "method name must not be empty".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(ExchangeError::InvalidRequest(
                "timeout must be greater than zero".to_string(),
            ));
        }

        let mut retry = RetryState::new(self.retry_backoff.clone(), retries);
        loop {
            if self.connection.is_shutting_down() {
                return Err(ExchangeError::ShuttingDown);
            }
            if !self.connection.is_open() {
                return Err(ExchangeError::NotConnected);
            }

            let id = self.connection.allocate_id();
            if let Attempt::Done(result) = self.attempt(id, method, &params, timeout, &retry).await {
                return result;
            }

            match retry.next_delay() {
                Some(delay) => {
                    self.connection.counters().record_retry();
                    info!(
                        "Request {} ({}) timed out after {:?}; retrying in {:?} ({} retries left)",
                        id,
                        method,
                        timeout,
                        delay,
                        retry.remaining()
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        "Request {} ({}) timed out after {} attempt(s)",
                        id,
                        method,
                        retry.attempts()
                    );
                    return Err(ExchangeError::Timeout {
                        attempts: retry.attempts(),
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        id: RequestId,
        method: &str,
        params: &Value,
        timeout: Duration,
        retry: &RetryState,
    ) -> Attempt {
        let text = match Envelope::request(id, method, params.clone()).encode() {
            Ok(text) => text,
            Err(e) => return Attempt::Done(Err(ExchangeError::InvalidRequest(e.to_string()))),
        };

        let (pending, mut completion) = PendingExchange::new(
            id,
            method.to_string(),
            params.clone(),
            timeout,
            retry.remaining(),
            retry.current_delay(),
        );

        let table = self.connection.table();
        if let Err(duplicate) = table.insert(pending) {
            error!("Request id {} is already in flight", duplicate.id);
            return Attempt::Done(Err(ExchangeError::InvalidRequest(format!(
                "duplicate request id {}",
                duplicate.id
            ))));
        }

        if let Err(e) = self.connection.transmit(id, text) {
            table.remove(id);
            return Attempt::Done(Err(e));
        }
        self.connection.counters().record_request();
        debug!("Submitted request {} ({})", id, method);

        match tokio::time::timeout(timeout, &mut completion).await {
            Ok(Ok(result)) => Attempt::Done(result),
            Ok(Err(_)) => Attempt::Done(Err(ExchangeError::ConnectionClosed)),
            Err(_) => {
                if table.remove(id).is_some() {
                    return Attempt::TimedOut;
                }
                // A resolver took the entry as the timer fired; its result is on the way
                match completion.await {
                    Ok(result) => Attempt::Done(result),
                    Err(_) => Attempt::Done(Err(ExchangeError::ConnectionClosed)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::test_support::{eventually, spawn_refusing_listener, spawn_remote, test_config, Behavior};
    use serde_json::json;
    use std::time::Instant;

    const OPEN_WAIT: Duration = Duration::from_secs(5);

    async fn open_coordinator(url: &str) -> ExchangeCoordinator {
        let handle = Connection::new(test_config(url)).start().unwrap();
        assert!(handle.wait_for_state(ConnectionState::Open, OPEN_WAIT).await);
        ExchangeCoordinator::new(handle)
    }

    #[tokio::test]
    async fn test_quote_reply_delivered_to_caller() {
        let quote = json!({"recv_amount": 4350000, "price": 43500});
        let mut remote = spawn_remote(Behavior::Reply {
            payload: quote.clone(),
            delay: Duration::from_millis(200),
        })
        .await;
        let coordinator = open_coordinator(&remote.url).await;

        let params = json!({"send_asset": "btc", "recv_asset": "usdt", "send_amount": 100000});
        let result = coordinator
            .submit("Quote", params.clone(), Duration::from_millis(30000), 0)
            .await;
        assert_eq!(result, Ok(quote));

        let requests = remote.drain_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1, json!({ "Quote": params }));

        let stats = coordinator.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_not_connected_creates_no_entry() {
        let (url, _) = spawn_refusing_listener().await;
        let mut config = test_config(&url);
        config.max_reconnect_attempts = 0;
        let handle = Connection::new(config).start().unwrap();
        let coordinator = ExchangeCoordinator::new(handle.clone());

        assert!(eventually(OPEN_WAIT, || handle.state() == ConnectionState::Disconnected).await);
        let result = coordinator
            .submit("Quote", json!({}), Duration::from_secs(1), 3)
            .await;
        assert_eq!(result, Err(ExchangeError::NotConnected));
        assert_eq!(handle.in_flight(), 0);
        assert_eq!(coordinator.stats().requests, 0);
        assert_eq!(coordinator.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_timeout_without_retries() {
        let remote = spawn_remote(Behavior::Silent).await;
        let coordinator = open_coordinator(&remote.url).await;

        let started = Instant::now();
        let result = coordinator
            .submit("Quote", json!({}), Duration::from_millis(1000), 0)
            .await;
        let elapsed = started.elapsed();

        assert_eq!(result, Err(ExchangeError::Timeout { attempts: 1 }));
        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed < Duration::from_millis(2000));
        assert_eq!(coordinator.connection().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_retries_use_fresh_increasing_ids() {
        let mut remote = spawn_remote(Behavior::Silent).await;
        let coordinator = open_coordinator(&remote.url).await;

        let result = coordinator
            .submit("Quote", json!({"n": 1}), Duration::from_millis(100), 2)
            .await;
        assert_eq!(result, Err(ExchangeError::Timeout { attempts: 3 }));

        let handle = coordinator.connection().clone();
        assert!(eventually(Duration::from_secs(1), || handle.stats().requests == 3).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ids: Vec<RequestId> = remote.drain_requests().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

        let stats = coordinator.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_remote_error_returned_verbatim() {
        let err = json!({"code": 42, "message": "unknown symbol"});
        let remote = spawn_remote(Behavior::Reject(err.clone())).await;
        let coordinator = open_coordinator(&remote.url).await;

        let result = coordinator
            .submit("Quote", json!({"symbol": "ZZZ"}), Duration::from_secs(5), 2)
            .await;
        assert_eq!(result, Err(ExchangeError::RemoteError(err)));
        assert_eq!(coordinator.stats().retries, 0);
    }

    #[tokio::test]
    async fn test_forwarded_reply_is_unwrapped() {
        let remote = spawn_remote(Behavior::Forwarded(json!("pong"))).await;
        let coordinator = open_coordinator(&remote.url).await;

        let result = coordinator
            .submit("Ping", json!(null), Duration::from_secs(5), 0)
            .await;
        assert_eq!(result, Ok(json!("pong")));
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_are_correlated() {
        let remote = spawn_remote(Behavior::Echo).await;
        let coordinator = open_coordinator(&remote.url).await;

        let mut tasks = Vec::new();
        for n in 0..20 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                let reply = coordinator
                    .submit("Echo", json!({"n": n}), Duration::from_secs(5), 0)
                    .await;
                (n, reply)
            }));
        }

        for task in tasks {
            let (n, reply) = task.await.unwrap();
            assert_eq!(reply, Ok(json!({"Echo": {"n": n}})));
        }
        assert_eq!(coordinator.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let remote = spawn_remote(Behavior::Echo).await;
        let coordinator = open_coordinator(&remote.url).await;

        let empty = coordinator.submit("", json!({}), Duration::from_secs(1), 0).await;
        assert!(matches!(empty, Err(ExchangeError::InvalidRequest(_))));

        let zero = coordinator.submit("Quote", json!({}), Duration::ZERO, 0).await;
        assert!(matches!(zero, Err(ExchangeError::InvalidRequest(_))));
        assert_eq!(coordinator.stats().requests, 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let remote = spawn_remote(Behavior::Echo).await;
        let coordinator = open_coordinator(&remote.url).await;

        coordinator.shutdown().await;
        let result = coordinator.submit_default("Quote", json!({})).await;
        assert_eq!(result, Err(ExchangeError::ShuttingDown));
        assert_eq!(coordinator.connection_state(), ConnectionState::Disconnected);
    }
}
