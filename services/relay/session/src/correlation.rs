//! Correlation table mapping request identifiers to waiting callers.
//!
//! Removing an entry is the claim that authorises resolving it: whichever
//! path (reply, cascade, sweep, or the caller's own timeout) removes the
//! entry first owns its completion handle, so no caller is resolved twice.

use crate::error::{ExchangeError, ExchangeResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_wire::RequestId;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One in-flight transmission
#[derive(Debug)]
pub struct PendingExchange {
    /// Identifier of this transmission
    pub id: RequestId,
    /// Remote operation name
    pub method: String,
    /// Opaque parameters, retained so a retry can rebuild the request
    pub params: Value,
    /// When this transmission was registered
    pub submitted_at: Instant,
    /// Timeout armed for this transmission
    pub timeout: Duration,
    /// Retries left after this transmission
    pub retries_left: u32,
    /// Delay that preceded this transmission (zero for the first)
    pub retry_delay: Duration,
    completion: oneshot::Sender<ExchangeResult>,
}

impl PendingExchange {
    /// Create a record and the receiver the caller waits on
    pub fn new(
        id: RequestId,
        method: impl Into<String>,
        params: Value,
        timeout: Duration,
        retries_left: u32,
        retry_delay: Duration,
    ) -> (Self, oneshot::Receiver<ExchangeResult>) {
        let (completion, rx) = oneshot::channel();
        let pending = Self {
            id,
            method: method.into(),
            params,
            submitted_at: Instant::now(),
            timeout,
            retries_left,
            retry_delay,
            completion,
        };
        (pending, rx)
    }

    /// Whether this entry has outlived its timeout plus `margin`
    pub fn is_stale(&self, now: Instant, margin: Duration) -> bool {
        now.saturating_duration_since(self.submitted_at) > self.timeout.saturating_add(margin)
    }

    /// Wake the caller. Returns false if the caller stopped waiting.
    fn complete(self, result: ExchangeResult) -> bool {
        self.completion.send(result).is_ok()
    }
}

/// Identifier to pending exchange map
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: DashMap<RequestId, PendingExchange>,
}

impl CorrelationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exchange. Fails if the identifier is already in use.
    pub fn insert(&self, pending: PendingExchange) -> Result<(), PendingExchange> {
        match self.entries.entry(pending.id) {
            Entry::Occupied(_) => Err(pending),
            Entry::Vacant(slot) => {
                slot.insert(pending);
                Ok(())
            }
        }
    }

    /// Remove an entry without resolving it
    pub fn remove(&self, id: RequestId) -> Option<PendingExchange> {
        self.entries.remove(&id).map(|(_, pending)| pending)
    }

    /// Remove and resolve one entry. Returns false if the id is unknown.
    pub fn resolve(&self, id: RequestId, result: ExchangeResult) -> bool {
        match self.remove(id) {
            Some(pending) => {
                if !pending.complete(result) {
                    debug!("Caller for request {} stopped waiting before resolution", id);
                }
                true
            }
            None => false,
        }
    }

    /// Resolve every entry with `error` and empty the table
    pub fn fail_all(&self, error: ExchangeError) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if self.resolve(id, Err(error.clone())) {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!("Failed {} pending exchange(s): {}", failed, error);
        }
        failed
    }

    /// Resolve entries older than their timeout plus `margin` with `StaleRequest`
    pub fn sweep_stale(&self, now: Instant, margin: Duration) -> usize {
        let stale: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_stale(now, margin))
            .map(|entry| *entry.key())
            .collect();

        let mut swept = 0;
        for id in stale {
            if self.resolve(id, Err(ExchangeError::StaleRequest)) {
                swept += 1;
            }
        }
        swept
    }

    /// Whether an identifier is registered
    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of in-flight exchanges
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
