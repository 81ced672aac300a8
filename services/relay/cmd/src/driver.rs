//! Line-oriented JSON operator interface.
//!
//! Each stdin line is one command tagged by `op`; each result is one stdout
//! line carrying the command's sequence number. Calls run concurrently, so
//! their results may come back out of order.

use anyhow::Result;
use relay_session::{ExchangeCoordinator, ExchangeError, ExchangeResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// One operator command
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Issue a request and print the correlated reply
    Call {
        method: String,
        #[serde(default)]
        params: Value,
        timeout_ms: Option<u64>,
        retries: Option<u32>,
    },
    /// Print the connection state
    State,
    /// Print a statistics snapshot
    Stats,
    /// Zero the statistics counters
    ResetStats,
    /// Force an immediate reconnect
    Reconnect,
}

/// Render an exchange outcome as an output line
pub fn render_result(seq: u64, result: ExchangeResult) -> Value {
    match result {
        Ok(payload) => json!({ "seq": seq, "ok": payload }),
        Err(e) => render_error(seq, &e),
    }
}

fn render_error(seq: u64, error: &ExchangeError) -> Value {
    let detail = match error {
        ExchangeError::RemoteError(payload) => payload.clone(),
        other => Value::String(other.to_string()),
    };
    json!({ "seq": seq, "error": error.kind(), "detail": detail })
}

/// Read commands from `input` until EOF, sending output lines to `out`.
///
/// Returns after every call started from `input` has produced its result.
pub async fn run_operator<R>(
    coordinator: ExchangeCoordinator,
    input: R,
    out: mpsc::UnboundedSender<Value>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut calls = JoinSet::new();
    let mut seq: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        seq += 1;

        let command = match serde_json::from_str::<OperatorCommand>(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejecting operator command {}: {}", seq, e);
                let _ = out.send(json!({
                    "seq": seq,
                    "error": "invalid_command",
                    "detail": e.to_string(),
                }));
                continue;
            }
        };
        debug!("Operator command {}: {:?}", seq, command);

        match command {
            OperatorCommand::Call {
                method,
                params,
                timeout_ms,
                retries,
            } => {
                let coordinator = coordinator.clone();
                let out = out.clone();
                calls.spawn(async move {
                    let config = coordinator.connection().config();
                    let timeout = timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(config.request_timeout);
                    let retries = retries.unwrap_or(config.retry_budget);
                    let result = coordinator.submit(&method, params, timeout, retries).await;
                    let _ = out.send(render_result(seq, result));
                });
            }
            OperatorCommand::State => {
                let _ = out.send(json!({ "seq": seq, "ok": coordinator.connection_state() }));
            }
            OperatorCommand::Stats => {
                let _ = out.send(json!({ "seq": seq, "ok": coordinator.stats() }));
            }
            OperatorCommand::ResetStats => {
                coordinator.reset_stats();
                let _ = out.send(json!({ "seq": seq, "ok": null }));
            }
            OperatorCommand::Reconnect => {
                coordinator.force_reconnect();
                let _ = out.send(json!({ "seq": seq, "ok": null }));
            }
        }
    }

    info!("Operator input closed; waiting for {} call(s) in flight", calls.len());
    while calls.join_next().await.is_some() {}
    Ok(())
}

/// Print remote notifications until the connection drops its sender
pub async fn forward_notifications(
    mut notifications: mpsc::UnboundedReceiver<Value>,
    out: mpsc::UnboundedSender<Value>,
) {
    while let Some(payload) = notifications.recv().await {
        if out.send(json!({ "notification": payload })).is_err() {
            break;
        }
    }
}

/// Write output lines to stdout until every sender is gone
pub async fn write_output(mut lines: mpsc::UnboundedReceiver<Value>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.recv().await {
        let mut text = line.to_string();
        text.push('\n');
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}
