//! In-process WebSocket remote for exercising the engine end to end

use crate::config::SessionConfig;
use crate::backoff::BackoffPolicy;
use futures::{SinkExt, StreamExt};
use relay_wire::{Envelope, RequestId};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

/// How the remote answers each request it reads
#[derive(Clone, Debug)]
pub(crate) enum Behavior {
    /// Reply with `payload` after `delay`
    Reply { payload: Value, delay: Duration },
    /// Reply with the request body itself
    Echo,
    /// Reply wrapped in a `From` forwarding layer
    Forwarded(Value),
    /// Reply with an `Error` envelope
    Reject(Value),
    /// Read requests but never answer
    Silent,
    /// Close the socket once this many requests have arrived
    CloseAfter(usize),
    /// Send these raw frames on accept, then echo
    Greet(Vec<String>),
    /// Complete the handshake and then never read again
    Stall,
}

pub(crate) struct MockRemote {
    pub url: String,
    pub requests: mpsc::UnboundedReceiver<(RequestId, Value)>,
    pub accepted: Arc<AtomicUsize>,
}

impl MockRemote {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Everything received so far
    pub fn drain_requests(&mut self) -> Vec<(RequestId, Value)> {
        let mut out = Vec::new();
        while let Ok(req) = self.requests.try_recv() {
            out.push(req);
        }
        out
    }
}

pub(crate) async fn spawn_remote(behavior: Behavior) -> MockRemote {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let behavior = behavior.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Ok(ws) = accept_async(socket).await {
                    serve(ws, behavior, tx).await;
                }
            });
        }
    });

    MockRemote {
        url: format!("ws://{}", addr),
        requests: rx,
        accepted,
    }
}

/// A listener that accepts TCP and hangs up before the WebSocket handshake
pub(crate) async fn spawn_refusing_listener() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });

    (format!("ws://{}", addr), accepted)
}

/// A listener that accepts TCP and holds each socket without ever answering
/// the WebSocket handshake
pub(crate) async fn spawn_silent_listener() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });

    (format!("ws://{}", addr), accepted)
}

async fn serve(
    mut ws: WebSocketStream<TcpStream>,
    behavior: Behavior,
    tx: mpsc::UnboundedSender<(RequestId, Value)>,
) {
    match &behavior {
        Behavior::Stall => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return;
        }
        Behavior::Greet(frames) => {
            for frame in frames {
                if ws.send(Message::text(frame.clone())).await.is_err() {
                    return;
                }
            }
        }
        _ => {}
    }

    let mut received = 0;
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(Envelope::Req { id, req }) = relay_wire::decode(text.as_str()) else {
            continue;
        };
        let _ = tx.send((id, req.clone()));
        received += 1;

        let reply = match &behavior {
            Behavior::Reply { payload, delay } => {
                tokio::time::sleep(*delay).await;
                Some(json!({ "Resp": { "id": id, "resp": payload } }))
            }
            Behavior::Echo | Behavior::Greet(_) => Some(json!({ "Resp": { "id": id, "resp": req } })),
            Behavior::Forwarded(payload) => {
                Some(json!({ "From": { "Resp": { "id": id, "resp": payload } } }))
            }
            Behavior::Reject(err) => Some(json!({ "Error": { "id": id, "err": err } })),
            Behavior::CloseAfter(n) => {
                if received >= *n {
                    let _ = ws.close(None).await;
                    return;
                }
                None
            }
            Behavior::Silent | Behavior::Stall => None,
        };

        if let Some(reply) = reply {
            if ws.send(Message::text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
}

/// Config tuned for fast tests
pub(crate) fn test_config(target: &str) -> SessionConfig {
    SessionConfig {
        target: target.to_string(),
        connect_timeout: Duration::from_secs(2),
        reconnect_backoff: BackoffPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            growth_factor: 2.0,
            jitter: Duration::ZERO,
        },
        max_reconnect_attempts: 5,
        request_timeout: Duration::from_secs(5),
        retry_budget: 0,
        retry_backoff: BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            growth_factor: 2.0,
            jitter: Duration::ZERO,
        },
        heartbeat_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(10),
        sweep_interval: Duration::from_secs(60),
        stale_margin: Duration::from_secs(5),
    }
}

/// Poll `check` every 10ms until it holds or `limit` passes
pub(crate) async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
