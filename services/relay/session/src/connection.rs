//! Connection lifecycle manager.
//!
//! A single driver task owns the WebSocket. Everything else talks to it
//! through a [`ConnectionHandle`]: requests are handed over as commands, the
//! state is published on a watch channel, and replies are routed into the
//! shared [`CorrelationTable`].
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> OPEN -> CLOSING -> DISCONNECTED
//!        ^             |          |
//!        +-------------+----------+  (transport error / close / liveness timeout)
//! ```
//!
//! Every transition into DISCONNECTED fails all in-flight exchanges and, unless
//! shutting down or out of attempts, schedules a reconnect on the backoff
//! curve.

use crate::config::SessionConfig;
use crate::correlation::CorrelationTable;
use crate::error::{ConfigError, ExchangeError};
use crate::keepalive::{build_probe, deadline_after, rtt_from_probe, LivenessMonitor, FAR_FUTURE};
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::sweeper::spawn_sweeper;
use crate::transport::{normal_close, open_ws_with_timeout, TransportError, WsStream};
use futures::{SinkExt, StreamExt};
use relay_wire::{Envelope, RequestId, WireError};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, trace, warn};

/// How long a close frame may take to go out before the socket is dropped
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Observable state of the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No transport; a reconnect may be scheduled
    Disconnected,
    /// Transport open in progress
    Connecting,
    /// Transport usable for requests
    Open,
    /// Graceful close in progress
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// Commands from handles to the driver task
#[derive(Debug)]
enum Command {
    /// Write a registered request envelope
    Send { id: RequestId, text: String },
    /// Drop any current transport and connect immediately
    Reconnect,
    /// Close for good
    Shutdown { done: oneshot::Sender<()> },
}

/// Builder for the connection engine
pub struct Connection {
    config: SessionConfig,
    notifications: Option<mpsc::UnboundedSender<Value>>,
}

impl Connection {
    /// Create a connection for `config`; nothing runs until [`Connection::start`]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            notifications: None,
        }
    }

    /// Forward `Notif` payloads to `tx`
    pub fn with_notification_sender(mut self, tx: mpsc::UnboundedSender<Value>) -> Self {
        self.notifications = Some(tx);
        self
    }

    /// Validate the config and spawn the driver and sweeper tasks.
    ///
    /// Must be called from within a tokio runtime. The first connection
    /// attempt starts immediately; this does not wait for it.
    pub fn start(self) -> Result<ConnectionHandle, ConfigError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let table = Arc::new(CorrelationTable::new());
        let stats = Arc::new(ConnectionStats::new());
        let shutting_down = Arc::new(AtomicBool::new(false));

        spawn_sweeper(
            table.clone(),
            stats.clone(),
            config.sweep_interval,
            config.stale_margin,
            shutting_down.clone(),
        );

        let driver = ConnectionDriver {
            config: config.clone(),
            cmd_rx,
            state_tx,
            table: table.clone(),
            stats: stats.clone(),
            shutting_down: shutting_down.clone(),
            notifications: self.notifications,
            ws: None,
            liveness: None,
            reconnect_attempts: 0,
            reconnect_at: None,
            epoch: 0,
        };
        tokio::spawn(driver.run());

        Ok(ConnectionHandle {
            cmd_tx,
            state_rx,
            table,
            stats,
            shutting_down,
            next_id: Arc::new(AtomicU64::new(1)),
            config,
        })
    }
}

/// Cloneable handle to a running connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    table: Arc<CorrelationTable>,
    stats: Arc<ConnectionStats>,
    shutting_down: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    config: Arc<SessionConfig>,
}

impl ConnectionHandle {
    /// Current transport state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Whether requests can be submitted right now
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Configuration the connection was started with
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the state equals `target`, for at most `limit`
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let outcome = tokio::time::timeout(limit, rx.wait_for(|state| *state == target)).await;
        matches!(outcome, Ok(Ok(_)))
    }

    /// Number of exchanges awaiting a reply
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.table.len())
    }

    /// Zero the statistics counters
    pub fn reset_stats(&self) {
        self.stats.reset();
        info!("Connection statistics reset");
    }

    /// Drop the current transport (if any) and connect now, clearing the
    /// attempt counter. Ignored after shutdown.
    pub fn force_reconnect(&self) {
        if self.cmd_tx.send(Command::Reconnect).is_err() {
            debug!("Reconnect requested but the connection driver is not running");
        }
    }

    /// Close the transport with a normal closure, fail everything in flight
    /// with `ShuttingDown`, and stop all background work.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already in progress");
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }

        // Nothing is left to resolve entries registered after the driver exited
        self.table.fail_all(ExchangeError::ShuttingDown);
    }

    pub(crate) fn allocate_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn table(&self) -> &CorrelationTable {
        &self.table
    }

    pub(crate) fn counters(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Hand a registered request to the driver for writing
    pub(crate) fn transmit(&self, id: RequestId, text: String) -> Result<(), ExchangeError> {
        self.cmd_tx
            .send(Command::Send { id, text })
            .map_err(|_| ExchangeError::ShuttingDown)
    }
}

/// Whether the driver loop keeps running
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

enum DriverEvent {
    Command(Option<Command>),
    Frame(Option<Result<Message, TransportError>>),
    LivenessCheck,
    ReconnectDue,
}

/// Task state that owns the transport
struct ConnectionDriver {
    config: Arc<SessionConfig>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    table: Arc<CorrelationTable>,
    stats: Arc<ConnectionStats>,
    shutting_down: Arc<AtomicBool>,
    notifications: Option<mpsc::UnboundedSender<Value>>,
    ws: Option<WsStream>,
    liveness: Option<LivenessMonitor>,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    epoch: u64,
}

impl ConnectionDriver {
    async fn run(mut self) {
        info!("Starting connection driver for {}", self.config.target);

        let mut flow = self.connect().await;
        while flow == Flow::Continue {
            flow = match self.next_event().await {
                DriverEvent::Command(Some(cmd)) => self.handle_command(cmd).await,
                DriverEvent::Command(None) => {
                    // Every handle is gone
                    self.shutdown().await;
                    Flow::Exit
                }
                DriverEvent::Frame(frame) => {
                    self.handle_frame(frame);
                    Flow::Continue
                }
                DriverEvent::LivenessCheck => {
                    self.check_liveness().await;
                    Flow::Continue
                }
                DriverEvent::ReconnectDue => {
                    self.reconnect_at = None;
                    self.connect().await
                }
            };
        }

        self.drain_commands();
        info!("Connection driver for {} stopped", self.config.target);
    }

    async fn next_event(&mut self) -> DriverEvent {
        if let Some(ws) = self.ws.as_mut() {
            let wake = self
                .liveness
                .as_ref()
                .map(LivenessMonitor::next_wakeup)
                .unwrap_or_else(|| deadline_after(Instant::now(), FAR_FUTURE));

            tokio::select! {
                cmd = self.cmd_rx.recv() => DriverEvent::Command(cmd),
                frame = ws.next() => DriverEvent::Frame(frame),
                _ = sleep_until(wake) => DriverEvent::LivenessCheck,
            }
        } else {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                cmd = self.cmd_rx.recv() => DriverEvent::Command(cmd),
                _ = async move {
                    match reconnect_at {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => DriverEvent::ReconnectDue,
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }

    /// Open a transport unless one is already open or opening
    async fn connect(&mut self) -> Flow {
        if self.shutting_down.load(Ordering::Acquire) {
            return Flow::Continue;
        }
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Open => {
                debug!("Connect requested while {}; ignoring", self.state());
                return Flow::Continue;
            }
            _ => {}
        }

        self.set_state(ConnectionState::Connecting);
        info!(
            "Attempting to connect to {} (attempt {})",
            self.config.target,
            self.reconnect_attempts + 1
        );

        let open = open_ws_with_timeout(self.config.target.clone(), self.config.connect_timeout);
        tokio::pin!(open);

        // Keep serving commands while the handshake is in progress
        let result = loop {
            tokio::select! {
                result = &mut open => break result,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send { id, .. }) => {
                        debug!("Request {} raced a reconnect; failing it", id);
                        self.table.resolve(id, Err(ExchangeError::ConnectionClosed));
                    }
                    Some(Command::Reconnect) => {
                        debug!("Reconnect requested while connecting; ignoring");
                    }
                    Some(Command::Shutdown { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return Flow::Exit;
                    }
                    None => {
                        self.shutdown().await;
                        return Flow::Exit;
                    }
                },
            }
        };

        match result {
            Ok(ws) => self.on_open(ws),
            Err(reason) => self.on_transport_lost(&reason),
        }
        Flow::Continue
    }

    fn on_open(&mut self, ws: WsStream) {
        self.epoch += 1;
        self.ws = Some(ws);
        self.reconnect_attempts = 0;
        self.reconnect_at = None;
        self.liveness = Some(LivenessMonitor::start(
            self.config.heartbeat_interval,
            self.config.pong_timeout,
            Instant::now(),
        ));

        self.stats.set_epoch(self.epoch);
        self.stats.set_reconnect_attempts(0);
        self.stats.record_connect();
        self.set_state(ConnectionState::Open);
        info!("Connected to {} (epoch {})", self.config.target, self.epoch);
    }

    /// Drop the transport and fail everything in flight with `error`.
    /// Returns whether a transport was open.
    fn teardown(&mut self, error: ExchangeError) -> bool {
        let was_open = self.ws.take().is_some();
        self.liveness = None;
        if was_open {
            self.stats.record_disconnect();
        }
        self.set_state(ConnectionState::Disconnected);
        self.table.fail_all(error);
        was_open
    }

    /// Transport closed, errored, timed out or failed to open
    fn on_transport_lost(&mut self, reason: &str) {
        if self.teardown(ExchangeError::ConnectionClosed) {
            warn!(
                "Connection to {} lost (epoch {}): {}",
                self.config.target, self.epoch, reason
            );
        } else {
            warn!("Failed to connect to {}: {}", self.config.target, reason);
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let max = self.config.max_reconnect_attempts;
        if self.reconnect_attempts >= max {
            self.reconnect_at = None;
            error!(
                "Giving up on {} after {} reconnection attempt(s); waiting for a forced reconnect",
                self.config.target, self.reconnect_attempts
            );
            return;
        }

        self.reconnect_attempts += 1;
        self.stats.set_reconnect_attempts(self.reconnect_attempts);
        let delay = self.config.reconnect_backoff.delay(self.reconnect_attempts);
        self.reconnect_at = Some(deadline_after(Instant::now(), delay));
        info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            self.config.target, delay, self.reconnect_attempts, max
        );
    }

    async fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Send { id, text } => {
                self.transmit(id, text).await;
                Flow::Continue
            }
            Command::Reconnect => self.force_reconnect().await,
            Command::Shutdown { done } => {
                self.shutdown().await;
                let _ = done.send(());
                Flow::Exit
            }
        }
    }

    async fn transmit(&mut self, id: RequestId, text: String) {
        if !self.table.contains(id) {
            debug!("Request {} resolved before it was written; skipping", id);
            return;
        }
        if self.ws.is_none() {
            debug!("Request {} arrived while disconnected; failing it", id);
            self.table.resolve(id, Err(ExchangeError::ConnectionClosed));
            return;
        }

        match self.write_frame(Message::text(text)).await {
            Ok(()) => trace!("Wrote request {}", id),
            Err(reason) => {
                self.on_transport_lost(&format!("failed to write request {}: {}", id, reason))
            }
        }
    }

    /// Write one frame on the open transport, bounded by the pong timeout.
    /// A peer that stops reading surfaces here as an error.
    async fn write_frame(&mut self, message: Message) -> Result<(), String> {
        let limit = self.config.pong_timeout;
        let Some(ws) = self.ws.as_mut() else {
            return Err("no open transport".to_string());
        };
        match tokio::time::timeout(limit, ws.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("write stalled for {:?}", limit)),
        }
    }

    async fn force_reconnect(&mut self) -> Flow {
        if self.shutting_down.load(Ordering::Acquire) {
            debug!("Ignoring reconnect request during shutdown");
            return Flow::Continue;
        }

        info!("Forced reconnect to {}", self.config.target);
        self.reconnect_attempts = 0;
        self.reconnect_at = None;
        self.stats.set_reconnect_attempts(0);

        if self.ws.is_some() {
            self.close_gracefully("reconnect").await;
            self.teardown(ExchangeError::ConnectionClosed);
        }
        self.connect().await
    }

    /// Send a normal-closure frame on the open transport, if any
    async fn close_gracefully(&mut self, reason: &str) {
        if self.ws.is_none() {
            return;
        }
        self.set_state(ConnectionState::Closing);

        if let Some(ws) = self.ws.as_mut() {
            match tokio::time::timeout(CLOSE_GRACE, ws.close(Some(normal_close(reason)))).await {
                Ok(Ok(())) => debug!("Sent close frame to {}", self.config.target),
                Ok(Err(e)) => debug!("Close frame to {} failed: {}", self.config.target, e),
                Err(_) => debug!("Close frame to {} timed out", self.config.target),
            }
        }
    }

    async fn shutdown(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        self.reconnect_at = None;
        info!("Shutting down connection to {}", self.config.target);

        self.close_gracefully("shutdown").await;
        self.teardown(ExchangeError::ShuttingDown);
    }

    /// Resolve whatever is still queued once the loop has exited
    fn drain_commands(&mut self) {
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Send { id, .. } => {
                    self.table.resolve(id, Err(ExchangeError::ShuttingDown));
                }
                Command::Shutdown { done } => {
                    let _ = done.send(());
                }
                Command::Reconnect => {}
            }
        }
    }

    fn handle_frame(&mut self, frame: Option<Result<Message, TransportError>>) {
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                self.on_transport_lost(&format!("transport error: {}", e));
                return;
            }
            None => {
                self.on_transport_lost("stream ended");
                return;
            }
        };

        if let Some(monitor) = self.liveness.as_mut() {
            monitor.observe(Instant::now());
        }

        match message {
            Message::Text(text) => self.route(relay_wire::decode(text.as_str())),
            Message::Binary(data) => self.route(relay_wire::decode_bytes(&data)),
            Message::Pong(payload) => {
                if let Some(rtt) = rtt_from_probe(&payload) {
                    self.stats.record_rtt(rtt);
                    debug!("Liveness probe RTT to {}: {:?}", self.config.target, rtt);
                }
            }
            // The transport queues the Pong reply itself
            Message::Ping(_) => trace!("Ping from {}", self.config.target),
            Message::Close(frame) => {
                let reason = match frame {
                    Some(f) => format!("closed by remote ({}): {}", u16::from(f.code), f.reason),
                    None => "closed by remote".to_string(),
                };
                self.on_transport_lost(&reason);
            }
            Message::Frame(_) => {}
        }
    }

    /// Route one parsed inbound envelope
    fn route(&mut self, parsed: Result<Envelope, WireError>) {
        match parsed {
            Ok(Envelope::Resp { id, resp }) => {
                if self.table.resolve(id, Ok(resp)) {
                    debug!("Resolved request {}", id);
                } else {
                    debug!("Dropping response for unknown request {}", id);
                }
            }
            Ok(Envelope::Error { id, err }) => {
                if self.table.resolve(id, Err(ExchangeError::RemoteError(err))) {
                    debug!("Request {} rejected by remote", id);
                } else {
                    debug!("Dropping error for unknown request {}", id);
                }
            }
            Ok(Envelope::Notif(payload)) => self.forward_notification(payload),
            Ok(Envelope::Req { id, .. }) => {
                warn!("Ignoring remote-initiated request {}", id);
            }
            Err(e) => {
                self.stats.record_malformed();
                warn!(
                    "Dropping inbound frame from {}: {}",
                    self.config.target,
                    ExchangeError::from(e)
                );
            }
        }
    }

    fn forward_notification(&self, payload: Value) {
        match &self.notifications {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    debug!("Notification receiver dropped; discarding notification");
                }
            }
            None => debug!("No notification sink configured, dropping notification"),
        }
    }

    async fn check_liveness(&mut self) {
        let now = Instant::now();
        let Some(monitor) = self.liveness.as_ref() else {
            return;
        };

        if monitor.is_expired(now) {
            let silent_for = now.saturating_duration_since(monitor.last_seen());
            warn!(
                "No traffic from {} for {:?}; dropping connection",
                self.config.target, silent_for
            );
            self.on_transport_lost("liveness timeout");
            return;
        }
        if !monitor.probe_due(now) {
            return;
        }

        match self.write_frame(Message::Ping(build_probe())).await {
            Ok(()) => {
                if let Some(monitor) = self.liveness.as_mut() {
                    monitor.on_probe_sent(now);
                }
                trace!("Sent liveness probe to {}", self.config.target);
            }
            Err(reason) => {
                self.on_transport_lost(&format!("failed to send liveness probe: {}", reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ExchangeCoordinator;
    use crate::correlation::PendingExchange;
    use crate::test_support::{
        eventually, spawn_refusing_listener, spawn_remote, spawn_silent_listener, test_config,
        Behavior,
    };
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = test_config("ws://127.0.0.1:1");
        config.target = "  ".to_string();
        assert!(Connection::new(config).start().is_err());
    }

    #[tokio::test]
    async fn test_connects_and_reports_open() {
        let remote = spawn_remote(Behavior::Echo).await;
        let handle = Connection::new(test_config(&remote.url)).start().unwrap();

        assert!(handle.wait_for_state(ConnectionState::Open, WAIT).await);
        let stats = handle.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.epoch, 1);
        assert_eq!(stats.reconnect_attempts, 0);
        assert_eq!(remote.accepted(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_fails_every_pending_exchange() {
        let remote = spawn_remote(Behavior::CloseAfter(3)).await;
        let handle = Connection::new(test_config(&remote.url)).start().unwrap();
        assert!(handle.wait_for_state(ConnectionState::Open, WAIT).await);
        let coordinator = ExchangeCoordinator::new(handle.clone());

        let mut tasks = Vec::new();
        for n in 0..3 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                coordinator
                    .submit("Quote", json!({"n": n}), Duration::from_secs(30), 0)
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Err(ExchangeError::ConnectionClosed));
        }
        assert_eq!(handle.in_flight(), 0);

        // A reconnect is scheduled and succeeds against the same remote
        assert!(eventually(WAIT, || handle.stats().connects == 2).await);
        let stats = handle.stats();
        assert_eq!(stats.disconnects, 1);
        assert_eq!(stats.epoch, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts_until_forced() {
        let (url, attempts) = spawn_refusing_listener().await;
        let mut config = test_config(&url);
        config.max_reconnect_attempts = 2;
        let handle = Connection::new(config).start().unwrap();

        // Initial attempt plus two reconnects
        assert!(eventually(WAIT, || attempts.load(Ordering::SeqCst) == 3).await);
        assert!(eventually(WAIT, || handle.state() == ConnectionState::Disconnected).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(handle.stats().reconnect_attempts, 2);

        // A forced reconnect clears the counter and walks the curve again
        handle.force_reconnect();
        assert!(eventually(WAIT, || attempts.load(Ordering::SeqCst) == 6).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_silent_remote_trips_liveness() {
        let remote = spawn_remote(Behavior::Stall).await;
        let mut config = test_config(&remote.url);
        config.heartbeat_interval = Duration::from_millis(100);
        config.pong_timeout = Duration::from_millis(100);
        let handle = Connection::new(config).start().unwrap();

        assert!(handle.wait_for_state(ConnectionState::Open, WAIT).await);
        assert!(handle.wait_for_state(ConnectionState::Disconnected, WAIT).await);
        assert_eq!(handle.stats().disconnects, 1);

        // Reconnection follows on the backoff curve
        assert!(eventually(WAIT, || remote.accepted() >= 2).await);
    }

    #[tokio::test]
    async fn test_responsive_remote_reports_rtt() {
        let remote = spawn_remote(Behavior::Echo).await;
        let mut config = test_config(&remote.url);
        config.heartbeat_interval = Duration::from_millis(50);
        config.pong_timeout = Duration::from_millis(500);
        let handle = Connection::new(config).start().unwrap();

        assert!(handle.wait_for_state(ConnectionState::Open, WAIT).await);
        assert!(eventually(WAIT, || handle.stats().last_rtt_ms.is_some()).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.state(), ConnectionState::Open);
        assert_eq!(handle.stats().disconnects, 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_with_shutting_down() {
        let remote = spawn_remote(Behavior::Silent).await;
        let handle = Connection::new(test_config(&remote.url)).start().unwrap();
        assert!(handle.wait_for_state(ConnectionState::Open, WAIT).await);
        let coordinator = ExchangeCoordinator::new(handle.clone());

        let pending = tokio::spawn(async move {
            coordinator
                .submit("Quote", json!({}), Duration::from_secs(30), 0)
                .await
        });
        assert!(eventually(WAIT, || handle.in_flight() == 1).await);

        handle.shutdown().await;
        assert_eq!(pending.await.unwrap(), Err(ExchangeError::ShuttingDown));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(handle.in_flight(), 0);

        // No reconnect after shutdown, and forcing one is ignored
        handle.force_reconnect();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(remote.accepted(), 1);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_force_reconnect_replaces_open_transport() {
        let remote = spawn_remote(Behavior::Echo).await;
        let handle = Connection::new(test_config(&remote.url)).start().unwrap();
        assert!(handle.wait_for_state(ConnectionState::Open, WAIT).await);

        handle.force_reconnect();
        assert!(eventually(WAIT, || handle.stats().epoch == 2).await);
        assert!(handle.wait_for_state(ConnectionState::Open, WAIT).await);
        assert_eq!(remote.accepted(), 2);
        assert_eq!(handle.stats().disconnects, 1);
    }

    #[tokio::test]
    async fn test_notifications_forwarded_and_malformed_dropped() {
        let notice = json!({"Notif": {"event": "halt", "symbol": "ABC"}});
        let remote = spawn_remote(Behavior::Greet(vec![
            "not json at all".to_string(),
            json!({"Bogus": 1}).to_string(),
            notice.to_string(),
            json!({"Req": {"id": 9, "req": {"Ping": null}}}).to_string(),
        ]))
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Connection::new(test_config(&remote.url))
            .with_notification_sender(tx)
            .start()
            .unwrap();

        let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
        assert_eq!(received, Some(json!({"event": "halt", "symbol": "ABC"})));
        assert_eq!(handle.stats().malformed_dropped, 2);

        // The connection survives junk and keeps serving requests
        let coordinator = ExchangeCoordinator::new(handle.clone());
        let reply = coordinator
            .submit("Ping", json!(1), Duration::from_secs(5), 0)
            .await;
        assert_eq!(reply, Ok(json!({"Ping": 1})));
        assert_eq!(handle.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_reset_stats_keeps_gauges() {
        let remote = spawn_remote(Behavior::Echo).await;
        let handle = Connection::new(test_config(&remote.url)).start().unwrap();
        assert!(handle.wait_for_state(ConnectionState::Open, WAIT).await);

        handle.reset_stats();
        let stats = handle.stats();
        assert_eq!(stats.connects, 0);
        assert_eq!(stats.epoch, 1);
    }

    #[tokio::test]
    async fn test_stalled_writes_drop_connection() {
        let remote = spawn_remote(Behavior::Stall).await;
        let mut config = test_config(&remote.url);
        config.heartbeat_interval = Duration::from_millis(100);
        config.pong_timeout = Duration::from_millis(100);
        let handle = Connection::new(config).start().unwrap();
        assert!(handle.wait_for_state(ConnectionState::Open, WAIT).await);
        let coordinator = ExchangeCoordinator::new(handle.clone());

        // Enough bytes to fill both socket buffers once the remote stops reading
        let blob = "x".repeat(4 << 20);
        let mut tasks = Vec::new();
        for n in 0..8 {
            let coordinator = coordinator.clone();
            let params = json!({"n": n, "blob": blob.clone()});
            tasks.push(tokio::spawn(async move {
                coordinator
                    .submit("Upload", params, Duration::from_secs(30), 0)
                    .await
            }));
        }
        for task in tasks {
            let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
            assert!(
                matches!(
                    result,
                    Err(ExchangeError::ConnectionClosed) | Err(ExchangeError::NotConnected)
                ),
                "unexpected result {:?}",
                result
            );
        }
        assert!(handle.stats().disconnects >= 1);

        tokio::time::timeout(WAIT, handle.shutdown()).await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(handle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_fails_abandoned_entries() {
        let remote = spawn_remote(Behavior::Silent).await;
        let mut config = test_config(&remote.url);
        config.sweep_interval = Duration::from_millis(50);
        config.stale_margin = Duration::from_millis(20);
        let handle = Connection::new(config).start().unwrap();
        assert!(handle.wait_for_state(ConnectionState::Open, WAIT).await);

        // Registered without a caller-side timer, so only the sweep resolves it
        let id = handle.allocate_id();
        let (pending, completion) = PendingExchange::new(
            id,
            "Quote",
            json!({}),
            Duration::from_millis(30),
            0,
            Duration::ZERO,
        );
        handle.table().insert(pending).unwrap();
        let text = Envelope::request(id, "Quote", json!({})).encode().unwrap();
        handle.transmit(id, text).unwrap();

        let result = tokio::time::timeout(WAIT, completion).await.unwrap().unwrap();
        assert_eq!(result, Err(ExchangeError::StaleRequest));
        assert!(eventually(WAIT, || handle.stats().stale_swept == 1).await);
        assert_eq!(handle.in_flight(), 0);
        assert_eq!(handle.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_with_connection_closed() {
        let (url, attempts) = spawn_refusing_listener().await;
        let mut config = test_config(&url);
        config.max_reconnect_attempts = 0;
        let handle = Connection::new(config).start().unwrap();
        assert!(eventually(WAIT, || attempts.load(Ordering::SeqCst) == 1).await);
        assert!(eventually(WAIT, || handle.state() == ConnectionState::Disconnected).await);

        let id = handle.allocate_id();
        let (pending, completion) = PendingExchange::new(
            id,
            "Quote",
            json!({}),
            Duration::from_secs(30),
            0,
            Duration::ZERO,
        );
        handle.table().insert(pending).unwrap();
        handle.transmit(id, "{}".to_string()).unwrap();

        let result = tokio::time::timeout(WAIT, completion).await.unwrap().unwrap();
        assert_eq!(result, Err(ExchangeError::ConnectionClosed));
        assert_eq!(handle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_send_while_connecting_fails_with_connection_closed() {
        let (url, accepted) = spawn_silent_listener().await;
        let mut config = test_config(&url);
        config.connect_timeout = Duration::from_secs(30);
        let handle = Connection::new(config).start().unwrap();
        assert!(eventually(WAIT, || accepted.load(Ordering::SeqCst) == 1).await);
        assert_eq!(handle.state(), ConnectionState::Connecting);

        let id = handle.allocate_id();
        let (pending, completion) = PendingExchange::new(
            id,
            "Quote",
            json!({}),
            Duration::from_secs(30),
            0,
            Duration::ZERO,
        );
        handle.table().insert(pending).unwrap();
        handle.transmit(id, "{}".to_string()).unwrap();

        let result = tokio::time::timeout(WAIT, completion).await.unwrap().unwrap();
        assert_eq!(result, Err(ExchangeError::ConnectionClosed));
        assert_eq!(handle.state(), ConnectionState::Connecting);

        // Shutdown abandons the handshake still in progress
        tokio::time::timeout(WAIT, handle.shutdown()).await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }
}
