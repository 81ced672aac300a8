//! WebSocket transport for the relay session.
//!
//! Plain `ws://` targets are always supported; `wss://` requires the `tls`
//! feature.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Client-side WebSocket stream
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport-level failure while opening or using the socket
pub type TransportError = tokio_tungstenite::tungstenite::Error;

/// Open a WebSocket to `target`
pub async fn open_ws(target: String) -> Result<WsStream, TransportError> {
    let (stream, response) = connect_async(target.as_str()).await?;
    debug!(
        "WebSocket handshake with {} completed (status {})",
        target,
        response.status()
    );
    Ok(stream)
}

/// Open a WebSocket, giving up after `limit`
pub async fn open_ws_with_timeout(target: String, limit: Duration) -> Result<WsStream, String> {
    match tokio::time::timeout(limit, open_ws(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(format!("connection failed: {}", e)),
        Err(_) => Err(format!("connection timeout ({:?})", limit)),
    }
}

/// Close frame with the normal-closure code
pub fn normal_close(reason: &str) -> CloseFrame {
    CloseFrame {
        code: CloseCode::Normal,
        reason: reason.to_string().into(),
    }
}
