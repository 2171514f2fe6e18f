//! WebSocket transport for the relay.
//!
//! [`PeerSocket`] is the seam between the relay loop and the wire; [`WsPeer`]
//! implements it over an axum WebSocket and applies the write deadline. The
//! idle deadline belongs to the relay loop, which knows what counts as
//! activity. [`router`] exposes the relay plus health and stats routes.

use std::future::Future;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use tokio::time::timeout;
use tracing::debug;

use crate::config::RelayConfig;
use crate::error::TransportError;
use crate::handler::{RelayHandler, RelayStats};
use crate::protocol::{CloseReason, WS_PATH};

/// One peer's duplex message channel.
pub trait PeerSocket: Send {
    /// Receive the next message. `Ok(None)` means the peer closed the channel.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>, TransportError>> + Send;

    /// Deliver one message to the peer.
    fn send(&mut self, payload: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tell the peer why the relay is hanging up.
    fn close(&mut self, reason: CloseReason)
        -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A [`PeerSocket`] over an upgraded WebSocket.
pub struct WsPeer {
    socket: WebSocket,
    write_timeout: Duration,
}

impl WsPeer {
    pub fn new(socket: WebSocket, config: &RelayConfig) -> Self {
        Self {
            socket,
            write_timeout: config.write_timeout,
        }
    }

    async fn write(&mut self, message: Message) -> Result<(), TransportError> {
        match timeout(self.write_timeout, self.socket.send(message)).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

/// What one received frame means to the relay.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Payload(Bytes),
    Closed,
    Control,
}

impl From<Message> for Inbound {
    fn from(message: Message) -> Self {
        match message {
            Message::Binary(data) => Inbound::Payload(data),
            // Clients may send text frames; the relay only cares about the bytes
            Message::Text(text) => Inbound::Payload(Bytes::from(text)),
            Message::Close(frame) => {
                debug!(?frame, "Peer sent close frame");
                Inbound::Closed
            }
            // Answered by the websocket layer
            Message::Ping(_) | Message::Pong(_) => Inbound::Control,
        }
    }
}

impl PeerSocket for WsPeer {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            let message = match self.socket.recv().await {
                Some(message) => message?,
                None => return Ok(None),
            };

            match Inbound::from(message) {
                Inbound::Payload(data) => return Ok(Some(data)),
                Inbound::Closed => return Ok(None),
                Inbound::Control => continue,
            }
        }
    }

    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.write(Message::Binary(payload)).await
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: reason.code(),
            reason: reason.to_string().into(),
        };
        self.write(Message::Close(Some(frame))).await
    }
}

/// Build the relay's HTTP router.
///
/// Routes:
/// - GET /ws -> WebSocket relay
/// - GET /health -> 200 OK "ok"
/// - GET /stats -> JSON [`RelayStats`]
pub fn router(handler: RelayHandler) -> Router {
    Router::new()
        .route(WS_PATH, get(upgrade))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(handler)
}

async fn upgrade(State(handler): State<RelayHandler>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(handler.config().max_message_size)
        .on_upgrade(move |socket| async move {
            let peer = WsPeer::new(socket, handler.config());
            if let Err(e) = handler.handle_connection(peer).await {
                debug!("Connection ended with error: {}", e);
            }
        })
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn stats(State(handler): State<RelayHandler>) -> Json<RelayStats> {
    Json(handler.stats())
}
