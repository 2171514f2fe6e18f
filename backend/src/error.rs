//! Error types for the relay.
//!
//! None of these are process-fatal: each one ends (or is absorbed by) the
//! single connection that hit it.

use thiserror::Error;

use crate::protocol::SessionToken;

/// Errors that can occur while joining a session.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("session {token} already has two peers")]
    SessionFull { token: SessionToken },
}

/// Errors raised by a peer's transport channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting on the peer")]
    Timeout,

    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error("channel closed")]
    Closed,
}

/// Errors that can occur when handing a payload to the other peer.
///
/// These are never reported back to the sender.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("peer has disconnected")]
    Disconnected,
}

/// Errors that can occur while decoding a move record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid move length: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Errors that end a connection before it reaches the relay loop.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
