//! Wire-level types for the relay.
//!
//! The first WebSocket message a client sends is its session token, taken
//! verbatim. Every later message is an opaque payload relayed to the other
//! peer. Moves are conventionally encoded as 5-byte [`Move`] records, but the
//! relay never requires it.

use std::fmt;

use bytes::Bytes;

use crate::error::DecodeError;

/// The HTTP path that upgrades to the relay.
pub const WS_PATH: &str = "/ws";

/// Size in bytes of an encoded [`Move`].
pub const MOVE_LEN: usize = 5;

/// Opaque, client-chosen identifier that pairs two peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(Bytes);

impl SessionToken {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&'static str> for SessionToken {
    fn from(raw: &'static str) -> Self {
        Self(Bytes::from_static(raw.as_bytes()))
    }
}

impl From<Bytes> for SessionToken {
    fn from(raw: Bytes) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Why the relay closed a connection on its own initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The session already holds two peers.
    SessionFull,
}

impl CloseReason {
    /// WebSocket close code sent with this reason.
    pub fn code(self) -> u16 {
        match self {
            // Policy violation
            CloseReason::SessionFull => 1008,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::SessionFull => write!(f, "session full"),
        }
    }
}

/// A single game move: which piece, and the square it travels between.
///
/// Encoded as five bytes in field order with no padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Move {
    pub piece: u8,
    pub from_x: u8,
    pub from_y: u8,
    pub to_x: u8,
    pub to_y: u8,
}

impl Move {
    pub fn encode(&self) -> [u8; MOVE_LEN] {
        [self.piece, self.from_x, self.from_y, self.to_x, self.to_y]
    }

    /// Decode a move from exactly [`MOVE_LEN`] bytes.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let raw: [u8; MOVE_LEN] = data.try_into().map_err(|_| DecodeError::Length {
            expected: MOVE_LEN,
            actual: data.len(),
        })?;
        Ok(Self::from(raw))
    }
}

impl From<[u8; MOVE_LEN]> for Move {
    fn from([piece, from_x, from_y, to_x, to_y]: [u8; MOVE_LEN]) -> Self {
        Self {
            piece,
            from_x,
            from_y,
            to_x,
            to_y,
        }
    }
}

impl TryFrom<&[u8]> for Move {
    type Error = DecodeError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        Self::decode(data)
    }
}

impl From<Move> for Bytes {
    fn from(mv: Move) -> Self {
        Bytes::copy_from_slice(&mv.encode())
    }
}
