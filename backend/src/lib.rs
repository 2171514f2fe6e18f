//! Duel Relay - Two-Player Session Relay Library
//!
//! Pairs exactly two game clients under a shared session token and forwards
//! their opaque binary messages to each other, so neither client ever learns
//! the other's network address.
//!
//! ## Protocol
//!
//! * A client opens a WebSocket on [`WS_PATH`]
//! * Its first message is the session token, used verbatim
//! * Every later message is relayed to whoever holds the session's other slot
//! * A third client on the same token is turned away with a close frame
//!
//! Moves are conventionally sent as 5-byte [`Move`] records, but payloads
//! are never inspected.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use duel_relay::{router, Registry, RelayConfig, RelayHandler};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Create shared state
//! let registry = Arc::new(Registry::new());
//!
//! // Create the relay handler
//! let handler = RelayHandler::new(registry, RelayConfig::default());
//!
//! // Serve it
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, router(handler)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod state;
pub mod transport;

// Re-export main types for convenience
pub use config::{Args, RelayConfig};
pub use error::{DecodeError, ForwardError, JoinError, RelayError, TransportError};
pub use handler::{RelayHandler, RelayStats};
pub use protocol::{CloseReason, Move, SessionToken, MOVE_LEN, WS_PATH};
pub use state::{ConnectionId, Membership, PeerHandle, Registry, RegistryStats, Session};
pub use transport::{router, PeerSocket, WsPeer};
