//! Relay connection handler.
//!
//! Each accepted connection runs [`RelayHandler::handle_connection`] on its
//! own task: read the session token, join the session, then relay every
//! payload to whoever holds the other slot until the connection ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, TransportError};
use crate::protocol::{CloseReason, Move, SessionToken};
use crate::state::{ConnectionId, Membership, PeerHandle, Registry, RegistryStats};
use crate::transport::PeerSocket;

/// Counters describing relay activity since startup.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    connections: AtomicU64,
    rejected: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    forward_failures: AtomicU64,
}

impl RelayMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Connections accepted.
    pub connections: u64,
    /// Joins refused because the session was full.
    pub rejected: u64,
    /// Payloads handed to a peer.
    pub forwarded: u64,
    /// Payloads dropped because the other slot was empty.
    pub dropped: u64,
    /// Payloads a peer could not take.
    pub forward_failures: u64,
}

/// Everything reported by the stats endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    #[serde(flatten)]
    pub registry: RegistryStats,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}

/// The relay protocol handler.
#[derive(Debug, Clone)]
pub struct RelayHandler {
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
    config: RelayConfig,
}

impl RelayHandler {
    /// Create a new relay handler.
    pub fn new(registry: Arc<Registry>, config: RelayConfig) -> Self {
        Self {
            registry,
            metrics: Arc::new(RelayMetrics::default()),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            registry: self.registry.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Handle a single client connection.
    ///
    /// Returns once the peer has left its session. A rejected join closes the
    /// socket and is returned as an error; a peer that simply disconnects is
    /// not an error.
    pub async fn handle_connection<S: PeerSocket>(&self, mut socket: S) -> Result<(), RelayError> {
        let conn = ConnectionId::next();
        RelayMetrics::incr(&self.metrics.connections);
        debug!(%conn, "New connection");

        // The first message names the session
        let first = timeout(self.config.idle_timeout, socket.recv())
            .await
            .map_err(|_| TransportError::Timeout)?;
        let token = match first? {
            Some(raw) => SessionToken::from(raw),
            None => {
                debug!(%conn, "Connection closed before sending a session token");
                return Ok(());
            }
        };

        let (tx, mut outbound) = mpsc::unbounded_channel();
        let membership = match self.registry.join(&token, PeerHandle::new(conn, tx)) {
            Ok(membership) => membership,
            Err(e) => {
                RelayMetrics::incr(&self.metrics.rejected);
                warn!(%conn, %token, "Rejecting peer: {}", e);
                if let Err(close_err) = socket.close(CloseReason::SessionFull).await {
                    debug!(%conn, "Failed to send close frame: {}", close_err);
                }
                return Err(e.into());
            }
        };
        info!(
            %conn,
            token = %membership.token(),
            slot = membership.slot(),
            "Peer joined session"
        );

        self.relay(conn, &mut socket, &membership, &mut outbound).await;

        drop(membership);
        info!(%conn, %token, "Peer left session");

        Ok(())
    }

    /// Pump payloads in both directions until this connection's receive side
    /// ends or its client stays silent for the idle timeout.
    async fn relay<S: PeerSocket>(
        &self,
        conn: ConnectionId,
        socket: &mut S,
        membership: &Membership,
        outbound: &mut mpsc::UnboundedReceiver<Bytes>,
    ) {
        // Only our own client's messages push this back
        let idle = sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                () = &mut idle => {
                    debug!(%conn, "Idle timeout");
                    break;
                }

                // Payloads queued for us by the other peer
                Some(payload) = outbound.recv() => {
                    if let Err(e) = socket.send(payload).await {
                        debug!(%conn, "Send failed: {}", e);
                        break;
                    }
                }

                // Payloads from our own client
                inbound = socket.recv() => {
                    match inbound {
                        Ok(Some(payload)) => {
                            idle.as_mut().reset(Instant::now() + self.config.idle_timeout);
                            self.forward(conn, membership, payload);
                        }
                        Ok(None) => {
                            debug!(%conn, "Connection closed");
                            break;
                        }
                        Err(e) => {
                            debug!(%conn, "Receive failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Hand one payload to the current occupant of the other slot.
    fn forward(&self, conn: ConnectionId, membership: &Membership, payload: Bytes) {
        if let Ok(mv) = Move::decode(&payload) {
            trace!(%conn, ?mv, "Relaying move");
        }

        let Some(peer) = membership.peer() else {
            RelayMetrics::incr(&self.metrics.dropped);
            trace!(%conn, "No peer in session, dropping payload");
            return;
        };

        match peer.forward(payload) {
            Ok(()) => RelayMetrics::incr(&self.metrics.forwarded),
            Err(e) => {
                RelayMetrics::incr(&self.metrics.forward_failures);
                debug!(%conn, peer = %peer.id(), "Forward failed: {}", e);
            }
        }
    }
}
