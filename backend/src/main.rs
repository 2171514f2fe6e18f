//! Duel Relay - Two-Player Session Relay
//!
//! Pairs two game clients under a shared session token and relays their
//! moves over WebSocket.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use duel_relay::{router, Args, Registry, RelayHandler};

/// Spawn a background task to periodically log relay statistics.
fn spawn_stats_task(handler: RelayHandler, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let stats = handler.stats();
            info!(
                sessions = stats.registry.sessions,
                peers = stats.registry.peers,
                connections = stats.metrics.connections,
                rejected = stats.metrics.rejected,
                forwarded = stats.metrics.forwarded,
                dropped = stats.metrics.dropped,
                forward_failures = stats.metrics.forward_failures,
                "Relay stats"
            );
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("duel_relay=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Create shared state
    let registry = Arc::new(Registry::new());
    let handler = RelayHandler::new(registry, args.relay_config());

    if let Some(interval) = args.stats_interval() {
        spawn_stats_task(handler.clone(), interval);
    }

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    info!("Relay listening on {}", listener.local_addr()?);
    info!("Press Ctrl+C to stop");

    axum::serve(listener, router(handler))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");

    Ok(())
}
