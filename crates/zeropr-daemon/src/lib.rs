//! ZeroPR Daemon - LAN presence and co-editing agent
//!
//! Features:
//! - mDNS advertisement with live presence in TXT records
//! - Discovery loop feeding a TTL-evicted peer registry
//! - HTTP API for peers, sessions, presence and shared files
//! - WebSocket relay per co-editing session
//! - Graceful shutdown on Ctrl-C / SIGTERM

pub mod broadcast;
pub mod config;
pub mod discovery;
pub mod files;
pub mod identity;
pub mod reconciler;
pub mod server;
pub mod state;

pub use broadcast::{BroadcastConfig, BroadcastController};
pub use config::DaemonConfig;
pub use discovery::{Advertisement, DiscoveryBackend, DiscoveryRecord, MdnsBackend};
pub use identity::LocalIdentity;
pub use reconciler::{DiscoveryReconciler, ReconcilerConfig};
pub use state::{DaemonState, DaemonStatus};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run the daemon until Ctrl-C or SIGTERM
pub async fn run(mut config: DaemonConfig) -> Result<()> {
    config.device_name = config::resolve_device_name(&config.device_name);

    // Without multicast sockets there is nothing to advertise on
    let mdns = Arc::new(MdnsBackend::new().context("Failed to start mDNS daemon")?);
    let backend: Arc<dyn DiscoveryBackend> = mdns.clone();

    let addr = format!("{}:{}", config.bind_addr, config.http_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let grace = config.shutdown_grace();
    let broadcast_on_start = config.broadcast_on_start;
    let state = Arc::new(DaemonState::new(config, backend));

    info!("🚀 ZeroPR agent {} starting as {}", state::VERSION, state.device_name());
    if !state.broadcast.repo().repo_hash.is_empty() {
        info!(
            "Repository {} on branch {}",
            state.broadcast.repo().repo_hash,
            state.broadcast.repo().branch
        );
    }

    if broadcast_on_start {
        if let Err(e) = state.broadcast.start_broadcast().await {
            error!("Failed to start broadcasting: {}", e);
        }
    }

    tokio::spawn(watch_signals(state.shutdown.clone()));

    if let Err(e) = server::serve(Arc::clone(&state), listener).await {
        error!("Server error: {}", e);
        state.shutdown.cancel();
    }

    info!("Shutting down...");
    let teardown = async {
        state.broadcast.shutdown().await;
        state.relay.close_all().await;
    };
    if tokio::time::timeout(grace, teardown).await.is_err() {
        warn!("Shutdown grace period of {:?} exceeded", grace);
    }
    mdns.shutdown();

    info!("👋 ZeroPR agent stopped");
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                    _ = shutdown.cancelled() => return,
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = shutdown.cancelled() => return,
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
