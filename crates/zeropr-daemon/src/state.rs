//! Daemon State - the component graph shared by every request
//!
//! Registry, sessions, relay and broadcast controller are built once here
//! and handed to the server behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zeropr_core::{PeerRegistry, Presence, RelayConfig, RepoInfo, SessionManager, SyncRelay};

use crate::broadcast::{BroadcastConfig, BroadcastController};
use crate::config::DaemonConfig;
use crate::discovery::DiscoveryBackend;
use crate::identity::LocalIdentity;
use crate::reconciler::ReconcilerConfig;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct DaemonState {
    pub config: DaemonConfig,
    pub registry: Arc<PeerRegistry>,
    pub sessions: Arc<SessionManager>,
    pub relay: Arc<SyncRelay>,
    pub broadcast: Arc<BroadcastController>,
    /// Root shutdown signal; broadcast tasks and relay sockets hang off it
    pub shutdown: CancellationToken,
}

/// Response body of `GET /api/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub running: bool,
    pub version: String,
    pub device_name: String,
    pub broadcasting: bool,
    pub peers_count: usize,
    pub active_sessions: usize,
    pub presence: Presence,
    pub repo_hash: String,
    pub branch: String,
}

impl DaemonState {
    pub fn new(config: DaemonConfig, backend: Arc<dyn DiscoveryBackend>) -> Self {
        let identity = LocalIdentity::new(config.device_name.clone(), config.http_port);
        Self::with_identity(config, backend, identity)
    }

    pub fn with_identity(
        config: DaemonConfig,
        backend: Arc<dyn DiscoveryBackend>,
        identity: LocalIdentity,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let registry = Arc::new(PeerRegistry::new());
        let sessions = Arc::new(SessionManager::new());
        let relay = Arc::new(SyncRelay::new(
            Arc::clone(&sessions),
            RelayConfig {
                queue_capacity: config.relay_queue_capacity,
                leave_grace: config.relay_leave_grace(),
            },
        ));

        let broadcast = Arc::new(BroadcastController::new(
            backend,
            Arc::new(identity),
            Arc::clone(&registry),
            RepoInfo::detect(&config.workspace),
            BroadcastConfig {
                reconciler: ReconcilerConfig {
                    browse_window: config.browse_window(),
                    cycle_delay: config.cycle_delay(),
                    peer_ttl: config.peer_ttl(),
                },
                presence_refresh: config.presence_refresh(),
            },
            shutdown.clone(),
        ));

        Self {
            config,
            registry,
            sessions,
            relay,
            broadcast,
            shutdown,
        }
    }

    pub fn device_name(&self) -> &str {
        self.broadcast.identity().name()
    }

    pub fn workspace(&self) -> &Path {
        &self.config.workspace
    }

    pub async fn status(&self) -> DaemonStatus {
        let repo = self.broadcast.repo();
        DaemonStatus {
            running: !self.shutdown.is_cancelled(),
            version: VERSION.to_string(),
            device_name: self.device_name().to_string(),
            broadcasting: self.broadcast.is_broadcasting().await,
            peers_count: self.registry.count().await,
            active_sessions: self.sessions.count().await,
            presence: self.broadcast.presence().await,
            repo_hash: repo.repo_hash.clone(),
            branch: repo.branch.clone(),
        }
    }
}
