//! Broadcast Controller - Idle ⇄ Broadcasting
//!
//! Features:
//! - Registers our advertisement and owns the discovery loop while broadcasting
//! - Presence updates re-advertise immediately when the metadata changed
//! - A periodic refresher picks up time-driven status decay (Editing → Idle → Away)
//! - Background tasks run on a child of the daemon's shutdown token

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeropr_core::{
    CursorPosition, Error, PeerRegistry, Presence, PresenceTracker, RepoInfo, Result,
};

use crate::discovery::{Advertisement, DiscoveryBackend, KEY_STATUS};
use crate::identity::LocalIdentity;
use crate::reconciler::{DiscoveryReconciler, ReconcilerConfig};

/// How long stop waits for the background tasks before aborting them
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub reconciler: ReconcilerConfig,
    /// Re-advertisement cadence for status decay
    pub presence_refresh: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerConfig::default(),
            presence_refresh: Duration::from_secs(15),
        }
    }
}

struct Active {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    advertised: Advertisement,
}

enum BroadcastState {
    Idle,
    Broadcasting(Active),
}

pub struct BroadcastController {
    backend: Arc<dyn DiscoveryBackend>,
    identity: Arc<LocalIdentity>,
    registry: Arc<PeerRegistry>,
    repo: RepoInfo,
    config: BroadcastConfig,
    shutdown: CancellationToken,
    tracker: Mutex<PresenceTracker>,
    state: Mutex<BroadcastState>,
}

impl BroadcastController {
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        identity: Arc<LocalIdentity>,
        registry: Arc<PeerRegistry>,
        repo: RepoInfo,
        config: BroadcastConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backend,
            identity,
            registry,
            repo,
            config,
            shutdown,
            tracker: Mutex::new(PresenceTracker::new()),
            state: Mutex::new(BroadcastState::Idle),
        }
    }

    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.identity
    }

    pub fn repo(&self) -> &RepoInfo {
        &self.repo
    }

    pub async fn is_broadcasting(&self) -> bool {
        matches!(*self.state.lock().await, BroadcastState::Broadcasting(_))
    }

    pub async fn presence(&self) -> Presence {
        self.tracker.lock().await.presence()
    }

    /// What we would advertise right now
    pub async fn current_advertisement(&self) -> Advertisement {
        let presence = self.presence().await;
        Advertisement::new(
            self.identity.name(),
            self.identity.port(),
            &presence,
            &self.repo,
        )
    }

    /// Register the advertisement and start discovery.
    ///
    /// On `RegistrationFailed` nothing is started and the state stays Idle.
    pub async fn start_broadcast(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(*state, BroadcastState::Broadcasting(_)) {
            return Err(Error::AlreadyBroadcasting);
        }

        let advertisement = self.current_advertisement().await;
        self.backend.register(&advertisement)?;

        let cancel = self.shutdown.child_token();
        let reconciler = DiscoveryReconciler::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.identity),
            Arc::clone(&self.registry),
            self.config.reconciler.clone(),
        );

        let tasks = vec![
            tokio::spawn(reconciler.run(cancel.clone())),
            tokio::spawn(Arc::clone(self).refresh_presence(cancel.clone())),
        ];

        *state = BroadcastState::Broadcasting(Active {
            cancel,
            tasks,
            advertised: advertisement,
        });

        info!(
            "📡 Broadcasting as {} on port {}",
            self.identity.name(),
            self.identity.port()
        );
        Ok(())
    }

    /// Withdraw the advertisement and stop discovery.
    ///
    /// Idempotent; returns whether a broadcast was actually stopped.
    pub async fn stop_broadcast(&self) -> bool {
        let active = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, BroadcastState::Idle) {
                BroadcastState::Idle => return false,
                BroadcastState::Broadcasting(active) => {
                    active.cancel.cancel();
                    if let Err(e) = self.backend.unregister() {
                        warn!("Failed to withdraw advertisement: {}", e);
                    }
                    active
                }
            }
        };

        // The refresher takes the state lock, so join only after releasing it
        for mut task in active.tasks {
            if tokio::time::timeout(TASK_STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }

        info!("🛑 Broadcast stopped");
        true
    }

    /// Process shutdown: stop broadcasting if active
    pub async fn shutdown(&self) {
        if self.stop_broadcast().await {
            debug!("Broadcast torn down on shutdown");
        }
    }

    /// Record local activity and push it to the network if it changed what we advertise
    pub async fn update_presence(
        &self,
        active_file: Option<String>,
        cursor: Option<CursorPosition>,
    ) -> Result<Presence> {
        let presence = {
            let mut tracker = self.tracker.lock().await;
            tracker.record_activity(active_file, cursor);
            tracker.presence()
        };

        self.readvertise().await?;
        Ok(presence)
    }

    /// Re-register if broadcasting and the metadata differs from what is advertised.
    ///
    /// Returns whether a new advertisement was registered.
    pub async fn readvertise(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let BroadcastState::Broadcasting(active) = &mut *state else {
            return Ok(false);
        };

        let advertisement = self.current_advertisement().await;
        if advertisement == active.advertised {
            return Ok(false);
        }

        self.backend.register(&advertisement)?;
        debug!(status = ?advertisement.properties.get(KEY_STATUS), "Re-advertised presence");
        active.advertised = advertisement;
        Ok(true)
    }

    async fn refresh_presence(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.presence_refresh) => {
                    if let Err(e) = self.readvertise().await {
                        warn!("Presence refresh failed: {}", e);
                    }
                }
            }
        }
    }
}
