//! Discovery Reconciler - Turns browse results into a clean peer table
//!
//! One task, one cycle at a time:
//! refresh addresses → browse (bounded window) → drop self → upsert → evict → sleep.
//! Browse failures are logged and retried on the next cycle; only
//! cancellation ends the loop.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeropr_core::{CursorPosition, Peer, PeerRegistry, PresenceStatus};

use crate::discovery::{
    DiscoveryBackend, DiscoveryRecord, KEY_ACTIVE_FILE, KEY_BRANCH, KEY_CURSOR, KEY_REPO_HASH,
    KEY_STATUS, KEY_TRUSTED,
};
use crate::identity::LocalIdentity;

/// Cycle timing
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub browse_window: Duration,
    pub cycle_delay: Duration,
    /// Several advertisement intervals, so one missed cycle does not flap a peer
    pub peer_ttl: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            browse_window: Duration::from_secs(5),
            cycle_delay: Duration::from_secs(5),
            peer_ttl: Duration::from_secs(300),
        }
    }
}

/// Outcome of one discovery cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub seen: usize,
    pub skipped_self: usize,
    pub upserted: usize,
    pub evicted: usize,
    pub browse_failed: bool,
}

pub struct DiscoveryReconciler {
    backend: Arc<dyn DiscoveryBackend>,
    identity: Arc<LocalIdentity>,
    registry: Arc<PeerRegistry>,
    config: ReconcilerConfig,
}

impl DiscoveryReconciler {
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        identity: Arc<LocalIdentity>,
        registry: Arc<PeerRegistry>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            backend,
            identity,
            registry,
            config,
        }
    }

    /// Run cycles until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!("Starting peer discovery loop...");

        while !cancel.is_cancelled() {
            let report = self.run_cycle(&cancel).await;
            let known = self.registry.count().await;
            info!(
                seen = report.seen,
                upserted = report.upserted,
                evicted = report.evicted,
                "Browse cycle complete, {} peers known",
                known
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.cycle_delay) => {}
            }
        }

        info!("Discovery loop stopped");
    }

    /// One refresh → browse → filter → upsert → evict pass
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();
        self.identity.refresh().await;

        match self.backend.browse() {
            Ok(mut records) => {
                let window = tokio::time::sleep(self.config.browse_window);
                tokio::pin!(window);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = &mut window => break,
                        record = records.recv() => match record {
                            Some(record) => {
                                report.seen += 1;
                                match self.reconcile(record).await {
                                    Some(_) => report.upserted += 1,
                                    None => report.skipped_self += 1,
                                }
                            }
                            None => break,
                        },
                    }
                }
                self.backend.stop_browse();
            }
            Err(e) => {
                warn!(error = %e, "Browse failed, retrying next cycle");
                report.browse_failed = true;
            }
        }

        report.evicted = self.registry.evict(self.config.peer_ttl).await;
        report
    }

    /// Upsert one record unless it is our own advertisement.
    ///
    /// Returns the stored peer, or `None` when the record was dropped.
    pub async fn reconcile(&self, record: DiscoveryRecord) -> Option<Peer> {
        if self
            .identity
            .is_self(&record.instance, record.port, &record.addresses)
            .await
        {
            debug!("Skipping self: {}", record.instance);
            return None;
        }

        let Some(peer) = peer_from_record(&record) else {
            debug!("Discovered entry without address: {}", record.instance);
            return None;
        };

        debug!("Discovered peer: {} at {}:{}", peer.name, peer.address, peer.port);
        self.registry.upsert(peer.clone()).await;
        Some(peer)
    }
}

/// IPv4 preferred, lowest address first for a stable identifier
fn preferred_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    let mut sorted = addresses.to_vec();
    sorted.sort();
    sorted
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| sorted.first())
        .copied()
}

/// Build a peer from a record; missing TXT keys fall back to neutral values
pub fn peer_from_record(record: &DiscoveryRecord) -> Option<Peer> {
    let address = preferred_address(&record.addresses)?.to_string();
    let txt = |key: &str| {
        record
            .properties
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    };

    Some(Peer {
        id: Peer::make_id(&record.instance, &address, record.port),
        name: record.instance.clone(),
        address,
        port: record.port,
        repo_hash: txt(KEY_REPO_HASH).unwrap_or_default().to_string(),
        branch: txt(KEY_BRANCH).unwrap_or_default().to_string(),
        active_file: txt(KEY_ACTIVE_FILE).map(str::to_string),
        cursor: txt(KEY_CURSOR).and_then(CursorPosition::from_txt),
        status: txt(KEY_STATUS)
            .and_then(|s| s.parse().ok())
            .unwrap_or(PresenceStatus::Idle),
        last_seen: 0,
        trusted: txt(KEY_TRUSTED) == Some("true"),
    })
}
