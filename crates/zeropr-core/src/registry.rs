//! Peer Registry - TTL-evicted table of discovered peers
//!
//! Features:
//! - Upsert by peer id, last-seen stamped here (never trusted from callers)
//! - Snapshot listing, no lock held by the caller
//! - TTL eviction on the monotonic clock, safe against concurrent upserts

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::peer::{unix_millis, Peer};

struct Entry {
    peer: Peer,
    seen_at: Instant,
}

/// Concurrent store of known peers
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Entry>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer, refreshing its last-seen time
    pub async fn upsert(&self, mut peer: Peer) {
        let mut peers = self.peers.write().await;
        peer.last_seen = unix_millis();
        let id = peer.id.clone();
        peers.insert(
            id,
            Entry {
                peer,
                seen_at: Instant::now(),
            },
        );
    }

    pub async fn get(&self, id: &str) -> Option<Peer> {
        self.peers.read().await.get(id).map(|e| e.peer.clone())
    }

    /// Snapshot of every peer, sorted by id
    pub async fn get_all(&self) -> Vec<Peer> {
        let mut all: Vec<Peer> = self
            .peers
            .read()
            .await
            .values()
            .map(|e| e.peer.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn remove(&self, id: &str) -> Option<Peer> {
        self.peers.write().await.remove(id).map(|e| e.peer)
    }

    /// Drop every peer whose last-seen age reached `ttl`; returns how many were removed
    pub async fn evict(&self, ttl: Duration) -> usize {
        let mut peers = self.peers.write().await;
        // Sampled under the write lock: nothing upserted after this point is older than now
        let now = Instant::now();
        let before = peers.len();
        peers.retain(|id, entry| {
            let keep = now.saturating_duration_since(entry.seen_at) < ttl;
            if !keep {
                debug!(peer = %id, "Evicting stale peer");
            }
            keep
        });
        before - peers.len()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PresenceStatus;
    use std::sync::Arc;

    fn peer(name: &str) -> Peer {
        Peer {
            id: Peer::make_id(name, "10.0.0.5", 8080),
            name: name.to_string(),
            address: "10.0.0.5".into(),
            port: 8080,
            repo_hash: String::new(),
            branch: String::new(),
            active_file: None,
            cursor: None,
            status: PresenceStatus::Idle,
            last_seen: 0,
            trusted: false,
        }
    }

    #[tokio::test]
    async fn test_upsert_same_id_twice() {
        let registry = PeerRegistry::new();
        registry.upsert(peer("alice")).await;
        assert_eq!(registry.count().await, 1);

        let mut updated = peer("alice");
        updated.branch = "main".into();
        registry.upsert(updated).await;

        assert_eq!(registry.count().await, 1);
        let stored = registry.get("alice@10.0.0.5:8080").await.unwrap();
        assert_eq!(stored.branch, "main");
    }

    #[tokio::test]
    async fn test_last_seen_is_stamped_by_registry() {
        let registry = PeerRegistry::new();
        let mut p = peer("alice");
        p.last_seen = u64::MAX;
        registry.upsert(p).await;

        let stored = registry.get("alice@10.0.0.5:8080").await.unwrap();
        assert!(stored.last_seen <= unix_millis());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_and_keep_fresh() {
        let registry = PeerRegistry::new();
        let ttl = Duration::from_secs(300);

        registry.upsert(peer("stale")).await;
        tokio::time::advance(Duration::from_secs(200)).await;
        registry.upsert(peer("fresh")).await;
        tokio::time::advance(Duration::from_secs(101)).await;

        let removed = registry.evict(ttl).await;

        assert_eq!(removed, 1);
        assert!(registry.get("stale@10.0.0.5:8080").await.is_none());
        assert!(registry.get("fresh@10.0.0.5:8080").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_retention() {
        let registry = PeerRegistry::new();
        let ttl = Duration::from_secs(300);

        registry.upsert(peer("alice")).await;
        tokio::time::advance(Duration::from_secs(250)).await;
        registry.upsert(peer("alice")).await;
        tokio::time::advance(Duration::from_secs(250)).await;

        assert_eq!(registry.evict(ttl).await, 0);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_and_snapshot() {
        let registry = Arc::new(PeerRegistry::new());
        registry.upsert(peer("bob")).await;
        registry.upsert(peer("alice")).await;

        let snapshot = registry.get_all().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "alice");

        // Mutating while holding a snapshot never blocks or changes it
        assert!(registry.remove("alice@10.0.0.5:8080").await.is_some());
        assert!(registry.remove("alice@10.0.0.5:8080").await.is_none());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_with_evict() {
        let registry = Arc::new(PeerRegistry::new());
        let mut handles = Vec::new();

        for i in 0..20 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.upsert(peer(&format!("peer{}", i))).await;
                registry.evict(Duration::from_secs(300)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.count().await, 20);
    }
}
