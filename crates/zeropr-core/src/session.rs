//! Session Manager - Co-editing session lifecycle
//!
//! A session always has at least one participant: the leave that removes
//! the last one deletes the session under the same write lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Error, Result};
use crate::peer::unix_millis;

/// A co-editing session on one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub file_path: String,
    /// Join order, no duplicates
    pub participants: Vec<String>,
    pub initiator: String,
    /// Unix millis
    pub created_at: u64,
}

impl Session {
    pub fn has_participant(&self, participant_id: &str) -> bool {
        self.participants.iter().any(|p| p == participant_id)
    }
}

/// Manages active sessions
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    next_seq: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp plus a per-manager counter, so bursts never collide
    fn next_id(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("session-{}-{}", nanos, seq)
    }

    /// Create a session with the initiator as its only participant
    pub async fn create_session(
        &self,
        file_path: impl Into<String>,
        initiator: impl Into<String>,
    ) -> Session {
        let initiator = initiator.into();
        let session = Session {
            id: self.next_id(),
            file_path: file_path.into(),
            participants: vec![initiator.clone()],
            initiator,
            created_at: unix_millis(),
        };

        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        info!(session = %session.id, file = %session.file_path, "Created session");
        session
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Snapshot of every session, oldest first
    pub async fn get_all_sessions(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Add a participant; joining twice is a no-op
    pub async fn join_session(&self, id: &str, participant_id: &str) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        if !session.has_participant(participant_id) {
            session.participants.push(participant_id.to_string());
            info!(session = %id, participant = %participant_id, "Participant joined");
        }
        Ok(session.clone())
    }

    /// Remove a participant. Returns whether the session still exists afterwards.
    pub async fn leave_session(&self, id: &str, participant_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        let before = session.participants.len();
        session.participants.retain(|p| p != participant_id);
        if session.participants.len() < before {
            info!(session = %id, participant = %participant_id, "Participant left");
        }

        if session.participants.is_empty() {
            sessions.remove(id);
            info!(session = %id, "Session closed, no participants left");
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_session() {
        let manager = SessionManager::new();
        let created = manager.create_session("src/app.ts", "alice").await;

        let all = manager.get_all_sessions().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], created);
        assert_eq!(all[0].participants, vec!["alice".to_string()]);
        assert_eq!(all[0].initiator, "alice");
        assert_eq!(all[0].file_path, "src/app.ts");
    }

    #[tokio::test]
    async fn test_join_unknown_session() {
        let manager = SessionManager::new();
        let existing = manager.create_session("src/app.ts", "alice").await;

        let err = manager.join_session("session-missing", "bob").await.unwrap_err();
        assert_eq!(err, Error::SessionNotFound("session-missing".into()));

        let all = manager.get_all_sessions().await;
        assert_eq!(all, vec![existing]);
    }

    #[tokio::test]
    async fn test_join_is_idempotent_and_ordered() {
        let manager = SessionManager::new();
        let session = manager.create_session("src/app.ts", "alice").await;

        manager.join_session(&session.id, "bob").await.unwrap();
        manager.join_session(&session.id, "carol").await.unwrap();
        let joined = manager.join_session(&session.id, "bob").await.unwrap();

        assert_eq!(joined.participants, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_leave_last_participant_deletes_session() {
        let manager = SessionManager::new();
        let session = manager.create_session("src/app.ts", "alice").await;
        manager.join_session(&session.id, "bob").await.unwrap();

        assert!(manager.leave_session(&session.id, "alice").await.unwrap());
        assert!(manager.get_session(&session.id).await.is_some());

        assert!(!manager.leave_session(&session.id, "bob").await.unwrap());
        assert!(manager.get_session(&session.id).await.is_none());
        assert_eq!(manager.count().await, 0);

        let err = manager.leave_session(&session.id, "bob").await.unwrap_err();
        assert_eq!(err, Error::SessionNotFound(session.id.clone()));
    }

    #[tokio::test]
    async fn test_leave_non_member_keeps_session() {
        let manager = SessionManager::new();
        let session = manager.create_session("src/app.ts", "alice").await;

        assert!(manager.leave_session(&session.id, "mallory").await.unwrap());
        let stored = manager.get_session(&session.id).await.unwrap();
        assert_eq!(stored.participants, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_ids_unique_under_burst() {
        let manager = Arc::new(SessionManager::new());
        let mut handles = Vec::new();

        for i in 0..64 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.create_session("src/app.ts", format!("user{}", i)).await.id
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 64);
        assert_eq!(manager.count().await, 64);
    }
}
