//! Sync Relay - Per-session fan-out of opaque payloads
//!
//! ```text
//! Conn A ──┐                         ┌──> Conn B
//!           ├── Group (session id) ──┤
//! Conn C ──┘                         └──> Conn C   (never back to the sender)
//! ```
//!
//! Features:
//! - One lock per session group, groups never contend with each other
//! - Bounded per-connection queue: a stalled reader is dropped, not waited on
//! - Per-sender FIFO order to every recipient
//! - Disconnect without leave converges to a leave after a grace period;
//!   a reattach, join or explicit leave voids the pending one

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{Session, SessionManager};

/// Opaque sync payload, shared between all recipients
pub type Payload = Arc<Vec<u8>>;

/// Relay tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Messages buffered per connection before it is considered stalled
    pub queue_capacity: usize,
    /// How long a participant may stay disconnected before it is removed
    pub leave_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            leave_grace: Duration::from_secs(30),
        }
    }
}

/// Handle for one attached transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConnection {
    id: u64,
    session_id: String,
    participant_id: String,
}

impl RelayConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }
}

struct Member {
    conn_id: u64,
    participant_id: String,
    tx: mpsc::Sender<Payload>,
}

#[derive(Default)]
struct Group {
    members: Vec<Member>,
}

impl Group {
    fn has_participant(&self, participant_id: &str) -> bool {
        self.members.iter().any(|m| m.participant_id == participant_id)
    }
}

type MemberKey = (String, String);

/// Fan-out groups keyed by session id
pub struct SyncRelay {
    sessions: Arc<SessionManager>,
    groups: RwLock<HashMap<String, Arc<Mutex<Group>>>>,
    /// Ticket of the deferred leave armed for each disconnected participant.
    /// Membership changes go through this lock so a stale timer cannot undo them.
    pending_leaves: Mutex<HashMap<MemberKey, u64>>,
    next_conn: AtomicU64,
    next_ticket: AtomicU64,
    config: RelayConfig,
}

impl SyncRelay {
    pub fn new(sessions: Arc<SessionManager>, config: RelayConfig) -> Self {
        Self {
            sessions,
            groups: RwLock::new(HashMap::new()),
            pending_leaves: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    async fn group(&self, session_id: &str) -> Option<Arc<Mutex<Group>>> {
        self.groups.read().await.get(session_id).cloned()
    }

    async fn group_or_create(&self, session_id: &str) -> Arc<Mutex<Group>> {
        if let Some(group) = self.group(session_id).await {
            return group;
        }

        let mut groups = self.groups.write().await;
        groups
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Group::default())))
            .clone()
    }

    /// Join a transport to the session's fan-out group.
    ///
    /// Returns the connection handle and the queue the transport must drain.
    pub async fn attach(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<(RelayConnection, mpsc::Receiver<Payload>)> {
        if !self.sessions.contains(session_id).await {
            return Err(Error::ConnectionRejected(session_id.to_string()));
        }

        let group = self.group_or_create(session_id).await;
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let conn = RelayConnection {
            id: self.next_conn.fetch_add(1, Ordering::Relaxed),
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
        };

        group.lock().await.members.push(Member {
            conn_id: conn.id,
            participant_id: conn.participant_id.clone(),
            tx,
        });

        // The session may have closed between the check and the insert
        if !self.sessions.contains(session_id).await {
            self.discard_member(&group, session_id, conn.id).await;
            return Err(Error::ConnectionRejected(session_id.to_string()));
        }

        self.pending_leaves
            .lock()
            .await
            .remove(&member_key(session_id, participant_id));

        info!(
            session = %session_id,
            participant = %participant_id,
            conn = conn.id,
            "Relay connection attached"
        );
        Ok((conn, rx))
    }

    /// Undo an attach that raced with the session closing
    async fn discard_member(&self, group: &Arc<Mutex<Group>>, session_id: &str, conn_id: u64) {
        let emptied = {
            let mut group = group.lock().await;
            group.members.retain(|m| m.conn_id != conn_id);
            group.members.is_empty()
        };
        if !emptied || self.sessions.contains(session_id).await {
            return;
        }

        let mut groups = self.groups.write().await;
        if groups
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, group))
        {
            groups.remove(session_id);
        }
    }

    /// Deliver `payload` to every other connection of the sender's group.
    ///
    /// Returns the number of connections the payload was queued for.
    pub async fn dispatch(&self, sender: &RelayConnection, payload: Payload) -> usize {
        let Some(group) = self.group(&sender.session_id).await else {
            return 0;
        };

        let mut group = group.lock().await;
        let mut delivered = 0;

        group.members.retain(|member| {
            if member.conn_id == sender.id {
                return true;
            }
            match member.tx.try_send(Arc::clone(&payload)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        session = %sender.session_id,
                        participant = %member.participant_id,
                        conn = member.conn_id,
                        "Dropping stalled relay connection"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn = member.conn_id, "Relay connection already closed");
                    false
                }
            }
        });

        debug!(
            session = %sender.session_id,
            conn = sender.id,
            bytes = payload.len(),
            delivered,
            "Relayed payload"
        );
        delivered
    }

    /// Remove a connection from its group.
    ///
    /// If it was the participant's last connection, a leave is applied after
    /// the grace period unless the participant reattaches first.
    pub async fn detach(self: &Arc<Self>, conn: &RelayConnection) {
        let still_connected = match self.group(&conn.session_id).await {
            Some(group) => {
                let mut group = group.lock().await;
                group.members.retain(|m| m.conn_id != conn.id);
                group.has_participant(&conn.participant_id)
            }
            None => false,
        };

        info!(
            session = %conn.session_id,
            participant = %conn.participant_id,
            conn = conn.id,
            "Relay connection detached"
        );

        if !still_connected {
            self.schedule_leave(conn.session_id.clone(), conn.participant_id.clone())
                .await;
        }
    }

    async fn schedule_leave(self: &Arc<Self>, session_id: String, participant_id: String) {
        let key = (session_id, participant_id);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        // Replaces any older timer for this participant
        self.pending_leaves.lock().await.insert(key.clone(), ticket);

        let relay = Arc::clone(self);
        let grace = self.config.leave_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let mut pending = relay.pending_leaves.lock().await;
            if pending.get(&key) != Some(&ticket) {
                return;
            }
            pending.remove(&key);

            let (session_id, participant_id) = &key;
            if relay.is_connected(session_id, participant_id).await {
                return;
            }
            match relay.apply_leave(&mut pending, session_id, participant_id).await {
                Ok(_) => info!(
                    session = %session_id,
                    participant = %participant_id,
                    "Removed disconnected participant"
                ),
                // Session already gone
                Err(Error::SessionNotFound(_)) => {}
                Err(e) => warn!(session = %session_id, error = %e, "Deferred leave failed"),
            }
        });
    }

    /// Add a participant to the session, voiding any pending deferred leave
    pub async fn join(&self, session_id: &str, participant_id: &str) -> Result<Session> {
        let mut pending = self.pending_leaves.lock().await;
        let session = self.sessions.join_session(session_id, participant_id).await?;
        pending.remove(&member_key(session_id, participant_id));
        Ok(session)
    }

    /// Explicit leave: updates the session and drops the participant's connections.
    ///
    /// Returns whether the session still exists.
    pub async fn leave(&self, session_id: &str, participant_id: &str) -> Result<bool> {
        let mut pending = self.pending_leaves.lock().await;
        self.apply_leave(&mut pending, session_id, participant_id).await
    }

    async fn apply_leave(
        &self,
        pending: &mut HashMap<MemberKey, u64>,
        session_id: &str,
        participant_id: &str,
    ) -> Result<bool> {
        let exists = self.sessions.leave_session(session_id, participant_id).await?;
        pending.remove(&member_key(session_id, participant_id));

        if exists {
            if let Some(group) = self.group(session_id).await {
                group
                    .lock()
                    .await
                    .members
                    .retain(|m| m.participant_id != participant_id);
            }
        } else {
            pending.retain(|(session, _), _| session != session_id);
            // Dropping the senders ends every transport of the closed session
            self.groups.write().await.remove(session_id);
        }
        Ok(exists)
    }

    pub async fn is_connected(&self, session_id: &str, participant_id: &str) -> bool {
        match self.group(session_id).await {
            Some(group) => group.lock().await.has_participant(participant_id),
            None => false,
        }
    }

    pub async fn connection_count(&self, session_id: &str) -> usize {
        match self.group(session_id).await {
            Some(group) => group.lock().await.members.len(),
            None => 0,
        }
    }

    /// Drop every group; used on shutdown so all transports close
    pub async fn close_all(&self) {
        self.pending_leaves.lock().await.clear();
        let mut groups = self.groups.write().await;
        let count = groups.len();
        groups.clear();
        info!("Closed {} relay groups", count);
    }
}

fn member_key(session_id: &str, participant_id: &str) -> MemberKey {
    (session_id.to_string(), participant_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn relay_with(sessions: Arc<SessionManager>, config: RelayConfig) -> Arc<SyncRelay> {
        Arc::new(SyncRelay::new(sessions, config))
    }

    #[tokio::test]
    async fn test_fan_out_excludes_sender() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(Arc::clone(&sessions), RelayConfig::default());

        let s1 = sessions.create_session("src/app.ts", "alice").await;
        sessions.join_session(&s1.id, "bob").await.unwrap();

        let (a, mut a_rx) = relay.attach(&s1.id, "alice").await.unwrap();
        let (_b, mut b_rx) = relay.attach(&s1.id, "bob").await.unwrap();

        let delivered = relay.dispatch(&a, Arc::new(vec![1, 2, 3])).await;

        assert_eq!(delivered, 1);
        assert_eq!(*b_rx.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(a_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn test_attach_unknown_session_rejected() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(sessions, RelayConfig::default());

        let err = relay.attach("session-missing", "alice").await.unwrap_err();
        assert_eq!(err, Error::ConnectionRejected("session-missing".into()));
        assert_eq!(relay.connection_count("session-missing").await, 0);
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(Arc::clone(&sessions), RelayConfig::default());

        let s1 = sessions.create_session("src/a.ts", "alice").await;
        let s2 = sessions.create_session("src/b.ts", "carol").await;

        let (a, _a_rx) = relay.attach(&s1.id, "alice").await.unwrap();
        let (_c, mut c_rx) = relay.attach(&s2.id, "carol").await.unwrap();

        assert_eq!(relay.dispatch(&a, Arc::new(vec![9])).await, 0);
        assert_eq!(c_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn test_per_sender_order_preserved() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(Arc::clone(&sessions), RelayConfig::default());
        let s1 = sessions.create_session("src/app.ts", "alice").await;

        let (a, _a_rx) = relay.attach(&s1.id, "alice").await.unwrap();
        let (_b, mut b_rx) = relay.attach(&s1.id, "bob").await.unwrap();

        for i in 0..50u8 {
            relay.dispatch(&a, Arc::new(vec![i])).await;
        }
        for i in 0..50u8 {
            assert_eq!(*b_rx.recv().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_stalled_connection_is_dropped() {
        let sessions = Arc::new(SessionManager::new());
        let config = RelayConfig {
            queue_capacity: 1,
            ..RelayConfig::default()
        };
        let relay = relay_with(Arc::clone(&sessions), config);
        let s1 = sessions.create_session("src/app.ts", "alice").await;

        let (a, _a_rx) = relay.attach(&s1.id, "alice").await.unwrap();
        let (_slow, mut slow_rx) = relay.attach(&s1.id, "bob").await.unwrap();
        let (_fast, mut fast_rx) = relay.attach(&s1.id, "carol").await.unwrap();

        assert_eq!(relay.dispatch(&a, Arc::new(vec![1])).await, 2);
        assert_eq!(*fast_rx.recv().await.unwrap(), vec![1]);

        // bob never drained his queue
        assert_eq!(relay.dispatch(&a, Arc::new(vec![2])).await, 1);
        assert_eq!(*fast_rx.recv().await.unwrap(), vec![2]);
        assert_eq!(relay.connection_count(&s1.id).await, 2);

        assert_eq!(*slow_rx.recv().await.unwrap(), vec![1]);
        assert!(slow_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_converges_to_leave() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(Arc::clone(&sessions), RelayConfig::default());
        let s1 = sessions.create_session("src/app.ts", "alice").await;
        sessions.join_session(&s1.id, "bob").await.unwrap();

        let (b, _b_rx) = relay.attach(&s1.id, "bob").await.unwrap();
        relay.detach(&b).await;

        // Group emptied, session untouched until the grace period passes
        assert_eq!(relay.connection_count(&s1.id).await, 0);
        assert!(sessions.get_session(&s1.id).await.is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;

        let session = sessions.get_session(&s1.id).await.unwrap();
        assert_eq!(session.participants, vec!["alice"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_within_grace_keeps_membership() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(Arc::clone(&sessions), RelayConfig::default());
        let s1 = sessions.create_session("src/app.ts", "alice").await;

        let (a, _rx) = relay.attach(&s1.id, "alice").await.unwrap();
        relay.detach(&a).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        let (_a2, _rx2) = relay.attach(&s1.id, "alice").await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(sessions.get_session(&s1.id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_after_leave_survives_grace() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(Arc::clone(&sessions), RelayConfig::default());
        let s1 = sessions.create_session("src/app.ts", "alice").await;
        sessions.join_session(&s1.id, "bob").await.unwrap();

        let (b, _b_rx) = relay.attach(&s1.id, "bob").await.unwrap();
        relay.leave(&s1.id, "bob").await.unwrap();
        // The closed transport reports in after the leave
        relay.detach(&b).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        relay.join(&s1.id, "bob").await.unwrap();
        tokio::time::sleep(Duration::from_secs(26)).await;

        let session = sessions.get_session(&s1.id).await.unwrap();
        assert_eq!(session.participants, vec!["alice", "bob"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_restarts_on_each_disconnect() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(Arc::clone(&sessions), RelayConfig::default());
        let s1 = sessions.create_session("src/app.ts", "alice").await;
        sessions.join_session(&s1.id, "bob").await.unwrap();

        let (b1, _rx1) = relay.attach(&s1.id, "bob").await.unwrap();
        relay.detach(&b1).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        let (b2, _rx2) = relay.attach(&s1.id, "bob").await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;
        relay.detach(&b2).await;

        // 31s after the first disconnect, 6s after the last one
        tokio::time::sleep(Duration::from_secs(6)).await;
        let session = sessions.get_session(&s1.id).await.unwrap();
        assert_eq!(session.participants, vec!["alice", "bob"]);

        tokio::time::sleep(Duration::from_secs(25)).await;
        let session = sessions.get_session(&s1.id).await.unwrap();
        assert_eq!(session.participants, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_discarded_attach_drops_group_of_closed_session() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(Arc::clone(&sessions), RelayConfig::default());
        let s1 = sessions.create_session("src/a.ts", "alice").await;
        let s2 = sessions.create_session("src/b.ts", "carol").await;

        // An attach that recreated the group after the closing leave removed it
        let stale = relay.group_or_create(&s1.id).await;
        sessions.leave_session(&s1.id, "alice").await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        stale.lock().await.members.push(Member {
            conn_id: 99,
            participant_id: "alice".into(),
            tx,
        });

        relay.discard_member(&stale, &s1.id, 99).await;
        assert!(relay.group(&s1.id).await.is_none());

        // A live session keeps its group
        let live = relay.group_or_create(&s2.id).await;
        let (tx, _rx) = mpsc::channel(1);
        live.lock().await.members.push(Member {
            conn_id: 100,
            participant_id: "carol".into(),
            tx,
        });
        relay.discard_member(&live, &s2.id, 100).await;
        assert!(relay.group(&s2.id).await.is_some());
    }

    #[tokio::test]
    async fn test_leave_closes_participant_connections() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(Arc::clone(&sessions), RelayConfig::default());
        let s1 = sessions.create_session("src/app.ts", "alice").await;
        sessions.join_session(&s1.id, "bob").await.unwrap();

        let (_a, mut a_rx) = relay.attach(&s1.id, "alice").await.unwrap();
        let (_b, mut b_rx) = relay.attach(&s1.id, "bob").await.unwrap();

        assert!(relay.leave(&s1.id, "bob").await.unwrap());
        assert!(b_rx.recv().await.is_none());
        assert_eq!(relay.connection_count(&s1.id).await, 1);

        assert!(!relay.leave(&s1.id, "alice").await.unwrap());
        assert!(a_rx.recv().await.is_none());
        assert!(sessions.get_session(&s1.id).await.is_none());
    }

    #[tokio::test]
    async fn test_close_all_ends_transports() {
        let sessions = Arc::new(SessionManager::new());
        let relay = relay_with(Arc::clone(&sessions), RelayConfig::default());
        let s1 = sessions.create_session("src/app.ts", "alice").await;

        let (_a, mut a_rx) = relay.attach(&s1.id, "alice").await.unwrap();
        relay.close_all().await;

        assert!(a_rx.recv().await.is_none());
        // Session record is the session manager's business
        assert!(sessions.get_session(&s1.id).await.is_some());
    }
}
