//! ZeroPR Core - LAN collaboration state
//!
//! Features:
//! - Peer registry with TTL eviction
//! - Presence tracking (editing / idle / away)
//! - Co-editing session lifecycle
//! - Per-session real-time relay of opaque sync payloads
//! - Repository identity for advertising

pub mod error;
pub mod peer;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod repo;
pub mod session;

pub use error::{Error, Result};
pub use peer::{CursorPosition, Peer, PresenceStatus};
pub use presence::{Presence, PresenceTracker};
pub use registry::PeerRegistry;
pub use relay::{Payload, RelayConfig, RelayConnection, SyncRelay};
pub use repo::RepoInfo;
pub use session::{Session, SessionManager};
