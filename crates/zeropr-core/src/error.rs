//! Error kinds shared by every ZeroPR component

use thiserror::Error;

/// Errors returned by registry, session, relay and broadcast operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// StartBroadcast while an advertisement is already active
    #[error("already broadcasting")]
    AlreadyBroadcasting,

    /// The discovery protocol refused our advertisement
    #[error("failed to register advertisement: {0}")]
    RegistrationFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Relay attach against a session that does not exist
    #[error("connection rejected: session {0} does not exist")]
    ConnectionRejected(String),

    /// Browse/resolve failure inside a discovery cycle. Logged, never surfaced.
    #[error("transient discovery error: {0}")]
    TransientDiscovery(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
