//! Error types for the session grid.

use crate::types::{NodeId, SessionId};
use thiserror::Error;

/// Result type alias for session grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the session grid.
#[derive(Error, Debug)]
pub enum Error {
    /// The session was invalidated, possibly by a concurrent request on
    /// another node. Always surfaced to the caller after local cleanup.
    #[error("session {0} is no longer valid")]
    InvalidSession(SessionId),

    /// A session with this identifier already exists.
    #[error("session {0} already exists")]
    SessionExists(SessionId),

    /// The grid runs in a non-distributed mode but a distribution snapshot
    /// was required. Indicates a misconfigured cache mode; fatal.
    #[error("cache '{0}' has no distribution: is it running in a distributed mode?")]
    NotDistributed(String),

    /// The service has not been started yet.
    #[error("service not started")]
    NotStarted,

    /// The service is shutting down; late submissions are dropped.
    #[error("service is shut down")]
    Shutdown,

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Session record (de)serialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Dispatching a command to a remote primary owner failed.
    #[error("dispatch to node {node} failed: {reason}")]
    Dispatch { node: NodeId, reason: String },
}

impl Error {
    /// Whether this error signals a concurrent-invalidation race.
    pub fn is_invalidity(&self) -> bool {
        matches!(self, Error::InvalidSession(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
