//! Error types for raftkv.
//!
//! Every variant renders as a single line of text, because coordinator errors
//! are written verbatim back to protocol clients.

use std::time::Duration;

use thiserror::Error;

use crate::server::ProtocolError;

/// Errors produced by the coordinator, the command server and the bootstrap path.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unknown client command.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A write or membership command reached a node that is not the leader.
    #[error("node is not the leader{}", leader.as_ref().map(|l| format!(" (leader at {l})")).unwrap_or_default())]
    NotLeader { leader: Option<String> },

    /// GET on an absent key.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Quorum commitment did not happen in time.
    #[error("operation not committed within {0:?}")]
    CommitTimeout(Duration),

    /// Log/snapshot storage or the consensus engine failed to start.
    #[error("storage initialization failed: {0}")]
    StorageInit(String),

    /// Socket level failure.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// The one-shot startup join request failed.
    #[error("join failed: {0}")]
    JoinBootstrap(String),

    /// Any other consensus engine failure.
    #[error("raft error: {0}")]
    Raft(String),

    /// Invalid process configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for raftkv operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error should abort process startup rather than be reported to a client.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StorageInit(_) | Error::JoinBootstrap(_) | Error::Config(_)
        )
    }
}
