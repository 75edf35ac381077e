//! Common error types for ArborSync.

use thiserror::Error;

/// Top-level error type for ArborSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Downloaded payload does not match the schema for its object kind.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Node or local object already has a link.
    #[error("Already linked: {0}")]
    AlreadyLinked(String),

    /// Pending local edits could not be merged onto the remote version.
    #[error("Merge error: {0}")]
    Merge(String),

    /// The node's version marker moved while the fetch was in flight.
    #[error("Stale fetch for node {node_id}: expected {expected}, node is at {actual}")]
    StaleFetch {
        node_id: String,
        expected: String,
        actual: String,
    },

    /// Download service or network failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Storage backend operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The reconciler has been shut down.
    #[error("Reconciler is shut down")]
    Shutdown,
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
