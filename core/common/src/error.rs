//! Common error types for Ensemble.

use thiserror::Error;

/// Top-level error type for Ensemble operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Authentication against the remote store failed. Never retried.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Transient network failure. Retried via the retry policy.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote storage quota exhausted. Aborts the session, user-actionable.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Local and remote content digests disagree where they should match.
    #[error("Checksum mismatch for {entity}: local {local}, remote {remote}")]
    ChecksumMismatch {
        entity: String,
        local: String,
        remote: String,
    },

    /// A changelog entry references an entity that no longer exists.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// A conflict requires manual resolution.
    #[error("Conflict unresolved: {0}")]
    ConflictUnresolved(String),

    /// A sync session is already running for this group.
    #[error("Sync already in progress for group {0}")]
    SyncInProgress(String),

    /// The session was cancelled between steps.
    #[error("Sync cancelled")]
    Cancelled,

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
}

impl Error {
    /// Whether the retry policy may re-attempt an operation that failed
    /// with this error. Auth, quota, and malformed-request failures must
    /// fail fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
