//! Remote blob store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ensemble_common::{RemotePath, Result};

/// Metadata for a stored remote object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Unique identifier for the object (provider-specific).
    pub id: String,
    /// Name of the object.
    pub name: String,
    /// Size in bytes (None for folders).
    pub size: Option<u64>,
    /// Whether this is a folder.
    pub is_folder: bool,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Content checksum stored as provider metadata at upload time.
    ///
    /// Dedup compares against this value; it is never recomputed remotely.
    pub checksum: Option<String>,
}

/// Remote blob store trait for the shared sync backend.
///
/// All operations are async. Implementations handle their own credentials
/// and rate limiting; the sync engine wraps each call in its retry policy.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the provider name (e.g., "gdrive", "memory").
    fn name(&self) -> &str;

    /// Validate credentials against the backend.
    ///
    /// # Errors
    /// - `Error::Authentication` on invalid or expired credentials; this is
    ///   never retried and aborts the sync session.
    async fn authenticate(&self) -> Result<()>;

    /// Upload data, creating or replacing the object at `path`.
    ///
    /// # Preconditions
    /// - Parent folder must exist
    ///
    /// # Errors
    /// - Parent folder not found
    /// - Network/quota errors
    async fn upload(&self, path: &RemotePath, data: Vec<u8>) -> Result<RemoteFile>;

    /// Download the complete content of the object at `path`.
    ///
    /// # Errors
    /// - File not found
    /// - Network errors
    async fn download(&self, path: &RemotePath) -> Result<Vec<u8>>;

    /// Check if a path exists.
    async fn exists(&self, path: &RemotePath) -> Result<bool>;

    /// Delete a file.
    async fn delete(&self, path: &RemotePath) -> Result<()>;

    /// List contents of a folder.
    async fn list(&self, path: &RemotePath) -> Result<Vec<RemoteFile>>;

    /// Create a folder, including missing parents.
    ///
    /// Succeeds if the folder already exists.
    async fn create_folder(&self, path: &RemotePath) -> Result<RemoteFile>;

    /// Get metadata for a path without downloading content.
    ///
    /// # Errors
    /// - Path not found
    async fn metadata(&self, path: &RemotePath) -> Result<RemoteFile>;
}
