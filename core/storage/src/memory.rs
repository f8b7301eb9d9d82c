//! In-memory remote store for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use ensemble_common::{checksum_of_bytes, Error, RemotePath, Result};

use crate::remote::{RemoteFile, RemoteStore};

#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, meta: RemoteFile },
    Folder { meta: RemoteFile },
}

/// In-memory remote store.
///
/// Useful for testing and development. Stores a SHA-256 checksum as upload
/// metadata the way a real provider stores content hashes, and supports
/// failure injection: an auth-failure toggle and a countdown of transient
/// network failures for exercising the retry path.
pub struct MemoryRemote {
    storage: Arc<RwLock<HashMap<String, Entry>>>,
    fail_auth: AtomicBool,
    transient_failures: AtomicU32,
    upload_count: AtomicU32,
}

impl MemoryRemote {
    /// Create a new empty remote with just the root folder.
    pub fn new() -> Self {
        let storage = Arc::new(RwLock::new(HashMap::new()));

        let root_meta = RemoteFile {
            id: Uuid::new_v4().to_string(),
            name: "/".to_string(),
            size: None,
            is_folder: true,
            modified: Utc::now(),
            checksum: None,
        };
        storage
            .write()
            .unwrap()
            .insert("/".to_string(), Entry::Folder { meta: root_meta });

        Self {
            storage,
            fail_auth: AtomicBool::new(false),
            transient_failures: AtomicU32::new(0),
            upload_count: AtomicU32::new(0),
        }
    }

    /// Make `authenticate` fail until cleared.
    pub fn set_auth_failure(&self, fail: bool) {
        self.fail_auth.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` upload, download, exists, metadata, or delete
    /// calls with a network error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Number of content uploads performed (for dedup assertions).
    pub fn upload_count(&self) -> u32 {
        self.upload_count.load(Ordering::SeqCst)
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn key(path: &RemotePath) -> String {
        path.to_string_path()
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn authenticate(&self) -> Result<()> {
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(Error::Authentication("invalid credentials".to_string()));
        }
        Ok(())
    }

    async fn upload(&self, path: &RemotePath, data: Vec<u8>) -> Result<RemoteFile> {
        if self.take_transient_failure() {
            return Err(Error::Network("injected failure".to_string()));
        }

        let key = Self::key(path);

        if let Some(parent) = path.parent() {
            let storage = self.storage.read().unwrap();
            match storage.get(&Self::key(&parent)) {
                Some(Entry::Folder { .. }) => {}
                Some(Entry::File { .. }) => {
                    return Err(Error::InvalidInput("Parent is a file".to_string()));
                }
                None => {
                    return Err(Error::NotFound(format!(
                        "Parent folder not found: {}",
                        parent
                    )));
                }
            }
        }

        let meta = RemoteFile {
            id: Uuid::new_v4().to_string(),
            name: path.name().unwrap_or("/").to_string(),
            size: Some(data.len() as u64),
            is_folder: false,
            modified: Utc::now(),
            checksum: Some(checksum_of_bytes(&data)),
        };

        self.upload_count.fetch_add(1, Ordering::SeqCst);
        self.storage.write().unwrap().insert(
            key,
            Entry::File {
                data,
                meta: meta.clone(),
            },
        );

        Ok(meta)
    }

    async fn download(&self, path: &RemotePath) -> Result<Vec<u8>> {
        if self.take_transient_failure() {
            return Err(Error::Network("injected failure".to_string()));
        }

        let storage = self.storage.read().unwrap();
        match storage.get(&Self::key(path)) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            Some(Entry::Folder { .. }) => {
                Err(Error::InvalidInput(format!("{} is a folder", path)))
            }
            None => Err(Error::NotFound(format!("File not found: {}", path))),
        }
    }

    async fn exists(&self, path: &RemotePath) -> Result<bool> {
        if self.take_transient_failure() {
            return Err(Error::Network("injected failure".to_string()));
        }

        let storage = self.storage.read().unwrap();
        Ok(storage.contains_key(&Self::key(path)))
    }

    async fn delete(&self, path: &RemotePath) -> Result<()> {
        if self.take_transient_failure() {
            return Err(Error::Network("injected failure".to_string()));
        }

        let mut storage = self.storage.write().unwrap();
        match storage.remove(&Self::key(path)) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("File not found: {}", path))),
        }
    }

    async fn list(&self, path: &RemotePath) -> Result<Vec<RemoteFile>> {
        let storage = self.storage.read().unwrap();
        let prefix = Self::key(path);
        match storage.get(&prefix) {
            Some(Entry::Folder { .. }) => {}
            Some(Entry::File { .. }) => {
                return Err(Error::InvalidInput(format!("{} is a file", path)));
            }
            None => {
                return Err(Error::NotFound(format!("Folder not found: {}", path)));
            }
        }

        let depth = path.components().len() + 1;
        let mut files: Vec<RemoteFile> = storage
            .iter()
            .filter(|(k, _)| {
                k.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
                    && k.trim_start_matches('/').split('/').count() == depth
            })
            .map(|(_, entry)| match entry {
                Entry::File { meta, .. } => meta.clone(),
                Entry::Folder { meta } => meta.clone(),
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn create_folder(&self, path: &RemotePath) -> Result<RemoteFile> {
        // Create missing parents first, root downward.
        let mut storage = self.storage.write().unwrap();
        let mut current = RemotePath::root();
        for comp in path.components() {
            current = current.join(comp)?;
            let key = Self::key(&current);
            match storage.get(&key) {
                Some(Entry::Folder { .. }) => {}
                Some(Entry::File { .. }) => {
                    return Err(Error::AlreadyExists(format!("{} is a file", current)));
                }
                None => {
                    let meta = RemoteFile {
                        id: Uuid::new_v4().to_string(),
                        name: comp.clone(),
                        size: None,
                        is_folder: true,
                        modified: Utc::now(),
                        checksum: None,
                    };
                    storage.insert(key, Entry::Folder { meta });
                }
            }
        }

        match storage.get(&Self::key(path)) {
            Some(Entry::Folder { meta }) => Ok(meta.clone()),
            _ => Err(Error::NotFound(format!("Folder not found: {}", path))),
        }
    }

    async fn metadata(&self, path: &RemotePath) -> Result<RemoteFile> {
        if self.take_transient_failure() {
            return Err(Error::Network("injected failure".to_string()));
        }

        let storage = self.storage.read().unwrap();
        match storage.get(&Self::key(path)) {
            Some(Entry::File { meta, .. }) => Ok(meta.clone()),
            Some(Entry::Folder { meta }) => Ok(meta.clone()),
            None => Err(Error::NotFound(format!("Path not found: {}", path))),
        }
    }
}
