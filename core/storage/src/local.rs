//! Local record store trait and in-memory implementation.
//!
//! The relational store underneath the app is an external collaborator; the
//! sync engine sees it only as a transactional record store keyed by
//! (entity type, entity id), with the changelog and per-group sync
//! checkpoints living beside the entities so one mutation batch can update
//! all three atomically.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::trace;

use ensemble_common::model::{ChangeLogEntry, EntityKey, EntityType};
use ensemble_common::{Error, GroupId, Result};

/// One mutation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Insert or replace an entity record.
    PutEntity { key: EntityKey, record: Value },
    /// Remove an entity record.
    DeleteEntity { key: EntityKey },
    /// Append a changelog entry. Entries are never deleted.
    AppendChange { entry: ChangeLogEntry },
    /// Flip an existing entry's `synced` flag to true.
    MarkSynced { change_id: String },
    /// Advance the sync checkpoint for a group.
    SetCheckpoint { group_id: GroupId, timestamp: i64 },
}

/// Transactional local record store.
///
/// `apply` is all-or-nothing: a crash or failure mid-batch must not leave a
/// half-written entity or an entity write without its changelog entry.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetch an entity record by key.
    async fn entity(&self, key: &EntityKey) -> Result<Option<Value>>;

    /// Fetch all records of one entity type, as (id, record) pairs.
    async fn entities_of(&self, entity_type: EntityType) -> Result<Vec<(String, Value)>>;

    /// Apply a batch of mutations atomically.
    async fn apply(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// All changelog entries not yet synced, ascending by timestamp.
    async fn unsynced_changes(&self) -> Result<Vec<ChangeLogEntry>>;

    /// Look up a single changelog entry.
    async fn change(&self, change_id: &str) -> Result<Option<ChangeLogEntry>>;

    /// The full audit trail, ascending by timestamp.
    async fn changes(&self) -> Result<Vec<ChangeLogEntry>>;

    /// The last successfully synced remote changelog timestamp for a group.
    async fn checkpoint(&self, group_id: &GroupId) -> Result<Option<i64>>;
}

#[derive(Default)]
struct Inner {
    entities: HashMap<EntityKey, Value>,
    changes: Vec<ChangeLogEntry>,
    change_index: HashMap<String, usize>,
    checkpoints: HashMap<String, i64>,
}

/// In-memory local store.
///
/// Useful for testing and development. Batches run under a single lock, so
/// `apply` is atomic by construction.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn entity(&self, key: &EntityKey) -> Result<Option<Value>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.entities.get(key).cloned())
    }

    async fn entities_of(&self, entity_type: EntityType) -> Result<Vec<(String, Value)>> {
        let inner = self.inner.read().unwrap();
        let mut records: Vec<(String, Value)> = inner
            .entities
            .iter()
            .filter(|(k, _)| k.entity_type == entity_type)
            .map(|(k, v)| (k.entity_id.clone(), v.clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<()> {
        trace!(ops = ops.len(), "Applying store batch");
        let mut inner = self.inner.write().unwrap();

        // Validate the whole batch before mutating anything so a failure
        // leaves the store untouched.
        for op in &ops {
            match op {
                StoreOp::AppendChange { entry } => {
                    if inner.change_index.contains_key(&entry.change_id) {
                        return Err(Error::AlreadyExists(format!(
                            "changelog entry {}",
                            entry.change_id
                        )));
                    }
                }
                StoreOp::MarkSynced { change_id } => {
                    if !inner.change_index.contains_key(change_id) {
                        return Err(Error::NotFound(format!("changelog entry {}", change_id)));
                    }
                }
                _ => {}
            }
        }

        for op in ops {
            match op {
                StoreOp::PutEntity { key, record } => {
                    inner.entities.insert(key, record);
                }
                StoreOp::DeleteEntity { key } => {
                    inner.entities.remove(&key);
                }
                StoreOp::AppendChange { entry } => {
                    let idx = inner.changes.len();
                    inner.change_index.insert(entry.change_id.clone(), idx);
                    inner.changes.push(entry);
                }
                StoreOp::MarkSynced { change_id } => {
                    let idx = inner.change_index[&change_id];
                    inner.changes[idx].synced = true;
                }
                StoreOp::SetCheckpoint {
                    group_id,
                    timestamp,
                } => {
                    inner.checkpoints.insert(group_id.as_str().to_string(), timestamp);
                }
            }
        }
        Ok(())
    }

    async fn unsynced_changes(&self) -> Result<Vec<ChangeLogEntry>> {
        let inner = self.inner.read().unwrap();
        let mut entries: Vec<ChangeLogEntry> = inner
            .changes
            .iter()
            .filter(|e| !e.synced)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn change(&self, change_id: &str) -> Result<Option<ChangeLogEntry>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .change_index
            .get(change_id)
            .map(|&idx| inner.changes[idx].clone()))
    }

    async fn changes(&self) -> Result<Vec<ChangeLogEntry>> {
        let inner = self.inner.read().unwrap();
        let mut entries = inner.changes.clone();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn checkpoint(&self, group_id: &GroupId) -> Result<Option<i64>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.checkpoints.get(group_id.as_str()).copied())
    }
}
