//! Change tracking: every local mutation produces exactly one changelog
//! entry, appended atomically with the entity write itself.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use ensemble_common::model::{
    Annotation, ChangeLogEntry, ChangeType, EntityKey, EntityType, META_FILE_ID, META_MEMBER_ID,
    META_PAGE_NUMBER,
};
use ensemble_common::{checksum_of, DeviceId, Error, Result};
use ensemble_storage::{LocalStore, StoreOp};

/// Writes changelog entries whenever the local store is mutated, and reads
/// back the unsynced tail for upload.
pub struct ChangeTracker {
    store: Arc<dyn LocalStore>,
    device_id: DeviceId,
    device_name: String,
}

impl ChangeTracker {
    /// Create a tracker bound to this device's identity.
    pub fn new(store: Arc<dyn LocalStore>, device_id: DeviceId, device_name: impl Into<String>) -> Self {
        Self {
            store,
            device_id,
            device_name: device_name.into(),
        }
    }

    /// Record a local mutation: write the entity and append its changelog
    /// entry in one atomic batch.
    ///
    /// `snapshot` must be `Some` for CREATE/UPDATE and `None` for DELETE.
    pub async fn record(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        entity_name: &str,
        change_type: ChangeType,
        snapshot: Option<&Value>,
        description: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<ChangeLogEntry> {
        self.record_at(
            entity_type,
            entity_id,
            entity_name,
            change_type,
            snapshot,
            description,
            metadata,
            Utc::now(),
        )
        .await
    }

    /// `record` with an explicit timestamp.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_at(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        entity_name: &str,
        change_type: ChangeType,
        snapshot: Option<&Value>,
        description: &str,
        metadata: BTreeMap<String, String>,
        at: DateTime<Utc>,
    ) -> Result<ChangeLogEntry> {
        let key = EntityKey::new(entity_type, entity_id);

        let (checksum, entity_op) = match (change_type, snapshot) {
            (ChangeType::Delete, None) => (String::new(), StoreOp::DeleteEntity { key }),
            (ChangeType::Delete, Some(_)) => {
                return Err(Error::InvalidInput(
                    "DELETE must not carry an entity snapshot".to_string(),
                ));
            }
            (_, Some(snapshot)) => (
                checksum_of(snapshot),
                StoreOp::PutEntity {
                    key,
                    record: snapshot.clone(),
                },
            ),
            (_, None) => {
                return Err(Error::InvalidInput(
                    "CREATE/UPDATE require an entity snapshot".to_string(),
                ));
            }
        };

        let entry = ChangeLogEntry {
            change_id: Uuid::new_v4().to_string(),
            timestamp: at.timestamp_millis(),
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            entity_type,
            entity_id: entity_id.to_string(),
            entity_name: entity_name.to_string(),
            change_type,
            checksum,
            description: description.to_string(),
            metadata,
            synced: false,
        };

        debug!(
            change_id = %entry.change_id,
            key = %entry.key(),
            change = ?change_type,
            "Recording local change"
        );

        self.store
            .apply(vec![entity_op, StoreOp::AppendChange { entry: entry.clone() }])
            .await?;

        Ok(entry)
    }

    /// Record an annotation mutation, carrying the layer triple in entry
    /// metadata so overlap detection can compare layers without loading
    /// entity bodies.
    pub async fn record_annotation(
        &self,
        annotation: &Annotation,
        change_type: ChangeType,
        description: &str,
    ) -> Result<ChangeLogEntry> {
        let snapshot = serde_json::to_value(annotation)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.record(
            EntityType::Annotation,
            &annotation.id,
            &format!("p.{} markup", annotation.page_number + 1),
            change_type,
            Some(&snapshot),
            description,
            annotation_metadata(annotation),
        )
        .await
    }

    /// The identity this tracker stamps on entries.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// All local entries not yet synced, ascending by timestamp.
    pub async fn unsynced_entries(&self) -> Result<Vec<ChangeLogEntry>> {
        self.store.unsynced_changes().await
    }

    /// Flip an entry's synced flag after a successful upload or after it
    /// was applied from remote.
    pub async fn mark_synced(&self, change_id: &str) -> Result<()> {
        self.store
            .apply(vec![StoreOp::MarkSynced {
                change_id: change_id.to_string(),
            }])
            .await
    }
}

/// The metadata keys annotation entries carry for layer-overlap detection.
pub fn annotation_metadata(annotation: &Annotation) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(META_FILE_ID.to_string(), annotation.file_id.clone());
    metadata.insert(META_MEMBER_ID.to_string(), annotation.member_id.clone());
    metadata.insert(
        META_PAGE_NUMBER.to_string(),
        annotation.page_number.to_string(),
    );
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_storage::MemoryStore;
    use serde_json::json;

    fn tracker() -> (ChangeTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let tracker = ChangeTracker::new(
            store.clone(),
            DeviceId::new("device-x").unwrap(),
            "X's tablet",
        );
        (tracker, store)
    }

    #[tokio::test]
    async fn test_record_writes_entity_and_entry() {
        let (tracker, store) = tracker();
        let snapshot = json!({"name": "Song One", "notes": ""});

        let entry = tracker
            .record(
                EntityType::Song,
                "s1",
                "Song One",
                ChangeType::Create,
                Some(&snapshot),
                "created song",
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(entry.checksum, checksum_of(&snapshot));
        assert!(!entry.synced);

        let key = EntityKey::new(EntityType::Song, "s1");
        assert_eq!(store.entity(&key).await.unwrap().unwrap(), snapshot);
        assert_eq!(tracker.unsynced_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_delete_removes_entity() {
        let (tracker, store) = tracker();
        let snapshot = json!({"name": "Song One"});
        tracker
            .record(
                EntityType::Song,
                "s1",
                "Song One",
                ChangeType::Create,
                Some(&snapshot),
                "",
                BTreeMap::new(),
            )
            .await
            .unwrap();

        let entry = tracker
            .record(
                EntityType::Song,
                "s1",
                "Song One",
                ChangeType::Delete,
                None,
                "deleted song",
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert!(entry.checksum.is_empty());
        let key = EntityKey::new(EntityType::Song, "s1");
        assert!(store.entity(&key).await.unwrap().is_none());
        // Both entries remain in the audit trail.
        assert_eq!(store.changes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_with_snapshot_rejected() {
        let (tracker, _) = tracker();
        let result = tracker
            .record(
                EntityType::Song,
                "s1",
                "Song One",
                ChangeType::Delete,
                Some(&json!({})),
                "",
                BTreeMap::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_checksum_is_deterministic_across_trackers() {
        let (tracker_a, _) = tracker();
        let store_b = Arc::new(MemoryStore::new());
        let tracker_b = ChangeTracker::new(
            store_b,
            DeviceId::new("device-y").unwrap(),
            "Y's phone",
        );

        let snapshot = json!({"title": "Blue in Green", "key": "Bb"});
        let a = tracker_a
            .record(
                EntityType::Song,
                "s2",
                "Blue in Green",
                ChangeType::Create,
                Some(&snapshot),
                "",
                BTreeMap::new(),
            )
            .await
            .unwrap();
        let b = tracker_b
            .record(
                EntityType::Song,
                "s2",
                "Blue in Green",
                ChangeType::Create,
                Some(&snapshot),
                "",
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(a.checksum, b.checksum);
        assert_ne!(a.change_id, b.change_id);
    }

    #[tokio::test]
    async fn test_record_annotation_carries_layer_metadata() {
        let (tracker, _) = tracker();
        let annotation = Annotation {
            id: "a1".into(),
            file_id: "f1".into(),
            member_id: "m1".into(),
            page_number: 3,
            created_at: 100,
            updated_at: 100,
            strokes: vec![],
        };

        let entry = tracker
            .record_annotation(&annotation, ChangeType::Create, "new layer")
            .await
            .unwrap();

        assert_eq!(
            entry.annotation_layer(),
            Some(("f1".into(), "m1".into(), 3))
        );
    }

    #[tokio::test]
    async fn test_mark_synced() {
        let (tracker, _) = tracker();
        let entry = tracker
            .record(
                EntityType::Setlist,
                "l1",
                "Friday set",
                ChangeType::Create,
                Some(&json!({"songs": []})),
                "",
                BTreeMap::new(),
            )
            .await
            .unwrap();

        tracker.mark_synced(&entry.change_id).await.unwrap();
        assert!(tracker.unsynced_entries().await.unwrap().is_empty());
    }
}
