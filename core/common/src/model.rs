//! Shared data model: changelog entries, conflicts, manifests, annotations.
//!
//! Wire field names follow the remote JSON schemas, so every struct here
//! serializes with camelCase keys and closed-set enums serialize in
//! SCREAMING_SNAKE_CASE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::DeviceId;

/// Metadata key carrying the annotated file id on annotation changelog entries.
pub const META_FILE_ID: &str = "fileId";
/// Metadata key carrying the annotating member id.
pub const META_MEMBER_ID: &str = "memberId";
/// Metadata key carrying the annotated page number.
pub const META_PAGE_NUMBER: &str = "pageNumber";

/// The closed set of entity kinds tracked by the changelog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Song,
    Annotation,
    Setlist,
    Group,
    Member,
}

impl EntityType {
    /// Whether a change collision on this type is a structural change that
    /// must never be auto-resolved.
    pub fn is_structural(&self) -> bool {
        matches!(self, EntityType::Group | EntityType::Member)
    }

}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityType::Song => "SONG",
            EntityType::Annotation => "ANNOTATION",
            EntityType::Setlist => "SETLIST",
            EntityType::Group => "GROUP",
            EntityType::Member => "MEMBER",
        };
        write!(f, "{}", s)
    }
}

/// The kind of mutation a changelog entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    /// Lowercase name used in remote changelog filenames.
    pub fn file_tag(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

/// Partition key for conflict detection: one entity across devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Immutable record of one local entity mutation. Serves both as the sync
/// transport unit and as an append-only audit trail; only the local-only
/// `synced` flag ever changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub change_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub device_id: DeviceId,
    pub device_name: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: String,
    pub change_type: ChangeType,
    /// Hex SHA-256 of the canonical entity snapshot; empty for deletes.
    pub checksum: String,
    pub description: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Local bookkeeping only; remote changelog files never carry it.
    #[serde(default, skip_serializing)]
    pub synced: bool,
}

impl ChangeLogEntry {
    /// The entity this entry mutates.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Annotation layer key carried in metadata, if this is an annotation
    /// entry recorded with layer metadata.
    pub fn annotation_layer(&self) -> Option<(String, String, u32)> {
        if self.entity_type != EntityType::Annotation {
            return None;
        }
        let file_id = self.metadata.get(META_FILE_ID)?;
        let member_id = self.metadata.get(META_MEMBER_ID)?;
        let page = self.metadata.get(META_PAGE_NUMBER)?.parse().ok()?;
        Some((file_id.clone(), member_id.clone(), page))
    }
}

/// Classification of a local/remote change collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    DeleteModify,
    SimultaneousEdit,
    AnnotationOverlap,
    StructureChange,
}

/// How a conflict gets resolved, automatically or by a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionAction {
    KeepLocal,
    AcceptRemote,
    MergeAnnotations,
    /// Decline a stroke merge and keep both annotation layers distinct.
    LayerSeparate,
    ManualMerge,
}

/// Snapshot of one side of a conflict. Not a live reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictVersion {
    pub timestamp: i64,
    pub device_id: DeviceId,
    pub device_name: String,
    pub author_name: String,
    pub checksum: String,
    pub description: String,
}

impl ConflictVersion {
    /// Build a snapshot from a changelog entry.
    pub fn from_entry(entry: &ChangeLogEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            device_id: entry.device_id.clone(),
            device_name: entry.device_name.clone(),
            author_name: entry.device_name.clone(),
            checksum: entry.checksum.clone(),
            description: entry.description.clone(),
        }
    }
}

/// A detected collision between a local and a remote change for the same
/// entity. Created during detection, consumed during resolution; surfaced
/// to the caller only if it remains unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub conflict_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: String,
    pub local_version: ConflictVersion,
    pub remote_version: ConflictVersion,
    pub conflict_type: ConflictType,
    pub can_auto_resolve: bool,
}

impl SyncConflict {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// One member in the group manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMember {
    pub id: String,
    pub name: String,
    pub role: String,
    /// Milliseconds since the Unix epoch.
    pub joined: i64,
}

/// The single authoritative descriptor of a shared group. Stored remotely
/// as `manifest.json`; version increments on every successful sync and the
/// manifest itself is last-writer-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupManifest {
    pub version: u64,
    pub group_id: String,
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub created: i64,
    /// Milliseconds since the Unix epoch.
    pub updated: i64,
    pub member_count: usize,
    pub members: Vec<ManifestMember>,
}

impl GroupManifest {
    /// Create a fresh version-0 manifest for a group with no members yet.
    pub fn new(group_id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        let ms = now.timestamp_millis();
        Self {
            version: 0,
            group_id: group_id.into(),
            name: name.into(),
            created: ms,
            updated: ms,
            member_count: 0,
            members: Vec::new(),
        }
    }

    /// Bump the version and refresh membership bookkeeping after a sync.
    pub fn touch(&mut self, members: Vec<ManifestMember>, now: DateTime<Utc>) {
        self.version += 1;
        self.updated = now.timestamp_millis();
        self.member_count = members.len();
        self.members = members;
    }
}

/// One markup point in normalized page-relative coordinates (0.0..=1.0),
/// device and resolution independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationPoint {
    pub x: f64,
    pub y: f64,
    pub pressure: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// The drawing tool a stroke was made with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrokeTool {
    Pen,
    Highlighter,
    Text,
}

/// One atomic markup gesture. Identity is the globally unique `id`; that
/// id is the deduplication key during layer merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationStroke {
    pub id: String,
    pub tool: StrokeTool,
    /// "#RRGGBB"
    pub color: String,
    pub stroke_width: f64,
    pub opacity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub points: Vec<AnnotationPoint>,
}

/// One markup layer scoped to a single (file, member, page) triple.
/// Concurrent devices may transiently create duplicate layers for the same
/// triple; the merge engine collapses them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    pub file_id: String,
    pub member_id: String,
    pub page_number: u32,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
    pub strokes: Vec<AnnotationStroke>,
}

impl Annotation {
    /// The triple identifying the logical layer this annotation belongs to.
    pub fn layer_key(&self) -> (String, String, u32) {
        (self.file_id.clone(), self.member_id.clone(), self.page_number)
    }
}

/// One song slot in a setlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetlistSong {
    pub song_id: String,
    pub order: u32,
}

/// An ordered playlist of songs shared within a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setlist {
    pub id: String,
    pub name: String,
    pub group_id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
    pub songs: Vec<SetlistSong>,
}
