//! Stable remote folder layout for a shared group.
//!
//! ```text
//! /<AppRoot>/<GroupName>/
//!   manifest.json
//!   songs/<id>.pdf | <id>-metadata.json
//!   annotations/<fileId>/<memberId>/<annotationId>.json
//!   setlists/<setlistId>.json
//!   changelog/<timestamp>_<entityId>_<changeType>.json
//! ```

use ensemble_common::model::{ChangeLogEntry, EntityType};
use ensemble_common::{RemotePath, Result};

/// Path builder for one group's remote folder tree.
#[derive(Debug, Clone)]
pub struct GroupLayout {
    root: RemotePath,
}

impl GroupLayout {
    /// Create a layout rooted at `/<app_root>/<group_name>`.
    pub fn new(app_root: &str, group_name: &str) -> Result<Self> {
        let root = RemotePath::root().join(app_root)?.join(group_name)?;
        Ok(Self { root })
    }

    /// The group's root folder.
    pub fn root(&self) -> &RemotePath {
        &self.root
    }

    /// `manifest.json` in the group root.
    pub fn manifest(&self) -> RemotePath {
        self.root.join("manifest.json").expect("static name")
    }

    /// The `songs/` folder.
    pub fn songs_dir(&self) -> RemotePath {
        self.root.join("songs").expect("static name")
    }

    /// A song's PDF content file.
    pub fn song_pdf(&self, song_id: &str) -> Result<RemotePath> {
        self.songs_dir().join(&format!("{}.pdf", song_id))
    }

    /// A song's metadata record.
    pub fn song_metadata(&self, song_id: &str) -> Result<RemotePath> {
        self.songs_dir().join(&format!("{}-metadata.json", song_id))
    }

    /// The `annotations/` folder.
    pub fn annotations_dir(&self) -> RemotePath {
        self.root.join("annotations").expect("static name")
    }

    /// The per-(file, member) annotation folder.
    pub fn annotation_member_dir(&self, file_id: &str, member_id: &str) -> Result<RemotePath> {
        self.annotations_dir().join(file_id)?.join(member_id)
    }

    /// A single annotation layer file.
    pub fn annotation(
        &self,
        file_id: &str,
        member_id: &str,
        annotation_id: &str,
    ) -> Result<RemotePath> {
        self.annotation_member_dir(file_id, member_id)?
            .join(&format!("{}.json", annotation_id))
    }

    /// The `setlists/` folder.
    pub fn setlists_dir(&self) -> RemotePath {
        self.root.join("setlists").expect("static name")
    }

    /// A setlist record.
    pub fn setlist(&self, setlist_id: &str) -> Result<RemotePath> {
        self.setlists_dir().join(&format!("{}.json", setlist_id))
    }

    /// The `changelog/` folder.
    pub fn changelog_dir(&self) -> RemotePath {
        self.root.join("changelog").expect("static name")
    }

    /// The remote file for one changelog entry:
    /// `changelog/<timestamp>_<entityId>_<changeType>.json`.
    ///
    /// The entity id keeps same-millisecond entries for different entities
    /// from overwriting each other. Two entries for the same entity in the
    /// same millisecond collide on purpose; the later one carries the
    /// entity's final state.
    pub fn changelog_entry(&self, entry: &ChangeLogEntry) -> Result<RemotePath> {
        self.changelog_dir().join(&format!(
            "{}_{}_{}.json",
            entry.timestamp,
            entry.entity_id,
            entry.change_type.file_tag()
        ))
    }

    /// The folders a fresh group needs before any upload.
    pub fn folders(&self) -> Vec<RemotePath> {
        vec![
            self.root.clone(),
            self.songs_dir(),
            self.annotations_dir(),
            self.setlists_dir(),
            self.changelog_dir(),
        ]
    }

    /// The remote record file for the entity an entry mutates.
    ///
    /// GROUP and MEMBER entries carry no entity file of their own; their
    /// state lives in the manifest, so this returns `None` for them.
    /// Annotation paths need the layer metadata the tracker records on the
    /// entry; an annotation entry without it is malformed.
    pub fn entity_path(&self, entry: &ChangeLogEntry) -> Result<Option<RemotePath>> {
        match entry.entity_type {
            EntityType::Song => self.song_metadata(&entry.entity_id).map(Some),
            EntityType::Setlist => self.setlist(&entry.entity_id).map(Some),
            EntityType::Annotation => {
                let (file_id, member_id, _) = entry.annotation_layer().ok_or_else(|| {
                    ensemble_common::Error::InvalidInput(format!(
                        "annotation entry {} missing layer metadata",
                        entry.change_id
                    ))
                })?;
                self.annotation(&file_id, &member_id, &entry.entity_id)
                    .map(Some)
            }
            EntityType::Group | EntityType::Member => Ok(None),
        }
    }
}

/// Extract the millisecond timestamp embedded in a changelog filename.
///
/// Used as a cheap pre-filter against the sync checkpoint before
/// downloading entry files.
pub fn changelog_timestamp(file_name: &str) -> Option<i64> {
    let stem = file_name.strip_suffix(".json")?;
    let (ts, _) = stem.split_once('_')?;
    ts.parse().ok()
}
