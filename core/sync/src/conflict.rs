//! Conflict detection, classification, and auto-resolution policy.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

use ensemble_common::model::{
    ChangeLogEntry, ChangeType, ConflictType, ConflictVersion, EntityKey, ResolutionAction,
    SyncConflict,
};
use ensemble_common::{Error, Result};

/// Default simultaneous-edit window: two UPDATEs within this many
/// milliseconds of each other are concurrent, not sequential.
pub const SIMULTANEOUS_EDIT_WINDOW_MS: i64 = 5 * 60 * 1000;

/// A classified collision, keeping both underlying entries so resolution
/// can act on them.
#[derive(Debug, Clone)]
pub struct ConflictPair {
    pub conflict: SyncConflict,
    pub local_entry: ChangeLogEntry,
    pub remote_entry: ChangeLogEntry,
}

/// A same-key edit pair whose timestamps fall outside the concurrent
/// window. Not a conflict: the edits are sequential and the later entry
/// supersedes the earlier one on both sides.
#[derive(Debug, Clone)]
pub struct SequentialPair {
    pub local_entry: ChangeLogEntry,
    pub remote_entry: ChangeLogEntry,
}

/// Result of partitioning local and remote changes.
#[derive(Debug, Default)]
pub struct DetectOutcome {
    /// Collisions needing resolution, auto or manual.
    pub pairs: Vec<ConflictPair>,
    /// Same-key edits outside the concurrent window; superseded, never
    /// surfaced as conflicts.
    pub sequential: Vec<SequentialPair>,
    /// Local entries safe to upload, ascending by timestamp.
    pub clean_local: Vec<ChangeLogEntry>,
    /// Remote entries safe to apply, ascending by timestamp.
    pub clean_remote: Vec<ChangeLogEntry>,
}

/// Which side a deterministic policy picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// An automatically resolved collision.
#[derive(Debug, Clone)]
pub enum AutoResolution {
    /// Last-writer-wins kept the local entry; the remote one is dropped.
    LocalWins(ConflictPair),
    /// Last-writer-wins kept the remote entry; the local one is retired
    /// without upload.
    RemoteWins(ConflictPair),
    /// Both annotation layers survive as a stroke merge.
    MergeLayers(ConflictPair),
}

/// Result of the auto-resolution pass.
#[derive(Debug, Default)]
pub struct AutoResolveOutcome {
    pub resolutions: Vec<AutoResolution>,
    /// Collisions that require human choice, surfaced to the caller.
    pub unresolved: Vec<ConflictPair>,
}

/// Classifies conflicting change pairs and applies the auto-resolution
/// policies that cannot lose data.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    window_ms: i64,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            window_ms: SIMULTANEOUS_EDIT_WINDOW_MS,
        }
    }

    /// Override the simultaneous-edit window (tests).
    pub fn with_window_ms(mut self, window_ms: i64) -> Self {
        self.window_ms = window_ms;
        self
    }

    /// Partition local and remote changes into clean sets and classified
    /// conflict pairs.
    ///
    /// A key present in both sets is a candidate conflict. Annotation
    /// entries are additionally paired across differing entity ids when
    /// they target the same (file, member, page) layer triple, because
    /// concurrent devices create separate layer records for the same
    /// logical layer.
    pub fn detect_conflicts(
        &self,
        local: &[ChangeLogEntry],
        remote: &[ChangeLogEntry],
    ) -> DetectOutcome {
        let mut local_by_key: BTreeMap<EntityKey, Vec<&ChangeLogEntry>> = BTreeMap::new();
        for entry in local {
            local_by_key.entry(entry.key()).or_default().push(entry);
        }
        let mut remote_by_key: BTreeMap<EntityKey, Vec<&ChangeLogEntry>> = BTreeMap::new();
        for entry in remote {
            remote_by_key.entry(entry.key()).or_default().push(entry);
        }

        let mut conflicted_keys: BTreeSet<EntityKey> = BTreeSet::new();
        let mut pairs = Vec::new();
        let mut sequential = Vec::new();

        // Same-key collisions. With several entries per key the latest on
        // each side represents the entity's end state.
        for (key, local_entries) in &local_by_key {
            let Some(remote_entries) = remote_by_key.get(key) else {
                continue;
            };
            let local_last = *local_entries.last().unwrap();
            let remote_last = *remote_entries.last().unwrap();

            if local_last.change_type == ChangeType::Delete
                && remote_last.change_type == ChangeType::Delete
            {
                // Both sides deleted; converged already.
                continue;
            }

            conflicted_keys.insert(key.clone());
            if self.is_sequential(local_last, remote_last) {
                sequential.push(SequentialPair {
                    local_entry: local_last.clone(),
                    remote_entry: remote_last.clone(),
                });
            } else {
                pairs.push(self.classify(local_last, remote_last));
            }
        }

        // Cross-id annotation overlaps: same layer triple, different ids.
        let local_layers = annotation_layers(local, &conflicted_keys);
        let remote_layers = annotation_layers(remote, &conflicted_keys);
        for (triple, local_entry) in &local_layers {
            if let Some(remote_entry) = remote_layers.get(triple) {
                if local_entry.entity_id != remote_entry.entity_id {
                    conflicted_keys.insert(local_entry.key());
                    conflicted_keys.insert(remote_entry.key());
                    pairs.push(self.classify(local_entry, remote_entry));
                }
            }
        }

        let clean_local: Vec<ChangeLogEntry> = local
            .iter()
            .filter(|e| !conflicted_keys.contains(&e.key()))
            .cloned()
            .collect();
        let clean_remote: Vec<ChangeLogEntry> = remote
            .iter()
            .filter(|e| !conflicted_keys.contains(&e.key()))
            .cloned()
            .collect();

        debug!(
            conflicts = pairs.len(),
            sequential = sequential.len(),
            clean_local = clean_local.len(),
            clean_remote = clean_remote.len(),
            "Partitioned changes"
        );

        DetectOutcome {
            pairs,
            sequential,
            clean_local,
            clean_remote,
        }
    }

    /// Whether a same-key collision is sequential rather than concurrent:
    /// plain content edits whose timestamps are further apart than the
    /// window. Deletes, structural changes, and annotation overlaps always
    /// classify as conflicts regardless of the gap.
    fn is_sequential(&self, local: &ChangeLogEntry, remote: &ChangeLogEntry) -> bool {
        !local.entity_type.is_structural()
            && local.change_type != ChangeType::Delete
            && remote.change_type != ChangeType::Delete
            && !is_annotation_overlap(local, remote)
            && !self.within_window(local.timestamp, remote.timestamp)
    }

    fn classify(&self, local: &ChangeLogEntry, remote: &ChangeLogEntry) -> ConflictPair {
        let conflict_type = if local.entity_type.is_structural() {
            // Membership and ownership changes are irreversible in effect;
            // a human must confirm them.
            ConflictType::StructureChange
        } else if local.change_type == ChangeType::Delete
            || remote.change_type == ChangeType::Delete
        {
            ConflictType::DeleteModify
        } else if is_annotation_overlap(local, remote) {
            ConflictType::AnnotationOverlap
        } else {
            // Both sides created/updated content inside the concurrent
            // window; detection routed the outside-window pairs away
            // as sequential.
            ConflictType::SimultaneousEdit
        };

        let can_auto_resolve = matches!(
            conflict_type,
            ConflictType::SimultaneousEdit | ConflictType::AnnotationOverlap
        );

        ConflictPair {
            conflict: SyncConflict {
                conflict_id: Uuid::new_v4().to_string(),
                entity_type: local.entity_type,
                entity_id: local.entity_id.clone(),
                entity_name: local.entity_name.clone(),
                local_version: ConflictVersion::from_entry(local),
                remote_version: ConflictVersion::from_entry(remote),
                conflict_type,
                can_auto_resolve,
            },
            local_entry: local.clone(),
            remote_entry: remote.clone(),
        }
    }

    /// Whether two UPDATE timestamps fall inside the concurrent-edit
    /// window. Beyond the window the edits are sequential and no conflict
    /// is raised.
    pub fn within_window(&self, local_ts: i64, remote_ts: i64) -> bool {
        (local_ts - remote_ts).abs() <= self.window_ms
    }

    /// Deterministic last-writer-wins: strictly greater timestamp wins; on
    /// an exact tie the lexicographically greater device id wins.
    pub fn lww_winner(&self, local: &ChangeLogEntry, remote: &ChangeLogEntry) -> Winner {
        match local.timestamp.cmp(&remote.timestamp) {
            std::cmp::Ordering::Greater => Winner::Local,
            std::cmp::Ordering::Less => Winner::Remote,
            std::cmp::Ordering::Equal => {
                if local.device_id > remote.device_id {
                    Winner::Local
                } else {
                    Winner::Remote
                }
            }
        }
    }

    /// Apply the auto-resolution policies. Returns resolutions for the
    /// conflicts no human needs to see, and the remainder for manual
    /// action.
    pub fn auto_resolve(&self, pairs: Vec<ConflictPair>) -> AutoResolveOutcome {
        let mut outcome = AutoResolveOutcome::default();

        for pair in pairs {
            match pair.conflict.conflict_type {
                ConflictType::AnnotationOverlap => {
                    // Strokes are additive; merging never loses data.
                    outcome.resolutions.push(AutoResolution::MergeLayers(pair));
                }
                ConflictType::SimultaneousEdit => {
                    // Concurrent edits settle by last-writer-wins.
                    match self.lww_winner(&pair.local_entry, &pair.remote_entry) {
                        Winner::Local => {
                            outcome.resolutions.push(AutoResolution::LocalWins(pair))
                        }
                        Winner::Remote => {
                            outcome.resolutions.push(AutoResolution::RemoteWins(pair))
                        }
                    }
                }
                ConflictType::DeleteModify | ConflictType::StructureChange => {
                    // Never auto-resolved: both versions are retained until
                    // a human chooses.
                    outcome.unresolved.push(pair);
                }
            }
        }

        outcome
    }

    /// Validate a manual resolution action against the conflict class.
    ///
    /// Returns the action for the orchestrator to apply.
    pub fn resolve(
        &self,
        conflict: &SyncConflict,
        action: ResolutionAction,
    ) -> Result<ResolutionAction> {
        let valid = match action {
            ResolutionAction::KeepLocal | ResolutionAction::AcceptRemote => true,
            ResolutionAction::MergeAnnotations | ResolutionAction::LayerSeparate => {
                conflict.conflict_type == ConflictType::AnnotationOverlap
            }
            ResolutionAction::ManualMerge => false,
        };

        if !valid {
            return Err(Error::ConflictUnresolved(format!(
                "action {:?} is not applicable to a {:?} conflict",
                action, conflict.conflict_type
            )));
        }
        Ok(action)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn is_annotation_overlap(local: &ChangeLogEntry, remote: &ChangeLogEntry) -> bool {
    if local.change_type == ChangeType::Delete || remote.change_type == ChangeType::Delete {
        return false;
    }
    match (local.annotation_layer(), remote.annotation_layer()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Latest non-delete annotation entry per layer triple, skipping keys
/// already paired.
fn annotation_layers<'a>(
    entries: &'a [ChangeLogEntry],
    skip: &BTreeSet<EntityKey>,
) -> BTreeMap<(String, String, u32), &'a ChangeLogEntry> {
    let mut layers = BTreeMap::new();
    for entry in entries {
        if entry.change_type == ChangeType::Delete || skip.contains(&entry.key()) {
            continue;
        }
        if let Some(triple) = entry.annotation_layer() {
            layers.insert(triple, entry);
        }
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_common::model::{EntityType, META_FILE_ID, META_MEMBER_ID, META_PAGE_NUMBER};
    use ensemble_common::DeviceId;
    use std::collections::BTreeMap as Map;

    fn entry(
        device: &str,
        entity_type: EntityType,
        entity_id: &str,
        change_type: ChangeType,
        ts: i64,
    ) -> ChangeLogEntry {
        ChangeLogEntry {
            change_id: Uuid::new_v4().to_string(),
            timestamp: ts,
            device_id: DeviceId::new(device).unwrap(),
            device_name: device.to_string(),
            entity_type,
            entity_id: entity_id.to_string(),
            entity_name: entity_id.to_string(),
            change_type,
            checksum: "sum".into(),
            description: String::new(),
            metadata: Map::new(),
            synced: false,
        }
    }

    fn annotation_entry(device: &str, id: &str, ts: i64, page: u32) -> ChangeLogEntry {
        let mut e = entry(device, EntityType::Annotation, id, ChangeType::Create, ts);
        e.metadata.insert(META_FILE_ID.into(), "f1".into());
        e.metadata.insert(META_MEMBER_ID.into(), "m1".into());
        e.metadata.insert(META_PAGE_NUMBER.into(), page.to_string());
        e
    }

    #[test]
    fn test_disjoint_keys_are_clean() {
        // Scenario A: unrelated entities never conflict.
        let resolver = ConflictResolver::new();
        let local = vec![entry("x", EntityType::Song, "s1", ChangeType::Create, 1000)];
        let remote = vec![entry("y", EntityType::Setlist, "l1", ChangeType::Create, 1005)];

        let outcome = resolver.detect_conflicts(&local, &remote);
        assert!(outcome.pairs.is_empty());
        assert_eq!(outcome.clean_local.len(), 1);
        assert_eq!(outcome.clean_remote.len(), 1);
    }

    #[test]
    fn test_delete_modify_never_auto() {
        // Scenario B.
        let resolver = ConflictResolver::new();
        let local = vec![entry("x", EntityType::Song, "s1", ChangeType::Delete, 2000)];
        let remote = vec![entry("y", EntityType::Song, "s1", ChangeType::Update, 2010)];

        let outcome = resolver.detect_conflicts(&local, &remote);
        assert_eq!(outcome.pairs.len(), 1);
        let conflict = &outcome.pairs[0].conflict;
        assert_eq!(conflict.conflict_type, ConflictType::DeleteModify);
        assert!(!conflict.can_auto_resolve);

        let auto = resolver.auto_resolve(outcome.pairs);
        assert!(auto.resolutions.is_empty());
        assert_eq!(auto.unresolved.len(), 1);
    }

    #[test]
    fn test_simultaneous_edit_lww() {
        // Scenario C: 200s apart, remote is later and wins.
        let resolver = ConflictResolver::new();
        let local = vec![entry("x", EntityType::Setlist, "l1", ChangeType::Update, 3_000_000)];
        let remote = vec![entry("y", EntityType::Setlist, "l1", ChangeType::Update, 3_200_000)];

        let outcome = resolver.detect_conflicts(&local, &remote);
        assert_eq!(
            outcome.pairs[0].conflict.conflict_type,
            ConflictType::SimultaneousEdit
        );

        let auto = resolver.auto_resolve(outcome.pairs);
        assert!(auto.unresolved.is_empty());
        assert!(matches!(auto.resolutions[0], AutoResolution::RemoteWins(_)));
    }

    #[test]
    fn test_gap_at_the_window_boundary_is_concurrent() {
        let resolver = ConflictResolver::new();
        let local = vec![entry("x", EntityType::Song, "s1", ChangeType::Update, 0)];
        let remote = vec![entry(
            "y",
            EntityType::Song,
            "s1",
            ChangeType::Update,
            SIMULTANEOUS_EDIT_WINDOW_MS,
        )];

        let outcome = resolver.detect_conflicts(&local, &remote);
        assert!(outcome.sequential.is_empty());
        assert_eq!(
            outcome.pairs[0].conflict.conflict_type,
            ConflictType::SimultaneousEdit
        );
    }

    #[test]
    fn test_gap_beyond_the_window_is_sequential() {
        let resolver = ConflictResolver::new();
        let local = vec![entry("x", EntityType::Song, "s1", ChangeType::Update, 0)];
        let remote = vec![entry(
            "y",
            EntityType::Song,
            "s1",
            ChangeType::Update,
            SIMULTANEOUS_EDIT_WINDOW_MS + 1,
        )];

        let outcome = resolver.detect_conflicts(&local, &remote);
        assert!(outcome.pairs.is_empty());
        assert_eq!(outcome.sequential.len(), 1);
        // Neither entry is clean: the later one supersedes the earlier.
        assert!(outcome.clean_local.is_empty());
        assert!(outcome.clean_remote.is_empty());
        assert_eq!(
            resolver.lww_winner(
                &outcome.sequential[0].local_entry,
                &outcome.sequential[0].remote_entry
            ),
            Winner::Remote
        );
    }

    #[test]
    fn test_narrowed_window_reclassifies_as_sequential() {
        let resolver = ConflictResolver::new().with_window_ms(100);
        let local = vec![entry("x", EntityType::Song, "s1", ChangeType::Update, 0)];
        let remote = vec![entry("y", EntityType::Song, "s1", ChangeType::Update, 200)];

        let outcome = resolver.detect_conflicts(&local, &remote);
        assert!(outcome.pairs.is_empty());
        assert_eq!(outcome.sequential.len(), 1);
    }

    #[test]
    fn test_delete_beyond_the_window_is_still_a_conflict() {
        let resolver = ConflictResolver::new();
        let local = vec![entry("x", EntityType::Song, "s1", ChangeType::Delete, 0)];
        let remote = vec![entry(
            "y",
            EntityType::Song,
            "s1",
            ChangeType::Update,
            SIMULTANEOUS_EDIT_WINDOW_MS + 1,
        )];

        let outcome = resolver.detect_conflicts(&local, &remote);
        assert!(outcome.sequential.is_empty());
        assert_eq!(
            outcome.pairs[0].conflict.conflict_type,
            ConflictType::DeleteModify
        );
    }

    #[test]
    fn test_lww_tie_breaks_on_device_id() {
        let resolver = ConflictResolver::new();
        let local = entry("device-b", EntityType::Song, "s1", ChangeType::Update, 100);
        let remote = entry("device-a", EntityType::Song, "s1", ChangeType::Update, 100);
        assert_eq!(resolver.lww_winner(&local, &remote), Winner::Local);

        let local = entry("device-a", EntityType::Song, "s1", ChangeType::Update, 100);
        let remote = entry("device-b", EntityType::Song, "s1", ChangeType::Update, 100);
        assert_eq!(resolver.lww_winner(&local, &remote), Winner::Remote);
    }

    #[test]
    fn test_structure_change_never_auto() {
        let resolver = ConflictResolver::new();
        let local = vec![entry("x", EntityType::Member, "m1", ChangeType::Update, 100)];
        let remote = vec![entry("y", EntityType::Member, "m1", ChangeType::Update, 150)];

        let outcome = resolver.detect_conflicts(&local, &remote);
        let conflict = &outcome.pairs[0].conflict;
        assert_eq!(conflict.conflict_type, ConflictType::StructureChange);
        assert!(!conflict.can_auto_resolve);

        let auto = resolver.auto_resolve(outcome.pairs);
        assert_eq!(auto.unresolved.len(), 1);
    }

    #[test]
    fn test_annotation_overlap_across_layer_ids() {
        // Scenario D: different annotation ids, same layer triple.
        let resolver = ConflictResolver::new();
        let local = vec![annotation_entry("x", "layer-a", 4000, 0)];
        let remote = vec![annotation_entry("y", "layer-b", 4050, 0)];

        let outcome = resolver.detect_conflicts(&local, &remote);
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(
            outcome.pairs[0].conflict.conflict_type,
            ConflictType::AnnotationOverlap
        );
        assert!(outcome.clean_local.is_empty());
        assert!(outcome.clean_remote.is_empty());

        let auto = resolver.auto_resolve(outcome.pairs);
        assert!(matches!(auto.resolutions[0], AutoResolution::MergeLayers(_)));
    }

    #[test]
    fn test_annotations_on_different_pages_do_not_overlap() {
        let resolver = ConflictResolver::new();
        let local = vec![annotation_entry("x", "layer-a", 4000, 0)];
        let remote = vec![annotation_entry("y", "layer-b", 4050, 1)];

        let outcome = resolver.detect_conflicts(&local, &remote);
        assert!(outcome.pairs.is_empty());
        assert_eq!(outcome.clean_local.len(), 1);
        assert_eq!(outcome.clean_remote.len(), 1);
    }

    #[test]
    fn test_both_deleted_converges_without_conflict() {
        let resolver = ConflictResolver::new();
        let local = vec![entry("x", EntityType::Song, "s1", ChangeType::Delete, 100)];
        let remote = vec![entry("y", EntityType::Song, "s1", ChangeType::Delete, 120)];

        let outcome = resolver.detect_conflicts(&local, &remote);
        assert!(outcome.pairs.is_empty());
    }

    #[test]
    fn test_manual_action_validation() {
        let resolver = ConflictResolver::new();
        let local = entry("x", EntityType::Song, "s1", ChangeType::Delete, 100);
        let remote = entry("y", EntityType::Song, "s1", ChangeType::Update, 120);
        let pair = resolver.classify(&local, &remote);

        assert!(resolver
            .resolve(&pair.conflict, ResolutionAction::KeepLocal)
            .is_ok());
        assert!(resolver
            .resolve(&pair.conflict, ResolutionAction::MergeAnnotations)
            .is_err());
        assert!(resolver
            .resolve(&pair.conflict, ResolutionAction::ManualMerge)
            .is_err());
    }
}
