//! Core sync orchestrator that sequences a full sync session.

use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ensemble_common::model::{
    Annotation, ChangeLogEntry, ChangeType, EntityKey, EntityType, GroupManifest, ManifestMember,
    ResolutionAction,
};
use ensemble_common::{canonical_json, Error, GroupId, Result};
use ensemble_storage::{changelog_timestamp, GroupLayout, LocalStore, RemoteStore, StoreOp};

use crate::changelog::{annotation_metadata, ChangeTracker};
use crate::conflict::{AutoResolution, ConflictPair, ConflictResolver, Winner};
use crate::merge::AnnotationMergeEngine;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::session::{SessionRegistry, SyncPhase, SyncSession};

/// Configuration for the sync orchestrator.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncConfig {
    /// Root folder of the app inside the shared remote store.
    pub app_root: String,
    /// Total attempt budget for each remote operation.
    pub max_attempts: u32,
    /// Delay before the second attempt of a retried operation.
    pub initial_delay: Duration,
    /// Bounded worker pool size for per-entity uploads.
    pub upload_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            app_root: "Ensemble".to_string(),
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            upload_concurrency: 4,
        }
    }
}

/// One per-entity failure folded into the summary instead of aborting the
/// session.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncFailure {
    /// "TYPE:id" of the entity.
    pub entity: String,
    pub error: String,
}

/// Outcome of one sync session.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    /// Remote entries applied to the local store.
    pub applied: usize,
    /// Local entries uploaded (changelog written; content possibly deduped).
    pub uploaded: usize,
    /// Uploads whose content transfer was skipped because checksums matched.
    pub skipped_uploads: usize,
    /// Annotation layer merges performed.
    pub merged_layers: usize,
    /// Conflicts requiring manual action, with both underlying entries so
    /// the caller can hand them back to `resolve_conflict`.
    pub conflicts: Vec<ConflictPair>,
    /// Per-entity failures that did not abort the session.
    pub failures: Vec<SyncFailure>,
    pub duration: Duration,
}

/// Top-level sync state machine. Explicitly constructed with its stores
/// injected, so multiple group sessions and test fakes compose cleanly.
pub struct SyncOrchestrator {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    tracker: ChangeTracker,
    resolver: ConflictResolver,
    merge_engine: AnnotationMergeEngine,
    retry: RetryExecutor,
    sessions: SessionRegistry,
    config: SyncConfig,
}

impl SyncOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        tracker: ChangeTracker,
        config: SyncConfig,
    ) -> Self {
        let retry = RetryExecutor::new(
            RetryConfig::new(config.max_attempts).with_initial_delay(config.initial_delay),
        );
        Self {
            local,
            remote,
            tracker,
            resolver: ConflictResolver::new(),
            merge_engine: AnnotationMergeEngine::new(),
            retry,
            sessions: SessionRegistry::new(),
            config,
        }
    }

    /// The tracker bound to this orchestrator's device identity.
    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Run a full sync session for one group.
    pub async fn sync_group(&self, group_id: &GroupId) -> Result<SyncSummary> {
        self.sync_group_with_cancel(group_id, CancellationToken::new())
            .await
    }

    /// Run a full sync session with cooperative cancellation. The token is
    /// checked at every phase transition; an in-flight remote call is
    /// allowed to finish first.
    pub async fn sync_group_with_cancel(
        &self,
        group_id: &GroupId,
        cancel: CancellationToken,
    ) -> Result<SyncSummary> {
        let _guard = self.sessions.begin(group_id)?;
        let start = Instant::now();
        let mut session = SyncSession::new(group_id.clone(), cancel);

        info!(group = %group_id, "Starting sync session");

        match self.run_session(&mut session, group_id).await {
            Ok(mut summary) => {
                summary.duration = start.elapsed();
                info!(
                    group = %group_id,
                    applied = summary.applied,
                    uploaded = summary.uploaded,
                    conflicts = summary.conflicts.len(),
                    failed = summary.failures.len(),
                    duration = ?summary.duration,
                    "Sync session complete"
                );
                Ok(summary)
            }
            Err(e) => {
                session.fail();
                error!(group = %group_id, error = %e, "Sync session failed");
                Err(e)
            }
        }
    }

    async fn run_session(
        &self,
        session: &mut SyncSession,
        group_id: &GroupId,
    ) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();

        // 1. Authenticate. Auth failures are non-retryable and abort here.
        session.transition(SyncPhase::Authenticating)?;
        self.retry
            .execute(|| async { self.remote.authenticate().await })
            .await?;

        // 2. Group folder + manifest.
        session.transition(SyncPhase::FetchingManifest)?;
        let folder_name = self.group_folder_name(group_id).await?;
        let layout = GroupLayout::new(&self.config.app_root, &folder_name)?;
        self.ensure_folders(&layout).await?;
        let mut manifest = self.fetch_manifest(&layout, group_id, &folder_name).await?;

        // 3. Remote entries newer than the checkpoint.
        session.transition(SyncPhase::DownloadingRemoteChanges)?;
        let checkpoint = self.local.checkpoint(group_id).await?.unwrap_or(0);
        let remote_entries = self.download_remote_changes(&layout, checkpoint).await?;

        // 4. Local unsynced entries.
        session.transition(SyncPhase::CollectingLocalChanges)?;
        let local_entries = self.tracker.unsynced_entries().await?;

        // 5. Partition by entity key.
        session.transition(SyncPhase::DetectingConflicts)?;
        let detected = self.resolver.detect_conflicts(&local_entries, &remote_entries);

        // 6. Auto-resolve what cannot lose data.
        session.transition(SyncPhase::AutoResolving)?;
        let auto = self.resolver.auto_resolve(detected.pairs);
        let mut apply_set = detected.clean_remote;
        let mut upload_set = detected.clean_local;
        let mut merges: Vec<ConflictPair> = Vec::new();

        for resolution in auto.resolutions {
            match resolution {
                AutoResolution::LocalWins(pair) => {
                    debug!(key = %pair.local_entry.key(), "LWW kept local version");
                    // Record the losing remote entry as seen so later
                    // sessions stop re-downloading it.
                    if let Err(e) = self.suppress_remote_entry(&pair.remote_entry).await {
                        warn!(change = %pair.remote_entry.change_id, error = %e,
                            "Failed to retire losing remote entry");
                    }
                    upload_set.push(pair.local_entry);
                }
                AutoResolution::RemoteWins(pair) => {
                    debug!(key = %pair.remote_entry.key(), "LWW kept remote version");
                    // The losing local entry stays in the audit log but is
                    // retired from upload.
                    if let Err(e) = self.tracker.mark_synced(&pair.local_entry.change_id).await {
                        warn!(change = %pair.local_entry.change_id, error = %e,
                            "Failed to retire losing local entry");
                    }
                    apply_set.push(pair.remote_entry);
                }
                AutoResolution::MergeLayers(pair) => merges.push(pair),
            }
        }

        // Same-key edits outside the concurrent window never surface as
        // conflicts; the later entry supersedes the earlier on both sides.
        for pair in detected.sequential {
            match self.resolver.lww_winner(&pair.local_entry, &pair.remote_entry) {
                Winner::Local => {
                    debug!(key = %pair.local_entry.key(), "Sequential edit superseded remote");
                    if let Err(e) = self.suppress_remote_entry(&pair.remote_entry).await {
                        warn!(change = %pair.remote_entry.change_id, error = %e,
                            "Failed to retire superseded remote entry");
                    }
                    upload_set.push(pair.local_entry);
                }
                Winner::Remote => {
                    debug!(key = %pair.remote_entry.key(), "Sequential edit superseded local");
                    if let Err(e) = self.tracker.mark_synced(&pair.local_entry.change_id).await {
                        warn!(change = %pair.local_entry.change_id, error = %e,
                            "Failed to retire superseded local entry");
                    }
                    apply_set.push(pair.remote_entry);
                }
            }
        }
        summary.conflicts = auto.unresolved;

        apply_set.sort_by_key(|e| e.timestamp);

        // 7. Apply remote entries; per-entity failures fold into the
        // summary. The checkpoint may only advance over remote entries that
        // were durably recorded; anything that failed or stayed unresolved
        // must come back in a later session, so it clamps the checkpoint.
        session.transition(SyncPhase::ApplyingRemote)?;
        let mut handled_ts = checkpoint;
        let mut unhandled_ts: Option<i64> = None;
        let mut clamp = |ts: i64| {
            let floor = unhandled_ts.map_or(ts, |u| u.min(ts));
            unhandled_ts = Some(floor);
        };
        for pair in &summary.conflicts {
            clamp(pair.remote_entry.timestamp);
        }

        for entry in &apply_set {
            match self.apply_remote_entry(&layout, entry).await {
                Ok(applied) => {
                    handled_ts = handled_ts.max(entry.timestamp);
                    if applied {
                        summary.applied += 1;
                    }
                }
                Err(e) => {
                    warn!(key = %entry.key(), error = %e, "Failed to apply remote entry");
                    clamp(entry.timestamp);
                    summary.failures.push(SyncFailure {
                        entity: entry.key().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        // Annotation merges touch both stores, then feed new entries into
        // the upload set.
        for pair in merges {
            match self.merge_annotation_layers(&layout, &pair).await {
                Ok(new_entries) => {
                    handled_ts = handled_ts.max(pair.remote_entry.timestamp);
                    summary.merged_layers += 1;
                    upload_set.extend(new_entries);
                }
                Err(e) => {
                    warn!(key = %pair.local_entry.key(), error = %e, "Layer merge failed");
                    clamp(pair.remote_entry.timestamp);
                    summary.failures.push(SyncFailure {
                        entity: pair.local_entry.key().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        upload_set.sort_by_key(|e| e.timestamp);

        // 8. Upload local entries through a bounded worker pool. Each entry
        // is marked synced only after its own upload succeeds.
        session.transition(SyncPhase::UploadingLocal)?;
        let mut upload_results = futures::stream::iter(
            upload_set
                .into_iter()
                .map(|entry| self.upload_local_entry(&layout, entry)),
        )
        .buffer_unordered(self.config.upload_concurrency.max(1));

        while let Some((key, result)) = upload_results.next().await {
            match result {
                Ok(content_skipped) => {
                    summary.uploaded += 1;
                    if content_skipped {
                        summary.skipped_uploads += 1;
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to upload local entry");
                    summary.failures.push(SyncFailure {
                        entity: key,
                        error: e.to_string(),
                    });
                }
            }
        }
        // 9. Refresh the manifest and advance the checkpoint.
        session.transition(SyncPhase::UpdatingManifest)?;
        manifest.touch(self.collect_members().await?, Utc::now());
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let manifest_path = layout.manifest();
        self.retry
            .execute(|| {
                let data = manifest_bytes.clone();
                let path = manifest_path.clone();
                async move { self.remote.upload(&path, data).await }
            })
            .await?;

        let new_checkpoint = match unhandled_ts {
            // Stop just short of the oldest entry still owed to us.
            Some(floor) => handled_ts.min(floor - 1),
            None => handled_ts,
        };
        if new_checkpoint > checkpoint {
            self.local
                .apply(vec![StoreOp::SetCheckpoint {
                    group_id: group_id.clone(),
                    timestamp: new_checkpoint,
                }])
                .await?;
        }

        // 10. Done.
        session.transition(SyncPhase::Complete)?;
        Ok(summary)
    }

    /// Resolve the group's remote folder name from the local GROUP record,
    /// falling back to the id for a group not seen before.
    async fn group_folder_name(&self, group_id: &GroupId) -> Result<String> {
        let key = EntityKey::new(EntityType::Group, group_id.as_str());
        match self.local.entity(&key).await? {
            Some(record) => Ok(record
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(group_id.as_str())
                .to_string()),
            None => Ok(group_id.as_str().to_string()),
        }
    }

    async fn ensure_folders(&self, layout: &GroupLayout) -> Result<()> {
        for folder in layout.folders() {
            self.retry
                .execute(|| {
                    let path = folder.clone();
                    async move { self.remote.create_folder(&path).await }
                })
                .await?;
        }
        Ok(())
    }

    async fn fetch_manifest(
        &self,
        layout: &GroupLayout,
        group_id: &GroupId,
        folder_name: &str,
    ) -> Result<GroupManifest> {
        let path = layout.manifest();
        let present = self
            .retry
            .execute(|| {
                let path = path.clone();
                async move { self.remote.exists(&path).await }
            })
            .await?;
        if present {
            let data = self
                .retry
                .execute(|| {
                    let path = path.clone();
                    async move { self.remote.download(&path).await }
                })
                .await?;
            serde_json::from_slice(&data).map_err(|e| Error::Serialization(e.to_string()))
        } else {
            debug!(group = %group_id, "No remote manifest yet, bootstrapping");
            Ok(GroupManifest::new(group_id.as_str(), folder_name, Utc::now()))
        }
    }

    /// List the remote changelog, pre-filter by the timestamp embedded in
    /// filenames, download and parse the remainder, drop entries that
    /// originated on this device or were already recorded locally, and
    /// sort ascending.
    async fn download_remote_changes(
        &self,
        layout: &GroupLayout,
        checkpoint: i64,
    ) -> Result<Vec<ChangeLogEntry>> {
        let dir = layout.changelog_dir();
        let files = self
            .retry
            .execute(|| {
                let dir = dir.clone();
                async move { self.remote.list(&dir).await }
            })
            .await?;

        let mut entries = Vec::new();
        for file in files {
            if file.is_folder {
                continue;
            }
            match changelog_timestamp(&file.name) {
                Some(ts) if ts <= checkpoint => continue,
                Some(_) => {}
                None => {
                    warn!(name = %file.name, "Skipping unparsable changelog filename");
                    continue;
                }
            }

            let path = dir.join(&file.name)?;
            let data = self
                .retry
                .execute(|| {
                    let path = path.clone();
                    async move { self.remote.download(&path).await }
                })
                .await?;
            let entry: ChangeLogEntry = match serde_json::from_slice(&data) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(name = %file.name, error = %e, "Skipping malformed changelog entry");
                    continue;
                }
            };

            if entry.timestamp <= checkpoint {
                continue;
            }
            if &entry.device_id == self.tracker.device_id() {
                continue;
            }
            if self.local.change(&entry.change_id).await?.is_some() {
                // Already applied in an earlier session.
                continue;
            }
            entries.push(entry);
        }

        entries.sort_by_key(|e| e.timestamp);
        debug!(count = entries.len(), "Downloaded remote changelog entries");
        Ok(entries)
    }

    /// Apply one remote entry to the local store inside a single atomic
    /// batch. Returns false when the entry was already applied.
    async fn apply_remote_entry(
        &self,
        layout: &GroupLayout,
        entry: &ChangeLogEntry,
    ) -> Result<bool> {
        if self.local.change(&entry.change_id).await?.is_some() {
            return Ok(false);
        }

        let mut recorded = entry.clone();
        recorded.synced = true;

        let mut ops = Vec::new();
        match entry.change_type {
            ChangeType::Delete => {
                // Deleting an already-absent entity is a no-op, not an error.
                ops.push(StoreOp::DeleteEntity { key: entry.key() });
            }
            ChangeType::Create | ChangeType::Update => {
                if let Some(path) = layout.entity_path(entry)? {
                    let data = self
                        .retry
                        .execute(|| {
                            let path = path.clone();
                            async move { self.remote.download(&path).await }
                        })
                        .await
                        .map_err(|e| match e {
                            // Racing delete on the other side: fail soft.
                            Error::NotFound(msg) => Error::EntityNotFound(msg),
                            other => other,
                        })?;
                    let record: Value = serde_json::from_slice(&data)
                        .map_err(|e| Error::Serialization(e.to_string()))?;
                    ops.push(StoreOp::PutEntity {
                        key: entry.key(),
                        record,
                    });
                }
                // GROUP/MEMBER entries carry no entity file; membership
                // arrives with the manifest.
            }
        }
        ops.push(StoreOp::AppendChange { entry: recorded });

        self.local.apply(ops).await?;
        debug!(key = %entry.key(), change = %entry.change_id, "Applied remote entry");
        Ok(true)
    }

    /// Upload one local entry: dedup the content transfer by checksum,
    /// always write the changelog entry file, then mark the entry synced.
    /// Returns whether the content transfer was skipped.
    async fn upload_local_entry(
        &self,
        layout: &GroupLayout,
        entry: ChangeLogEntry,
    ) -> (String, Result<bool>) {
        let key = entry.key().to_string();
        let result = self.upload_local_entry_inner(layout, &entry).await;
        (key, result)
    }

    async fn upload_local_entry_inner(
        &self,
        layout: &GroupLayout,
        entry: &ChangeLogEntry,
    ) -> Result<bool> {
        let mut content_skipped = false;

        match entry.change_type {
            ChangeType::Create | ChangeType::Update => {
                if let Some(path) = layout.entity_path(entry)? {
                    let record = self
                        .local
                        .entity(&entry.key())
                        .await?
                        .ok_or_else(|| Error::EntityNotFound(entry.key().to_string()))?;

                    // Source and destination checksums equal: skip the
                    // content transfer, keep the changelog complete.
                    let lookup = self
                        .retry
                        .execute(|| {
                            let path = path.clone();
                            async move { self.remote.metadata(&path).await }
                        })
                        .await;
                    let remote_checksum = match lookup {
                        Ok(meta) => meta.checksum,
                        Err(Error::NotFound(_)) => None,
                        Err(e) => return Err(e),
                    };
                    if remote_checksum.as_deref() == Some(entry.checksum.as_str()) {
                        debug!(key = %entry.key(), "Checksums match, skipping content upload");
                        content_skipped = true;
                    } else {
                        // Annotation files live in nested per-file/per-member
                        // folders that may not exist yet.
                        if let Some(parent) = path.parent() {
                            self.retry
                                .execute(|| {
                                    let parent = parent.clone();
                                    async move { self.remote.create_folder(&parent).await }
                                })
                                .await?;
                        }
                        let data = canonical_json(&record).into_bytes();
                        self.retry
                            .execute(|| {
                                let path = path.clone();
                                let data = data.clone();
                                async move { self.remote.upload(&path, data).await }
                            })
                            .await?;
                    }
                }
            }
            ChangeType::Delete => {
                if let Some(path) = layout.entity_path(entry)? {
                    let removed = self
                        .retry
                        .execute(|| {
                            let path = path.clone();
                            async move { self.remote.delete(&path).await }
                        })
                        .await;
                    match removed {
                        Ok(()) | Err(Error::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        // The changelog entry file always uploads, so the remote trail
        // stays a complete audit log even for deduped content.
        let entry_path = layout.changelog_entry(entry)?;
        let entry_bytes =
            serde_json::to_vec_pretty(entry).map_err(|e| Error::Serialization(e.to_string()))?;
        self.retry
            .execute(|| {
                let path = entry_path.clone();
                let data = entry_bytes.clone();
                async move { self.remote.upload(&path, data).await }
            })
            .await?;

        self.tracker.mark_synced(&entry.change_id).await?;
        Ok(content_skipped)
    }

    /// Merge overlapping annotation layers: collapse local and remote
    /// layers for one (file, member, page) triple into the oldest layer,
    /// record the merge and the layer deletions locally, and hand the new
    /// entries back for upload.
    async fn merge_annotation_layers(
        &self,
        layout: &GroupLayout,
        pair: &ConflictPair,
    ) -> Result<Vec<ChangeLogEntry>> {
        let mut layers: Vec<Annotation> = Vec::new();

        let local_key = pair.local_entry.key();
        let local_record = self
            .local
            .entity(&local_key)
            .await?
            .ok_or_else(|| Error::EntityNotFound(local_key.to_string()))?;
        layers.push(
            serde_json::from_value(local_record)
                .map_err(|e| Error::Serialization(e.to_string()))?,
        );

        // The remote side may be a rival layer under a different id or a
        // divergent copy of the same one; stroke dedup absorbs either.
        let remote_path = layout
            .entity_path(&pair.remote_entry)?
            .ok_or_else(|| Error::InvalidInput("annotation without a path".to_string()))?;
        let data = self
            .retry
            .execute(|| {
                let path = remote_path.clone();
                async move { self.remote.download(&path).await }
            })
            .await?;
        layers
            .push(serde_json::from_slice(&data).map_err(|e| Error::Serialization(e.to_string()))?);

        let outcome = self.merge_engine.merge(layers)?;
        let mut new_entries = Vec::new();

        // The merged primary becomes a fresh local change so every other
        // device converges on the same stroke set.
        let merged_entry = self
            .tracker
            .record_annotation(
                &outcome.merged,
                ChangeType::Update,
                "merged overlapping annotation layers",
            )
            .await?;
        new_entries.push(merged_entry);

        // Non-primary layers are deleted everywhere; the delete entries
        // carry the layer triple so the remote files can be located.
        for layer_id in &outcome.deleted_layer_ids {
            let delete_entry = self
                .tracker
                .record(
                    EntityType::Annotation,
                    layer_id,
                    &pair.local_entry.entity_name,
                    ChangeType::Delete,
                    None,
                    "removed duplicate annotation layer",
                    annotation_metadata(&outcome.merged),
                )
                .await?;
            new_entries.push(delete_entry);
        }

        // The superseded entries are retired: the merge entry carries the
        // combined state forward.
        if let Err(e) = self.tracker.mark_synced(&pair.local_entry.change_id).await {
            warn!(change = %pair.local_entry.change_id, error = %e,
                "Failed to retire pre-merge local entry");
        }
        let mut remote_recorded = pair.remote_entry.clone();
        remote_recorded.synced = true;
        if self
            .local
            .change(&remote_recorded.change_id)
            .await?
            .is_none()
        {
            self.local
                .apply(vec![StoreOp::AppendChange {
                    entry: remote_recorded,
                }])
                .await?;
        }

        debug!(
            primary = %outcome.merged.id,
            strokes = outcome.merged.strokes.len(),
            "Annotation layers merged"
        );
        Ok(new_entries)
    }

    /// Apply the user's decision for a conflict a previous session left
    /// unresolved. `KeepLocal` retires the remote entry so the next session
    /// uploads the local version cleanly; `AcceptRemote` applies the remote
    /// entry and retires the local one; the annotation actions either merge
    /// the layers or keep both. `ManualMerge` is rejected here since the
    /// edited result arrives as a fresh tracked change.
    pub async fn resolve_conflict(
        &self,
        group_id: &GroupId,
        pair: &ConflictPair,
        action: ResolutionAction,
    ) -> Result<()> {
        let action = self.resolver.resolve(&pair.conflict, action)?;
        let folder_name = self.group_folder_name(group_id).await?;
        let layout = GroupLayout::new(&self.config.app_root, &folder_name)?;

        match action {
            ResolutionAction::KeepLocal => {
                self.suppress_remote_entry(&pair.remote_entry).await?;
            }
            ResolutionAction::AcceptRemote => {
                self.apply_remote_entry(&layout, &pair.remote_entry).await?;
                self.tracker.mark_synced(&pair.local_entry.change_id).await?;
            }
            ResolutionAction::MergeAnnotations => {
                // The merge entries stay unsynced and upload next session.
                self.merge_annotation_layers(&layout, pair).await?;
            }
            ResolutionAction::LayerSeparate => {
                // Both layers survive: the remote one is applied, the local
                // one stays pending for upload.
                self.apply_remote_entry(&layout, &pair.remote_entry).await?;
            }
            ResolutionAction::ManualMerge => unreachable!("rejected by the resolver"),
        }

        info!(group = %group_id, key = %pair.local_entry.key(), action = ?action,
            "Conflict resolved manually");
        Ok(())
    }

    /// Record a remote entry locally as already synced without touching the
    /// entity, so later sessions stop re-downloading it.
    async fn suppress_remote_entry(&self, entry: &ChangeLogEntry) -> Result<()> {
        if self.local.change(&entry.change_id).await?.is_some() {
            return Ok(());
        }
        let mut recorded = entry.clone();
        recorded.synced = true;
        self.local
            .apply(vec![StoreOp::AppendChange { entry: recorded }])
            .await
    }

    /// Build the manifest membership from local MEMBER records.
    async fn collect_members(&self) -> Result<Vec<ManifestMember>> {
        let records = self.local.entities_of(EntityType::Member).await?;
        Ok(records
            .into_iter()
            .map(|(id, record)| ManifestMember {
                name: record
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(&id)
                    .to_string(),
                role: record
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("member")
                    .to_string(),
                joined: record.get("joined").and_then(Value::as_i64).unwrap_or(0),
                id,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    // The orchestrator is exercised end-to-end against the in-memory
    // stores in tests/sync_flow.rs.
}
