//! Sync session state machine and per-group mutual exclusion.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use ensemble_common::{Error, GroupId, Result};

/// The steps of one sync session, in protocol order. `Error` is terminal
/// and reachable from any step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Authenticating,
    FetchingManifest,
    DownloadingRemoteChanges,
    CollectingLocalChanges,
    DetectingConflicts,
    AutoResolving,
    ApplyingRemote,
    UploadingLocal,
    UpdatingManifest,
    Complete,
    Error,
}

/// Tracks one session's progress through the protocol and checks the
/// cancellation token at every transition. Mid-step cancellation is
/// best-effort: the current operation finishes, then the next transition
/// stops the session.
pub struct SyncSession {
    group_id: GroupId,
    phase: SyncPhase,
    cancel: CancellationToken,
}

impl SyncSession {
    pub fn new(group_id: GroupId, cancel: CancellationToken) -> Self {
        Self {
            group_id,
            phase: SyncPhase::Idle,
            cancel,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Move to the next protocol step, honoring cancellation.
    pub fn transition(&mut self, next: SyncPhase) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.phase = SyncPhase::Error;
            return Err(Error::Cancelled);
        }
        debug!(group = %self.group_id, from = ?self.phase, to = ?next, "Sync phase transition");
        self.phase = next;
        Ok(())
    }

    /// Mark the session failed.
    pub fn fail(&mut self) {
        self.phase = SyncPhase::Error;
    }
}

/// At most one sync session per group may be in flight. Sessions for
/// different groups run independently.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a group for a new session.
    ///
    /// # Errors
    /// - `Error::SyncInProgress` if a session for this group is already
    ///   running. The caller retries after it completes; interleaving two
    ///   sessions would race on the manifest and changelog.
    pub fn begin(&self, group_id: &GroupId) -> Result<SessionGuard> {
        let mut active = self.active.lock().unwrap();
        if !active.insert(group_id.as_str().to_string()) {
            return Err(Error::SyncInProgress(group_id.as_str().to_string()));
        }
        Ok(SessionGuard {
            active: self.active.clone(),
            group: group_id.as_str().to_string(),
        })
    }

    /// Whether a session is active for this group.
    pub fn is_active(&self, group_id: &GroupId) -> bool {
        self.active.lock().unwrap().contains(group_id.as_str())
    }
}

/// Releases the group claim on drop, so a panicking session cannot wedge
/// the group.
pub struct SessionGuard {
    active: Arc<Mutex<HashSet<String>>>,
    group: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str) -> GroupId {
        GroupId::new(id).unwrap()
    }

    #[test]
    fn test_second_session_rejected() {
        let registry = SessionRegistry::new();
        let _guard = registry.begin(&group("g1")).unwrap();

        assert!(matches!(
            registry.begin(&group("g1")),
            Err(Error::SyncInProgress(_))
        ));
    }

    #[test]
    fn test_different_groups_run_concurrently() {
        let registry = SessionRegistry::new();
        let _g1 = registry.begin(&group("g1")).unwrap();
        let _g2 = registry.begin(&group("g2")).unwrap();
        assert!(registry.is_active(&group("g1")));
        assert!(registry.is_active(&group("g2")));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = SessionRegistry::new();
        {
            let _guard = registry.begin(&group("g1")).unwrap();
            assert!(registry.is_active(&group("g1")));
        }
        assert!(!registry.is_active(&group("g1")));
        assert!(registry.begin(&group("g1")).is_ok());
    }

    #[test]
    fn test_cancellation_stops_transitions() {
        let cancel = CancellationToken::new();
        let mut session = SyncSession::new(group("g1"), cancel.clone());

        session.transition(SyncPhase::Authenticating).unwrap();
        cancel.cancel();

        let result = session.transition(SyncPhase::FetchingManifest);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(session.phase(), SyncPhase::Error);
    }

    #[test]
    fn test_phase_sequence() {
        let mut session = SyncSession::new(group("g1"), CancellationToken::new());
        for phase in [
            SyncPhase::Authenticating,
            SyncPhase::FetchingManifest,
            SyncPhase::DownloadingRemoteChanges,
            SyncPhase::CollectingLocalChanges,
            SyncPhase::DetectingConflicts,
            SyncPhase::AutoResolving,
            SyncPhase::ApplyingRemote,
            SyncPhase::UploadingLocal,
            SyncPhase::UpdatingManifest,
            SyncPhase::Complete,
        ] {
            session.transition(phase).unwrap();
        }
        assert_eq!(session.phase(), SyncPhase::Complete);
    }
}
