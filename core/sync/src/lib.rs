//! Ensemble Sync Engine
//!
//! This module provides synchronization capabilities for Ensemble, including:
//! - Change tracking with a local append-only changelog
//! - A full sync session state machine per group
//! - Conflict detection, classification, and auto-resolution
//! - Additive merging of overlapping annotation layers
//! - Retry strategy with exponential backoff

pub mod changelog;
pub mod conflict;
pub mod engine;
pub mod merge;
pub mod retry;
pub mod session;

// Re-export main types
pub use changelog::{annotation_metadata, ChangeTracker};
pub use conflict::{
    AutoResolution, AutoResolveOutcome, ConflictPair, ConflictResolver, DetectOutcome,
    SequentialPair, Winner, SIMULTANEOUS_EDIT_WINDOW_MS,
};
pub use engine::{SyncConfig, SyncFailure, SyncOrchestrator, SyncSummary};
pub use merge::{AnnotationMergeEngine, MergeOutcome};
pub use retry::{retry, retry_with_config, RetryConfig, RetryExecutor};
pub use session::{SessionGuard, SessionRegistry, SyncPhase, SyncSession};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::new();
        let _merge = AnnotationMergeEngine::new();
        let _sessions = SessionRegistry::new();
    }
}
