//! Storage abstractions for Ensemble.
//!
//! Defines the injectable interfaces the sync engine depends on: the shared
//! remote blob store (`RemoteStore`), the transactional local record store
//! (`LocalStore`), the stable remote folder layout, and in-memory
//! implementations of both stores for tests and development.

pub mod layout;
pub mod local;
pub mod memory;
pub mod remote;

pub use layout::{changelog_timestamp, GroupLayout};
pub use local::{LocalStore, MemoryStore, StoreOp};
pub use memory::MemoryRemote;
pub use remote::{RemoteFile, RemoteStore};
