//! Common utilities and types shared across Ensemble modules.
//!
//! This module provides the error taxonomy, identifier types, and the shared
//! data model used by the storage and sync layers.

pub mod checksum;
pub mod error;
pub mod model;
pub mod types;

pub use checksum::{canonical_json, checksum_of, checksum_of_bytes, checksum_of_entity};
pub use error::{Error, Result};
pub use types::{DeviceId, GroupId, RemotePath};
