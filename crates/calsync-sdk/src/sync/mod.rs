//! Version-based sync
//!
//! Responsibilities:
//! - track the last-known version of every resource
//! - detect stale updates and version gaps
//! - reconcile inbound updates with pending local edits

pub mod conflict;
pub mod version_tracker;

pub use conflict::{
    ConflictDetectedEvent, ConflictResolution, ConflictResolver, ConflictStrategy, ConflictType, LocalEdit,
    Resolution,
};
pub use version_tracker::{LocalResource, VersionTracker};
