//! Version tracker
//!
//! Responsibilities:
//! - store the last-known version and payload of every resource
//! - keep versions monotonically non-decreasing

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::protocol::ResourceType;
use crate::queue::ResourceKey;

/// Locally held copy of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalResource {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub version: u64,
    pub data: Value,
    /// Timestamp of the write that produced `data`, UTC milliseconds
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl LocalResource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type, self.resource_id.clone())
    }
}

/// Version tracker
#[derive(Debug, Clone, Default)]
pub struct VersionTracker {
    /// resource -> last-known state
    cache: Arc<RwLock<HashMap<ResourceKey, LocalResource>>>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<LocalResource> {
        self.cache.read().get(key).cloned()
    }

    pub fn local_version(&self, key: &ResourceKey) -> Option<u64> {
        self.cache.read().get(key).map(|r| r.version)
    }

    /// Store `resource` unless a newer version is already held.
    /// Returns whether the cache changed.
    pub fn store(&self, resource: LocalResource) -> bool {
        let key = resource.key();
        let mut cache = self.cache.write();
        if let Some(existing) = cache.get(&key) {
            if resource.version < existing.version {
                warn!(
                    "refusing version regression: {} local={} incoming={}",
                    key, existing.version, resource.version
                );
                return false;
            }
        }
        debug!("store {} version={}", key, resource.version);
        cache.insert(key, resource);
        true
    }

    pub fn all(&self) -> Vec<LocalResource> {
        self.cache.read().values().cloned().collect()
    }
}
