//! Conflict resolution
//!
//! Pure decision logic reconciling an inbound versioned update with the
//! locally held copy of the resource and any unacknowledged local edit.
//! Nothing here mutates state; the manager applies the returned
//! [`Resolution`].
//!
//! Write order between two sides is decided by timestamp, then by the
//! lexicographically greater user id. For a version mismatch the inbound side
//! is always the later write since its version is strictly newer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::protocol::{ResourceType, ResourceUpdate, UpdateAction};
use crate::sync::version_tracker::LocalResource;
use crate::utils::now_millis;

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConflictStrategy {
    #[default]
    #[serde(rename = "last-write-wins")]
    LastWriteWins,
    #[serde(rename = "operational-transform")]
    OperationalTransform,
    #[serde(rename = "crdt")]
    Crdt,
    #[serde(rename = "manual")]
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::OperationalTransform => "operational-transform",
            ConflictStrategy::Crdt => "crdt",
            ConflictStrategy::Manual => "manual",
        }
    }

    fn merges_fields(&self) -> bool {
        matches!(self, ConflictStrategy::OperationalTransform | ConflictStrategy::Crdt)
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Inbound update while a local edit of the same resource is unacknowledged
    ConcurrentEdit,
    /// Inbound version skips at least one version
    VersionMismatch,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::ConcurrentEdit => f.write_str("concurrent_edit"),
            ConflictType::VersionMismatch => f.write_str("version_mismatch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    /// Version the resource holds after resolution
    pub version: u64,
    /// Timestamp of the winning write
    pub timestamp: i64,
    /// Author of the winning write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetectedEvent {
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub conflict_type: ConflictType,
    pub local_version: u64,
    pub server_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
    /// Local side of the conflict (pending edit or cached data)
    #[serde(default)]
    pub local_data: Value,
    #[serde(default)]
    pub server_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_user_id: Option<String>,
    pub server_timestamp: i64,
    pub detected_at: i64,
}

/// Unacknowledged local edit of a resource
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEdit {
    pub action: UpdateAction,
    pub data: Value,
    pub timestamp: i64,
    pub user_id: Option<String>,
}

/// Outcome of [`ConflictResolver::resolve`]
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Already seen; drop without notifying anyone
    Stale { local_version: u64, inbound_version: u64 },
    /// No conflict; store the state and deliver the update
    Apply(LocalResource),
    /// Conflict settled automatically
    Resolved {
        state: LocalResource,
        conflict: ConflictDetectedEvent,
    },
    /// Left for the UI; local state must stay untouched
    NeedsManual(ConflictDetectedEvent),
}

/// One side of a conflict
struct Side<'a> {
    action: UpdateAction,
    data: &'a Value,
    timestamp: i64,
    user_id: Option<&'a str>,
}

/// Conflict resolver
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
    per_type: HashMap<ResourceType, ConflictStrategy>,
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy,
            per_type: HashMap::new(),
        }
    }

    pub fn with_strategy(mut self, resource_type: ResourceType, strategy: ConflictStrategy) -> Self {
        self.per_type.insert(resource_type, strategy);
        self
    }

    pub fn strategy_for(&self, resource_type: ResourceType) -> ConflictStrategy {
        self.per_type
            .get(&resource_type)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Decide what to do with `inbound` given the cached copy and any
    /// pending local edit of the same resource
    pub fn resolve(
        &self,
        local: Option<&LocalResource>,
        pending: Option<&LocalEdit>,
        inbound: &ResourceUpdate,
    ) -> Resolution {
        let local_version = local.map_or(0, |l| l.version);

        if let (Some(local), Some(inbound_version)) = (local, inbound.version) {
            if inbound_version <= local.version {
                debug!(
                    "stale update for {}/{}: local={} inbound={}",
                    inbound.resource_type, inbound.resource_id, local.version, inbound_version
                );
                return Resolution::Stale {
                    local_version: local.version,
                    inbound_version,
                };
            }
        }

        // a pending local edit conflicts even when nothing is cached yet
        let (conflict_type, local_side, inbound_version) = match (pending, local, inbound.version) {
            (Some(edit), _, version) => (
                ConflictType::ConcurrentEdit,
                Side {
                    action: edit.action,
                    data: &edit.data,
                    timestamp: edit.timestamp,
                    user_id: edit.user_id.as_deref(),
                },
                version.unwrap_or(local_version),
            ),
            (None, None, version) => {
                debug!("baseline for {}/{}", inbound.resource_type, inbound.resource_id);
                return Resolution::Apply(state_from_inbound(inbound, version.unwrap_or(0)));
            }
            // unversioned updates cannot be ordered; apply without moving the version
            (None, Some(local), None) => {
                return Resolution::Apply(state_from_inbound(inbound, local.version));
            }
            (None, Some(local), Some(version)) if version == local.version + 1 => {
                return Resolution::Apply(state_from_inbound(inbound, version));
            }
            (None, Some(local), Some(version)) => (
                ConflictType::VersionMismatch,
                Side {
                    action: if local.deleted { UpdateAction::Delete } else { UpdateAction::Update },
                    data: &local.data,
                    timestamp: local.updated_at,
                    user_id: local.updated_by.as_deref(),
                },
                version,
            ),
        };

        let strategy = self.strategy_for(inbound.resource_type);
        let mut conflict = ConflictDetectedEvent {
            resource_id: inbound.resource_id.clone(),
            resource_type: inbound.resource_type,
            conflict_type,
            local_version,
            server_version: inbound_version,
            resolution: None,
            local_data: local_side.data.clone(),
            server_data: inbound.data.clone(),
            server_user_id: inbound.user_id.clone(),
            server_timestamp: inbound.timestamp,
            detected_at: now_millis(),
        };
        info!(
            "conflict {} on {}/{} local={} server={} strategy={}",
            conflict_type, inbound.resource_type, inbound.resource_id, local_version, inbound_version, strategy
        );

        if strategy == ConflictStrategy::Manual {
            return Resolution::NeedsManual(conflict);
        }

        let server_side = Side {
            action: inbound.action,
            data: &inbound.data,
            timestamp: inbound.timestamp,
            user_id: inbound.user_id.as_deref(),
        };
        let inbound_wins = match conflict_type {
            ConflictType::VersionMismatch => true,
            ConflictType::ConcurrentEdit => is_later_write(&server_side, &local_side),
        };
        let (winner, loser) = if inbound_wins {
            (&server_side, &local_side)
        } else {
            (&local_side, &server_side)
        };

        let deleted = winner.action == UpdateAction::Delete;
        let merged = if deleted {
            Value::Null
        } else if strategy.merges_fields() && loser.action != UpdateAction::Delete {
            merge_fields(winner.data, loser.data)
        } else {
            winner.data.clone()
        };

        conflict.resolution = Some(ConflictResolution {
            strategy,
            version: inbound_version,
            timestamp: winner.timestamp,
            user_id: winner.user_id.map(str::to_string),
            merged_data: Some(merged.clone()),
        });

        let state = LocalResource {
            resource_type: inbound.resource_type,
            resource_id: inbound.resource_id.clone(),
            version: inbound_version,
            data: merged,
            updated_at: winner.timestamp,
            updated_by: winner.user_id.map(str::to_string),
            deleted,
        };
        Resolution::Resolved { state, conflict }
    }
}

fn state_from_inbound(inbound: &ResourceUpdate, version: u64) -> LocalResource {
    let deleted = inbound.action == UpdateAction::Delete;
    LocalResource {
        resource_type: inbound.resource_type,
        resource_id: inbound.resource_id.clone(),
        version,
        data: if deleted { Value::Null } else { inbound.data.clone() },
        updated_at: inbound.timestamp,
        updated_by: inbound.user_id.clone(),
        deleted,
    }
}

/// Later timestamp wins; on a tie the greater user id wins
fn is_later_write(a: &Side<'_>, b: &Side<'_>) -> bool {
    match a.timestamp.cmp(&b.timestamp) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.user_id.unwrap_or("") > b.user_id.unwrap_or(""),
    }
}

/// Field-level merge: union of both objects, winner's value on shared fields.
/// Non-object values fall back to the winner.
fn merge_fields(winner: &Value, loser: &Value) -> Value {
    match (winner, loser) {
        (Value::Object(w), Value::Object(l)) => {
            let mut merged: Map<String, Value> = l.clone();
            for (field, value) in w {
                let next = match merged.get(field) {
                    Some(existing) => merge_fields(value, existing),
                    None => value.clone(),
                };
                merged.insert(field.clone(), next);
            }
            Value::Object(merged)
        }
        _ => winner.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProjectUpdateEvent, RealtimeEvent};
    use serde_json::json;

    fn cached(version: u64, data: Value) -> LocalResource {
        LocalResource {
            resource_type: ResourceType::Project,
            resource_id: "p1".to_string(),
            version,
            data,
            updated_at: 1_000,
            updated_by: Some("alice".to_string()),
            deleted: false,
        }
    }

    fn inbound(version: u64, data: Value, timestamp: i64, user: &str) -> ResourceUpdate {
        let event: RealtimeEvent = ProjectUpdateEvent::new("p1", UpdateAction::Update, data)
            .to_event()
            .with_version(version)
            .with_timestamp(timestamp)
            .with_user(user);
        ResourceUpdate::from_event(&event).unwrap().unwrap()
    }

    fn edit(data: Value, timestamp: i64, user: &str) -> LocalEdit {
        LocalEdit {
            action: UpdateAction::Update,
            data,
            timestamp,
            user_id: Some(user.to_string()),
        }
    }

    #[test]
    fn test_no_local_record_is_baseline() {
        let resolver = ConflictResolver::default();
        let update = inbound(7, json!({ "name": "A" }), 2_000, "bob");
        match resolver.resolve(None, None, &update) {
            Resolution::Apply(state) => {
                assert_eq!(state.version, 7);
                assert_eq!(state.data["name"], "A");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_in_order_update_applies() {
        let resolver = ConflictResolver::default();
        let local = cached(3, json!({}));
        let update = inbound(4, json!({ "name": "B" }), 2_000, "bob");
        assert!(matches!(resolver.resolve(Some(&local), None, &update), Resolution::Apply(s) if s.version == 4));
    }

    #[test]
    fn test_version_gap_resolves_to_server() {
        let resolver = ConflictResolver::default();
        let local = cached(3, json!({ "name": "local" }));
        let update = inbound(5, json!({ "name": "server" }), 500, "bob");

        match resolver.resolve(Some(&local), None, &update) {
            Resolution::Resolved { state, conflict } => {
                assert_eq!(conflict.conflict_type, ConflictType::VersionMismatch);
                assert_eq!(conflict.local_version, 3);
                assert_eq!(conflict.server_version, 5);
                assert_eq!(state.version, 5);
                assert_eq!(state.data["name"], "server");
                let resolution = conflict.resolution.unwrap();
                assert_eq!(resolution.strategy, ConflictStrategy::LastWriteWins);
                assert_eq!(resolution.user_id.as_deref(), Some("bob"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_delivery_is_stale() {
        let resolver = ConflictResolver::default();
        let update = inbound(4, json!({ "name": "B" }), 2_000, "bob");
        let Resolution::Apply(state) = resolver.resolve(Some(&cached(3, json!({}))), None, &update) else {
            panic!("first delivery should apply");
        };
        assert_eq!(
            resolver.resolve(Some(&state), None, &update),
            Resolution::Stale { local_version: 4, inbound_version: 4 }
        );
    }

    #[test]
    fn test_concurrent_edit_last_write_wins() {
        let resolver = ConflictResolver::default();
        let local = cached(3, json!({ "name": "old" }));

        let newer_local = edit(json!({ "name": "mine" }), 3_000, "alice");
        let update = inbound(4, json!({ "name": "theirs" }), 2_000, "bob");
        match resolver.resolve(Some(&local), Some(&newer_local), &update) {
            Resolution::Resolved { state, conflict } => {
                assert_eq!(conflict.conflict_type, ConflictType::ConcurrentEdit);
                assert_eq!(state.data["name"], "mine");
                assert_eq!(state.version, 4);
            }
            other => panic!("unexpected {:?}", other),
        }

        let older_local = edit(json!({ "name": "mine" }), 1_500, "alice");
        let Resolution::Resolved { state, .. } = resolver.resolve(Some(&local), Some(&older_local), &update) else {
            panic!("expected resolution");
        };
        assert_eq!(state.data["name"], "theirs");
    }

    #[test]
    fn test_pending_edit_without_cache_is_concurrent() {
        let resolver = ConflictResolver::default();
        let pending = edit(json!({ "name": "mine" }), 7_000, "alice");
        let update = inbound(2, json!({ "name": "theirs" }), 2_000, "bob");

        let Resolution::Resolved { state, conflict } = resolver.resolve(None, Some(&pending), &update) else {
            panic!("expected resolution");
        };
        assert_eq!(conflict.conflict_type, ConflictType::ConcurrentEdit);
        assert_eq!(conflict.local_version, 0);
        assert_eq!(conflict.server_version, 2);
        assert_eq!(state.version, 2);
        assert_eq!(state.data["name"], "mine");
    }

    #[test]
    fn test_unversioned_update_with_pending_edit_is_concurrent() {
        let resolver = ConflictResolver::default();
        let local = cached(3, json!({ "name": "old" }));
        let pending = edit(json!({ "name": "mine" }), 1_000, "alice");
        let mut update = inbound(4, json!({ "name": "theirs" }), 2_000, "bob");
        update.version = None;

        let Resolution::Resolved { state, conflict } = resolver.resolve(Some(&local), Some(&pending), &update) else {
            panic!("expected resolution");
        };
        assert_eq!(conflict.conflict_type, ConflictType::ConcurrentEdit);
        assert_eq!(state.version, 3);
        assert_eq!(state.data["name"], "theirs");
    }

    #[test]
    fn test_timestamp_tie_breaks_on_user_id() {
        let resolver = ConflictResolver::default();
        let local = cached(3, json!({}));
        let update = inbound(4, json!({ "name": "bob's" }), 2_000, "bob");

        let Resolution::Resolved { state, .. } =
            resolver.resolve(Some(&local), Some(&edit(json!({ "name": "alice's" }), 2_000, "alice")), &update)
        else {
            panic!("expected resolution");
        };
        assert_eq!(state.data["name"], "bob's");

        let Resolution::Resolved { state, .. } =
            resolver.resolve(Some(&local), Some(&edit(json!({ "name": "zoe's" }), 2_000, "zoe")), &update)
        else {
            panic!("expected resolution");
        };
        assert_eq!(state.data["name"], "zoe's");
    }

    #[test]
    fn test_crdt_merges_fields() {
        let resolver = ConflictResolver::default().with_strategy(ResourceType::Project, ConflictStrategy::Crdt);
        let local = cached(3, json!({}));
        let pending = edit(json!({ "name": "mine", "color": "red" }), 1_000, "alice");
        let update = inbound(4, json!({ "name": "theirs", "owner": "bob" }), 2_000, "bob");

        let Resolution::Resolved { state, conflict } = resolver.resolve(Some(&local), Some(&pending), &update) else {
            panic!("expected resolution");
        };
        assert_eq!(state.data, json!({ "name": "theirs", "color": "red", "owner": "bob" }));
        assert_eq!(conflict.resolution.unwrap().merged_data, Some(state.data));
    }

    #[test]
    fn test_manual_strategy_defers() {
        let resolver = ConflictResolver::new(ConflictStrategy::Manual);
        let local = cached(3, json!({}));
        let update = inbound(6, json!({ "name": "server" }), 2_000, "bob");

        match resolver.resolve(Some(&local), None, &update) {
            Resolution::NeedsManual(conflict) => {
                assert!(conflict.resolution.is_none());
                assert_eq!(conflict.server_data["name"], "server");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_value(ConflictStrategy::OperationalTransform).unwrap(), "operational-transform");
        assert_eq!(serde_json::to_value(ConflictType::VersionMismatch).unwrap(), "version_mismatch");
        let parsed: ConflictStrategy = serde_json::from_str("\"last-write-wins\"").unwrap();
        assert_eq!(parsed, ConflictStrategy::LastWriteWins);
    }
}
