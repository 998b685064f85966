use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::time::Instant;

use crate::protocol::{event_types, CalendarUpdateEvent, ProjectUpdateEvent, RealtimeEvent, ResourceType, UpdateAction};
use crate::queue::priority::SyncPriority;
use crate::utils::now_millis;

/// Kind of outbound operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncItemType {
    #[serde(rename = "calendar:update")]
    CalendarUpdate,
    #[serde(rename = "project:update")]
    ProjectUpdate,
}

impl SyncItemType {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncItemType::CalendarUpdate => event_types::CALENDAR_UPDATE,
            SyncItemType::ProjectUpdate => event_types::PROJECT_UPDATE,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            SyncItemType::CalendarUpdate => ResourceType::Schedule,
            SyncItemType::ProjectUpdate => ResourceType::Project,
        }
    }
}

/// Item lifecycle: pending → processing → completed | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for SyncItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncItemStatus::Pending => "pending",
            SyncItemStatus::Processing => "processing",
            SyncItemStatus::Completed => "completed",
            SyncItemStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Versioned resource an item (or an inbound update) targets
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub resource_id: String,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
        }
    }

    pub fn schedule(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Schedule, id)
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Project, id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

/// Outbound operation awaiting acknowledgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: SyncItemType,
    pub payload: Value,
    /// Enqueue time, UTC milliseconds
    pub timestamp: i64,
    pub retry_count: u32,
    pub priority: SyncPriority,
    pub status: SyncItemStatus,
    pub action: UpdateAction,
    pub resource: ResourceKey,
    /// Earliest next attempt, UTC milliseconds (display only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Time the item reached a terminal status, UTC milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,

    /// Insertion order, assigned by the queue
    #[serde(skip)]
    pub(crate) sequence: u64,
    #[serde(skip)]
    pub(crate) retry_at: Option<Instant>,
    #[serde(skip)]
    pub(crate) finished_instant: Option<Instant>,
}

impl SyncQueueItem {
    fn new(item_type: SyncItemType, action: UpdateAction, resource: ResourceKey, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            item_type,
            payload,
            timestamp: now_millis(),
            retry_count: 0,
            priority: SyncPriority::from_action(action),
            status: SyncItemStatus::Pending,
            action,
            resource,
            next_retry_at: None,
            last_error: None,
            finished_at: None,
            sequence: 0,
            retry_at: None,
            finished_instant: None,
        }
    }

    pub fn calendar_update(
        schedule_id: impl Into<String>,
        project_id: impl Into<String>,
        action: UpdateAction,
        data: Value,
    ) -> Self {
        let update = CalendarUpdateEvent::new(schedule_id, project_id, action, data);
        let resource = ResourceKey::schedule(update.schedule_id.clone());
        Self::new(SyncItemType::CalendarUpdate, action, resource, update.payload())
    }

    pub fn project_update(project_id: impl Into<String>, action: UpdateAction, data: Value) -> Self {
        let update = ProjectUpdateEvent::new(project_id, action, data);
        let resource = ResourceKey::project(update.project_id.clone());
        Self::new(SyncItemType::ProjectUpdate, action, resource, update.payload())
    }

    /// The `data` field of the payload
    pub fn data(&self) -> &Value {
        self.payload.get("data").unwrap_or(&Value::Null)
    }

    /// Outbound frame; the item id rides in the payload so the server can ack it
    pub fn to_frame(&self, user_id: Option<&str>) -> RealtimeEvent {
        let mut payload = self.payload.clone();
        if let Value::Object(ref mut map) = payload {
            map.insert("id".to_string(), Value::String(self.id.clone()));
        }
        RealtimeEvent {
            event_type: self.item_type.event_type().to_string(),
            payload,
            timestamp: self.timestamp,
            user_id: user_id.map(str::to_string),
            version: None,
        }
    }

    /// Eligible for (re)transmission at `now`
    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.status == SyncItemStatus::Pending && self.retry_at.map_or(true, |at| at <= now)
    }
}
