//! Wire envelope and typed payloads
//!
//! Every frame exchanged with the realtime server, in both directions, is a
//! [`RealtimeEvent`] serialized as JSON with the field names `type`,
//! `payload`, `timestamp`, `userId` and `version`. Domain notifications and
//! control frames (subscribe, ack, ping...) differ only by `type` and payload
//! shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{CalsyncError, Result};
use crate::subscription::Topic;
use crate::utils::now_millis;

/// Event type names understood by this client
pub mod event_types {
    pub const CALENDAR_UPDATE: &str = "calendar:update";
    pub const PROJECT_UPDATE: &str = "project:update";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ACK: &str = "ack";
    pub const NACK: &str = "nack";
}

/// Realtime envelope as carried by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    /// UTC milliseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl RealtimeEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: now_millis(),
            user_id: None,
            version: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Control frames are consumed by the session and never reach subscribers
    pub fn is_control(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            event_types::ACK
                | event_types::NACK
                | event_types::PING
                | event_types::PONG
                | event_types::SUBSCRIBE
                | event_types::UNSUBSCRIBE
        )
    }

    pub fn subscribe(topic: &Topic) -> Self {
        Self::new(event_types::SUBSCRIBE, SubscriptionPayload::from_topic(topic).to_value())
    }

    pub fn unsubscribe(topic: &Topic) -> Self {
        Self::new(event_types::UNSUBSCRIBE, SubscriptionPayload::from_topic(topic).to_value())
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(event_types::PING, serde_json::json!({ "nonce": nonce }))
    }

    pub fn pong(nonce: u64) -> Self {
        Self::new(event_types::PONG, serde_json::json!({ "nonce": nonce }))
    }

    pub fn ack(item_id: &str) -> Self {
        Self::new(event_types::ACK, serde_json::json!({ "id": item_id }))
    }

    pub fn nack(item_id: &str, reason: &str, retryable: bool) -> Self {
        Self::new(
            event_types::NACK,
            serde_json::json!({ "id": item_id, "reason": reason, "retryable": retryable }),
        )
    }
}

/// Action carried by calendar / project updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateAction {
    Create,
    Update,
    Delete,
}

impl UpdateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateAction::Create => "create",
            UpdateAction::Update => "update",
            UpdateAction::Delete => "delete",
        }
    }
}

impl fmt::Display for UpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateAction {
    type Err = CalsyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(UpdateAction::Create),
            "update" => Ok(UpdateAction::Update),
            "delete" => Ok(UpdateAction::Delete),
            other => Err(CalsyncError::InvalidArgument(format!("unknown action: {}", other))),
        }
    }
}

/// Kind of versioned resource carried by domain events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Schedule,
    Project,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Schedule => "schedule",
            ResourceType::Project => "project",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarUpdatePayload {
    schedule_id: String,
    project_id: String,
    action: UpdateAction,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectUpdatePayload {
    project_id: String,
    action: UpdateAction,
    #[serde(default)]
    data: Value,
}

/// `calendar:update` view of a [`RealtimeEvent`]
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarUpdateEvent {
    pub schedule_id: String,
    pub project_id: String,
    pub action: UpdateAction,
    pub data: Value,
    pub timestamp: i64,
    pub user_id: Option<String>,
    pub version: Option<u64>,
}

impl CalendarUpdateEvent {
    pub fn new(schedule_id: impl Into<String>, project_id: impl Into<String>, action: UpdateAction, data: Value) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            project_id: project_id.into(),
            action,
            data,
            timestamp: now_millis(),
            user_id: None,
            version: None,
        }
    }

    pub fn from_event(event: &RealtimeEvent) -> Result<Self> {
        if event.event_type != event_types::CALENDAR_UPDATE {
            return Err(CalsyncError::InvalidData(format!(
                "expected {} event, got {}",
                event_types::CALENDAR_UPDATE,
                event.event_type
            )));
        }
        let payload: CalendarUpdatePayload = serde_json::from_value(event.payload.clone())
            .map_err(|e| CalsyncError::InvalidData(format!("calendar update payload: {}", e)))?;
        Ok(Self {
            schedule_id: payload.schedule_id,
            project_id: payload.project_id,
            action: payload.action,
            data: payload.data,
            timestamp: event.timestamp,
            user_id: event.user_id.clone(),
            version: event.version,
        })
    }

    /// Payload without the outbound item id
    pub fn payload(&self) -> Value {
        serde_json::json!({
            "scheduleId": self.schedule_id,
            "projectId": self.project_id,
            "action": self.action,
            "data": self.data,
        })
    }

    pub fn to_event(&self) -> RealtimeEvent {
        RealtimeEvent {
            event_type: event_types::CALENDAR_UPDATE.to_string(),
            payload: self.payload(),
            timestamp: self.timestamp,
            user_id: self.user_id.clone(),
            version: self.version,
        }
    }
}

/// `project:update` view of a [`RealtimeEvent`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectUpdateEvent {
    pub project_id: String,
    pub action: UpdateAction,
    pub data: Value,
    pub timestamp: i64,
    pub user_id: Option<String>,
    pub version: Option<u64>,
}

impl ProjectUpdateEvent {
    pub fn new(project_id: impl Into<String>, action: UpdateAction, data: Value) -> Self {
        Self {
            project_id: project_id.into(),
            action,
            data,
            timestamp: now_millis(),
            user_id: None,
            version: None,
        }
    }

    pub fn from_event(event: &RealtimeEvent) -> Result<Self> {
        if event.event_type != event_types::PROJECT_UPDATE {
            return Err(CalsyncError::InvalidData(format!(
                "expected {} event, got {}",
                event_types::PROJECT_UPDATE,
                event.event_type
            )));
        }
        let payload: ProjectUpdatePayload = serde_json::from_value(event.payload.clone())
            .map_err(|e| CalsyncError::InvalidData(format!("project update payload: {}", e)))?;
        Ok(Self {
            project_id: payload.project_id,
            action: payload.action,
            data: payload.data,
            timestamp: event.timestamp,
            user_id: event.user_id.clone(),
            version: event.version,
        })
    }

    pub fn payload(&self) -> Value {
        serde_json::json!({
            "projectId": self.project_id,
            "action": self.action,
            "data": self.data,
        })
    }

    pub fn to_event(&self) -> RealtimeEvent {
        RealtimeEvent {
            event_type: event_types::PROJECT_UPDATE.to_string(),
            payload: self.payload(),
            timestamp: self.timestamp,
            user_id: self.user_id.clone(),
            version: self.version,
        }
    }
}

/// Resource-level view shared by both domain update kinds; this is what the
/// conflict resolver and the version tracker consume.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUpdate {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub topic: Topic,
    pub action: UpdateAction,
    pub data: Value,
    pub version: Option<u64>,
    pub timestamp: i64,
    pub user_id: Option<String>,
}

impl ResourceUpdate {
    /// Returns `Ok(None)` for events that are not domain updates
    pub fn from_event(event: &RealtimeEvent) -> Result<Option<Self>> {
        match event.event_type.as_str() {
            event_types::CALENDAR_UPDATE => Ok(Some(CalendarUpdateEvent::from_event(event)?.into())),
            event_types::PROJECT_UPDATE => Ok(Some(ProjectUpdateEvent::from_event(event)?.into())),
            _ => Ok(None),
        }
    }
}

impl From<CalendarUpdateEvent> for ResourceUpdate {
    fn from(event: CalendarUpdateEvent) -> Self {
        Self {
            resource_type: ResourceType::Schedule,
            topic: Topic::Calendar(event.project_id),
            resource_id: event.schedule_id,
            action: event.action,
            data: event.data,
            version: event.version,
            timestamp: event.timestamp,
            user_id: event.user_id,
        }
    }
}

impl From<ProjectUpdateEvent> for ResourceUpdate {
    fn from(event: ProjectUpdateEvent) -> Self {
        Self {
            resource_type: ResourceType::Project,
            topic: Topic::Project(event.project_id.clone()),
            resource_id: event.project_id,
            action: event.action,
            data: event.data,
            version: event.version,
            timestamp: event.timestamp,
            user_id: event.user_id,
        }
    }
}

/// `subscribe` / `unsubscribe` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub topic: String,
    pub kind: String,
    pub id: String,
}

impl SubscriptionPayload {
    pub fn from_topic(topic: &Topic) -> Self {
        Self {
            topic: topic.to_string(),
            kind: topic.kind().to_string(),
            id: topic.id().to_string(),
        }
    }

    fn to_value(&self) -> Value {
        serde_json::json!({ "topic": self.topic, "kind": self.kind, "id": self.id })
    }
}

/// `ack` payload; `version` is the resource version the write produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// `nack` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NackPayload {
    pub id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub retryable: bool,
}

/// `ping` / `pong` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub nonce: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_field_names() {
        let event = RealtimeEvent::new(event_types::PROJECT_UPDATE, serde_json::json!({ "projectId": "p1" }))
            .with_user("u1")
            .with_version(4)
            .with_timestamp(1_700_000_000_000);
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "project:update");
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["version"], 4);
        assert_eq!(value["payload"]["projectId"], "p1");
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = RealtimeEvent::ping(7);
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert!(value.get("userId").is_none());
        assert!(value.get("version").is_none());

        let parsed = RealtimeEvent::from_json(r#"{"type":"pong","timestamp":5}"#).unwrap();
        assert_eq!(parsed.payload, Value::Null);
        assert_eq!(parsed.user_id, None);
        assert!(parsed.is_control());
    }

    #[test]
    fn test_calendar_update_view() {
        let raw = r#"{
            "type": "calendar:update",
            "payload": {"scheduleId": "s1", "projectId": "p1", "action": "delete", "data": {"title": "Standup"}},
            "timestamp": 1000,
            "userId": "alice",
            "version": 2
        }"#;
        let event = RealtimeEvent::from_json(raw).unwrap();
        let update = CalendarUpdateEvent::from_event(&event).unwrap();
        assert_eq!(update.schedule_id, "s1");
        assert_eq!(update.action, UpdateAction::Delete);
        assert_eq!(update.version, Some(2));

        let resource = ResourceUpdate::from_event(&event).unwrap().unwrap();
        assert_eq!(resource.resource_type, ResourceType::Schedule);
        assert_eq!(resource.resource_id, "s1");
        assert_eq!(resource.topic, Topic::Calendar("p1".into()));
    }

    #[test]
    fn test_project_update_rejects_bad_payload() {
        let event = RealtimeEvent::new(event_types::PROJECT_UPDATE, serde_json::json!({ "action": "rename" }));
        assert!(matches!(ProjectUpdateEvent::from_event(&event), Err(CalsyncError::InvalidData(_))));
        assert!(ResourceUpdate::from_event(&RealtimeEvent::ping(1)).unwrap().is_none());
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("update".parse::<UpdateAction>().unwrap(), UpdateAction::Update);
        assert!("archive".parse::<UpdateAction>().is_err());
    }
}
