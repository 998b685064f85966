//! Event system
//!
//! Everything observers can see goes through [`EventManager`]:
//! - connection status transitions
//! - surfaced errors
//! - sync queue snapshots
//! - inbound calendar / project updates
//! - detected conflicts
//!
//! Two delivery paths exist side by side: a `broadcast` channel for async
//! consumers and ordered listener lists for callbacks. Listeners are invoked
//! in registration order, outside the registry lock, so a callback may
//! register or dispose listeners without deadlocking.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::debug;

use crate::connection_state::ConnectionStatus;
use crate::error::CalsyncError;
use crate::protocol::{CalendarUpdateEvent, ProjectUpdateEvent};
use crate::queue::SyncQueueItem;
use crate::subscription::Topic;
use crate::sync::ConflictDetectedEvent;
use crate::utils::now_millis;

/// Listener key matching every event
pub const ALL_EVENTS: &str = "*";

/// SDK event
#[derive(Debug, Clone)]
pub enum SDKEvent {
    ConnectionStatusChanged {
        old_status: ConnectionStatus,
        new_status: ConnectionStatus,
        timestamp: i64,
    },
    Error {
        error: CalsyncError,
        timestamp: i64,
    },
    /// Full queue snapshot after any change
    SyncQueueUpdated {
        items: Vec<SyncQueueItem>,
        timestamp: i64,
    },
    CalendarUpdated(CalendarUpdateEvent),
    ProjectUpdated(ProjectUpdateEvent),
    ConflictDetected(ConflictDetectedEvent),
}

impl SDKEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::ConnectionStatusChanged { .. } => "connection_status_changed",
            SDKEvent::Error { .. } => "error",
            SDKEvent::SyncQueueUpdated { .. } => "sync_queue_updated",
            SDKEvent::CalendarUpdated(_) => "calendar_updated",
            SDKEvent::ProjectUpdated(_) => "project_updated",
            SDKEvent::ConflictDetected(_) => "conflict_detected",
        }
    }

    /// Subscription topic of domain events
    pub fn topic(&self) -> Option<Topic> {
        match self {
            SDKEvent::CalendarUpdated(e) => Some(Topic::Calendar(e.project_id.clone())),
            SDKEvent::ProjectUpdated(e) => Some(Topic::Project(e.project_id.clone())),
            _ => None,
        }
    }

    /// Resource id of domain and conflict events
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            SDKEvent::CalendarUpdated(e) => Some(&e.schedule_id),
            SDKEvent::ProjectUpdated(e) => Some(&e.project_id),
            SDKEvent::ConflictDetected(e) => Some(&e.resource_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SDKEvent::ConnectionStatusChanged { timestamp, .. }
            | SDKEvent::Error { timestamp, .. }
            | SDKEvent::SyncQueueUpdated { timestamp, .. } => *timestamp,
            SDKEvent::CalendarUpdated(e) => e.timestamp,
            SDKEvent::ProjectUpdated(e) => e.timestamp,
            SDKEvent::ConflictDetected(e) => e.detected_at,
        }
    }

    pub fn status_changed(old_status: ConnectionStatus, new_status: ConnectionStatus) -> Self {
        SDKEvent::ConnectionStatusChanged {
            old_status,
            new_status,
            timestamp: now_millis(),
        }
    }

    pub fn error(error: CalsyncError) -> Self {
        SDKEvent::Error {
            error,
            timestamp: now_millis(),
        }
    }

    pub fn queue_updated(items: Vec<SyncQueueItem>) -> Self {
        SDKEvent::SyncQueueUpdated {
            items,
            timestamp: now_millis(),
        }
    }
}

/// Event filter
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub topics: Option<Vec<Topic>>,
    pub resource_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_topics(mut self, topics: Vec<Topic>) -> Self {
        self.topics = Some(topics);
        self
    }

    pub fn with_resource_ids(mut self, resource_ids: Vec<String>) -> Self {
        self.resource_ids = Some(resource_ids);
        self
    }

    pub fn matches(&self, event: &SDKEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref topics) = self.topics {
            match event.topic() {
                Some(topic) if topics.contains(&topic) => {}
                _ => return false,
            }
        }

        if let Some(ref ids) = self.resource_ids {
            match event.resource_id() {
                Some(id) if ids.iter().any(|i| i == id) => {}
                _ => return false,
            }
        }

        true
    }
}

/// Event listener
pub type EventListener = Arc<dyn Fn(&SDKEvent) + Send + Sync>;

type ListenerMap = HashMap<String, Vec<(u64, EventListener)>>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    by_type: ListenerMap,
}

/// Handle returned by listener registration
#[must_use = "keep the disposer and call dispose() to remove the listener"]
pub struct Disposer {
    registry: Weak<RwLock<ListenerRegistry>>,
    event_type: String,
    id: u64,
}

impl Disposer {
    /// Unregisters the listener. Returns `false` if it was already gone.
    pub fn dispose(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = registry.write();
        let Some(list) = registry.by_type.get_mut(&self.event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        before != list.len()
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .finish()
    }
}

/// Event statistics
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// Event manager
pub struct EventManager {
    sender: broadcast::Sender<SDKEvent>,
    listeners: Arc<RwLock<ListenerRegistry>>,
    stats: RwLock<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(RwLock::new(ListenerRegistry::default())),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// Publish an event to the broadcast channel, then to listeners
    pub fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // no receivers is a normal situation
        if self.sender.send(event.clone()).is_err() {
            debug!("No broadcast receivers for {}", event.event_type());
        }

        let to_call: Vec<EventListener> = {
            let registry = self.listeners.read();
            [event.event_type(), ALL_EVENTS]
                .iter()
                .filter_map(|key| registry.by_type.get(*key))
                .flat_map(|list| list.iter().map(|(_, l)| l.clone()))
                .collect()
        };
        for listener in to_call {
            listener(&event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// Register a listener for one event type, or [`ALL_EVENTS`]
    pub fn add_listener<F>(&self, event_type: &str, listener: F) -> Disposer
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.listeners.write();
            registry.next_id += 1;
            let id = registry.next_id;
            registry
                .by_type
                .entry(event_type.to_string())
                .or_default()
                .push((id, Arc::new(listener)));
            id
        };
        debug!("Added listener #{} for event type: {}", id, event_type);

        Disposer {
            registry: Arc::downgrade(&self.listeners),
            event_type: event_type.to_string(),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().by_type.values().map(Vec::len).sum()
    }

    pub fn get_stats(&self) -> EventStats {
        let mut stats = self.stats.read().clone();
        stats.listener_count = self.listener_count();
        stats
    }

    /// Active broadcast receivers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Broadcast receiver that skips events not matching its filter
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SDKEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SDKEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    pub async fn recv(&mut self) -> Result<SDKEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<SDKEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
