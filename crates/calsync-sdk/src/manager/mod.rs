//! Realtime manager
//!
//! The public face of the crate. A [`RealtimeManager`] owns the connection
//! lifecycle, the outbound sync queue, the subscription registry, the
//! version cache and the conflict resolver, and reports everything through
//! [`EventManager`] listeners.
//!
//! ```rust,no_run
//! use calsync_sdk::{CalsyncConfig, RealtimeManager, UpdateAction};
//! use serde_json::json;
//!
//! # async fn run() -> calsync_sdk::Result<()> {
//! let config = CalsyncConfig::builder()
//!     .server_url("wss://realtime.example.com/ws")
//!     .auth_token("token")
//!     .user_id("alice")
//!     .build();
//!
//! let manager = RealtimeManager::with_websocket(config);
//! let _status = manager.on_connection_status_change(|old, new| {
//!     println!("{} -> {}", old, new);
//! });
//!
//! manager.initialize().await?;
//! manager.subscribe_to_calendar("p1");
//! manager
//!     .send_calendar_update("s1", "p1", UpdateAction::Update, json!({"title": "Standup"}))
//!     .await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod driver;

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::CalsyncConfig;
use crate::connection_state::{ConnectionMetrics, ConnectionState, ConnectionStateManager, ConnectionStatus};
use crate::error::{CalsyncError, Result};
use crate::events::{Disposer, EventFilter, EventManager, EventStats, FilteredEventReceiver, SDKEvent};
use crate::protocol::{CalendarUpdateEvent, ProjectUpdateEvent, ResourceType, UpdateAction};
use crate::queue::{QueueStats, ResourceKey, SyncQueue, SyncQueueItem};
use crate::reconnect::ReconnectStats;
use crate::subscription::{SubscriptionRegistry, Topic};
use crate::sync::{
    ConflictDetectedEvent, ConflictResolution, ConflictResolver, ConflictStrategy, LocalResource, VersionTracker,
};
use crate::transport::{Transport, WebSocketTransport};
use crate::utils::now_millis;

use driver::{Command, Driver, DriverHandle};

type Waiter = oneshot::Sender<Result<SyncQueueItem>>;

/// State shared between the public handle and the driver task
pub(crate) struct Shared {
    pub(crate) config: CalsyncConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) state: ConnectionStateManager,
    pub(crate) events: EventManager,
    pub(crate) queue: Mutex<SyncQueue>,
    pub(crate) subscriptions: Mutex<SubscriptionRegistry>,
    pub(crate) versions: VersionTracker,
    pub(crate) resolver: ConflictResolver,
    /// item id -> caller awaiting the final outcome
    waiters: Mutex<HashMap<String, Waiter>>,
    pub(crate) manual_conflicts: Mutex<HashMap<ResourceKey, ConflictDetectedEvent>>,
    /// Published by the driver after every step
    pub(crate) reconnect_stats: Mutex<ReconnectStats>,
    driver: Mutex<Option<DriverHandle>>,
}

impl Shared {
    pub(crate) fn transition(&self, status: ConnectionStatus) {
        if let Some(old) = self.state.set_status(status) {
            info!("connection status: {} -> {}", old, status);
            self.events.emit(SDKEvent::status_changed(old, status));
        }
    }

    pub(crate) fn report_error(&self, error: CalsyncError) {
        self.events.emit(SDKEvent::error(error));
    }

    pub(crate) fn emit_queue_snapshot(&self) {
        let items = self.queue.lock().snapshot();
        self.events.emit(SDKEvent::queue_updated(items));
    }

    pub(crate) fn resolve_waiter(&self, item_id: &str, outcome: Result<SyncQueueItem>) {
        if let Some(waiter) = self.waiters.lock().remove(item_id) {
            let _ = waiter.send(outcome);
        }
    }

    fn nudge(&self, command: Command) {
        if let Some(ref handle) = *self.driver.lock() {
            let _ = handle.commands.send(command);
        }
    }
}

/// Client-side realtime sync manager
///
/// Cheap to clone; every clone drives the same session. The session stops
/// when [`shutdown`](Self::shutdown) is called or the last clone is dropped.
#[derive(Clone)]
pub struct RealtimeManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RealtimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeManager")
            .field("server_url", &self.shared.config.server_url)
            .field("status", &self.shared.state.status())
            .finish()
    }
}

impl RealtimeManager {
    pub fn new(config: CalsyncConfig, transport: Arc<dyn Transport>) -> Self {
        let state = ConnectionStateManager::new(config.server_url.clone(), config.user_id.clone());
        let events = EventManager::new(config.event_config.buffer_size);
        let queue = SyncQueue::new(config.queue_config.capacity, config.completed_retention());
        let resolver = config.conflict_config.resolver();

        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                state,
                events,
                queue: Mutex::new(queue),
                subscriptions: Mutex::new(SubscriptionRegistry::new()),
                versions: VersionTracker::new(),
                resolver,
                waiters: Mutex::new(HashMap::new()),
                manual_conflicts: Mutex::new(HashMap::new()),
                reconnect_stats: Mutex::new(ReconnectStats::default()),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Manager over the bundled WebSocket transport
    pub fn with_websocket(config: CalsyncConfig) -> Self {
        Self::new(config, Arc::new(WebSocketTransport::new()))
    }

    pub fn config(&self) -> &CalsyncConfig {
        &self.shared.config
    }

    // ========== Lifecycle ==========

    /// Connect to the server.
    ///
    /// A no-op while connected or connecting. Configuration problems are
    /// returned (and reported through `on_error`) without touching the
    /// network; transport failures are reported and handed to the reconnect
    /// policy, so they do not fail this call.
    pub async fn initialize(&self) -> Result<()> {
        self.connect(false).await
    }

    /// Manual reconnect after automatic reconnect gave up, or after a
    /// shutdown. Starts again with a fresh backoff budget.
    pub async fn reconnect(&self) -> Result<()> {
        self.connect(true).await
    }

    async fn connect(&self, manual: bool) -> Result<()> {
        if let Err(e) = self.shared.config.validate() {
            error!("refusing to connect: {}", e);
            self.shared.report_error(e.clone());
            return Err(e);
        }

        let (commands, old_status) = {
            let mut driver = self.shared.driver.lock();
            let status = self.shared.state.status();
            let busy = if manual {
                matches!(status, ConnectionStatus::Connected | ConnectionStatus::Connecting)
            } else {
                status.is_active()
            };
            if busy {
                debug!("connect skipped, already {}", status);
                return Ok(());
            }

            let old_status = self.shared.state.set_status(ConnectionStatus::Connecting);
            let running = driver.as_ref().map(|h| !h.task.is_finished()).unwrap_or(false);
            if !running {
                *driver = Some(Driver::spawn(&self.shared));
            }
            let commands = driver.as_ref().map(|h| h.commands.clone());
            (commands, old_status)
        };

        if let Some(old) = old_status {
            info!("connection status: {} -> {}", old, ConnectionStatus::Connecting);
            self.shared.events.emit(SDKEvent::status_changed(old, ConnectionStatus::Connecting));
        }

        let (done_tx, done_rx) = oneshot::channel();
        let sent = commands
            .map(|tx| tx.send(Command::Connect { done: done_tx }).is_ok())
            .unwrap_or(false);
        if !sent || done_rx.await.is_err() {
            return Err(CalsyncError::ShuttingDown("session driver stopped".to_string()));
        }
        Ok(())
    }

    /// Close the connection and stop all timers. Unfinished sends resolve
    /// with [`CalsyncError::ShuttingDown`]. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let handle = self.shared.driver.lock().take();
        if let Some(handle) = handle {
            info!("shutting down realtime session");
            handle.task.abort();
            let _ = handle.task.await;
        }
        self.shared.transport.close().await;

        let abandoned = self.shared.queue.lock().drain_active();
        if !abandoned.is_empty() {
            warn!("{} unsent item(s) dropped on shutdown", abandoned.len());
        }
        let waiters: Vec<Waiter> = self.shared.waiters.lock().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(CalsyncError::ShuttingDown("manager shut down".to_string())));
        }

        self.shared.transition(ConnectionStatus::Disconnected);
    }

    // ========== Outbound ==========

    /// Queue a schedule change; resolves once the server acknowledged it
    pub async fn send_calendar_update(
        &self,
        schedule_id: impl Into<String>,
        project_id: impl Into<String>,
        action: UpdateAction,
        data: Value,
    ) -> Result<SyncQueueItem> {
        self.submit(SyncQueueItem::calendar_update(schedule_id, project_id, action, data))
            .await
    }

    /// Queue a project change; resolves once the server acknowledged it
    pub async fn send_project_update(
        &self,
        project_id: impl Into<String>,
        action: UpdateAction,
        data: Value,
    ) -> Result<SyncQueueItem> {
        self.submit(SyncQueueItem::project_update(project_id, action, data)).await
    }

    async fn submit(&self, item: SyncQueueItem) -> Result<SyncQueueItem> {
        let (tx, rx) = oneshot::channel();
        let item = {
            let mut queue = self.shared.queue.lock();
            let item = queue.enqueue(item)?;
            self.shared.waiters.lock().insert(item.id.clone(), tx);
            item
        };
        debug!("queued {} {} ({})", item.item_type.event_type(), item.id, item.priority);

        self.shared.emit_queue_snapshot();
        self.shared.nudge(Command::Flush);

        rx.await
            .unwrap_or_else(|_| Err(CalsyncError::ShuttingDown("manager shut down".to_string())))
    }

    /// Put a permanently failed item back in the queue with a fresh retry budget
    pub fn retry_failed(&self, item_id: &str) -> Result<SyncQueueItem> {
        let item = self.shared.queue.lock().retry_failed(item_id)?;
        info!("re-queued failed item {}", item_id);
        self.shared.emit_queue_snapshot();
        self.shared.nudge(Command::Flush);
        Ok(item)
    }

    // ========== Subscriptions ==========

    pub fn subscribe_to_project(&self, project_id: impl Into<String>) -> bool {
        self.add_topic(Topic::Project(project_id.into()))
    }

    pub fn subscribe_to_calendar(&self, project_id: impl Into<String>) -> bool {
        self.add_topic(Topic::Calendar(project_id.into()))
    }

    pub fn unsubscribe_from_project(&self, project_id: impl Into<String>) -> bool {
        self.remove_topic(Topic::Project(project_id.into()))
    }

    pub fn unsubscribe_from_calendar(&self, project_id: impl Into<String>) -> bool {
        self.remove_topic(Topic::Calendar(project_id.into()))
    }

    fn add_topic(&self, topic: Topic) -> bool {
        let added = self.shared.subscriptions.lock().subscribe(topic.clone());
        if added {
            self.shared.nudge(Command::Subscribe(topic));
        }
        added
    }

    fn remove_topic(&self, topic: Topic) -> bool {
        let removed = self.shared.subscriptions.lock().unsubscribe(&topic);
        if removed {
            self.shared.nudge(Command::Unsubscribe(topic));
        }
        removed
    }

    pub fn subscribed_topics(&self) -> Vec<Topic> {
        self.shared.subscriptions.lock().topics()
    }

    // ========== Listeners ==========

    pub fn on_connection_status_change<F>(&self, callback: F) -> Disposer
    where
        F: Fn(ConnectionStatus, ConnectionStatus) + Send + Sync + 'static,
    {
        self.shared.events.add_listener("connection_status_changed", move |event| {
            if let SDKEvent::ConnectionStatusChanged { old_status, new_status, .. } = event {
                callback(*old_status, *new_status);
            }
        })
    }

    pub fn on_error<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&CalsyncError) + Send + Sync + 'static,
    {
        self.shared.events.add_listener("error", move |event| {
            if let SDKEvent::Error { error, .. } = event {
                callback(error);
            }
        })
    }

    pub fn on_sync_queue_update<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&[SyncQueueItem]) + Send + Sync + 'static,
    {
        self.shared.events.add_listener("sync_queue_updated", move |event| {
            if let SDKEvent::SyncQueueUpdated { items, .. } = event {
                callback(items);
            }
        })
    }

    pub fn on_conflict<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&ConflictDetectedEvent) + Send + Sync + 'static,
    {
        self.shared.events.add_listener("conflict_detected", move |event| {
            if let SDKEvent::ConflictDetected(conflict) = event {
                callback(conflict);
            }
        })
    }

    pub fn on_calendar_update<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&CalendarUpdateEvent) + Send + Sync + 'static,
    {
        self.shared.events.add_listener("calendar_updated", move |event| {
            if let SDKEvent::CalendarUpdated(update) = event {
                callback(update);
            }
        })
    }

    pub fn on_project_update<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&ProjectUpdateEvent) + Send + Sync + 'static,
    {
        self.shared.events.add_listener("project_updated", move |event| {
            if let SDKEvent::ProjectUpdated(update) = event {
                callback(update);
            }
        })
    }

    /// Every event, as a broadcast stream
    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.shared.events.subscribe_filtered(filter)
    }

    pub fn event_stats(&self) -> EventStats {
        self.shared.events.get_stats()
    }

    // ========== Getters ==========

    pub fn get_connection_metrics(&self) -> ConnectionMetrics {
        self.shared.state.metrics()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.state.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.get_state()
    }

    pub fn reconnect_stats(&self) -> ReconnectStats {
        self.shared.reconnect_stats.lock().clone()
    }

    pub fn sync_queue_snapshot(&self) -> Vec<SyncQueueItem> {
        self.shared.queue.lock().snapshot()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.queue.lock().stats()
    }

    /// Last-known state of a resource
    pub fn resource(&self, resource_type: ResourceType, resource_id: &str) -> Option<LocalResource> {
        self.shared.versions.get(&ResourceKey::new(resource_type, resource_id))
    }

    /// Every cached resource
    pub fn resources(&self) -> Vec<LocalResource> {
        self.shared.versions.all()
    }

    /// Conflicts waiting for [`resolve_manually`](Self::resolve_manually)
    pub fn pending_conflicts(&self) -> Vec<ConflictDetectedEvent> {
        self.shared.manual_conflicts.lock().values().cloned().collect()
    }

    // ========== Local state ==========

    /// Record a version obtained out of band (e.g. an initial REST fetch).
    /// Returns `false` when a newer version is already known.
    pub fn seed_resource(
        &self,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        version: u64,
        data: Value,
    ) -> bool {
        self.shared.versions.store(LocalResource {
            resource_type,
            resource_id: resource_id.into(),
            version,
            data,
            updated_at: now_millis(),
            updated_by: None,
            deleted: false,
        })
    }

    /// Apply the UI's decision for a conflict left by the manual strategy.
    /// The chosen data is stored at the server's version.
    pub fn resolve_manually(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        data: Value,
    ) -> Result<LocalResource> {
        let key = ResourceKey::new(resource_type, resource_id);
        let Some(mut conflict) = self.shared.manual_conflicts.lock().remove(&key) else {
            return Err(CalsyncError::NotFound(format!("no pending conflict for {}", key)));
        };

        let now = now_millis();
        let resolved = LocalResource {
            resource_type,
            resource_id: resource_id.to_string(),
            version: conflict.server_version,
            data: data.clone(),
            updated_at: now,
            updated_by: self.shared.config.user_id.clone(),
            deleted: false,
        };
        if !self.shared.versions.store(resolved.clone()) {
            let current = self.shared.versions.local_version(&key).unwrap_or_default();
            warn!("manual resolution for {} is outdated: v{} already applied", key, current);
            let server_version = conflict.server_version;
            self.shared.manual_conflicts.lock().insert(key.clone(), conflict);
            return Err(CalsyncError::InvalidData(format!(
                "{} is already at version {}, newer than the conflicting version {}",
                key, current, server_version
            )));
        }

        conflict.resolution = Some(ConflictResolution {
            strategy: ConflictStrategy::Manual,
            version: conflict.server_version,
            timestamp: now,
            user_id: self.shared.config.user_id.clone(),
            merged_data: Some(data),
        });
        info!("conflict on {} resolved manually at v{}", key, conflict.server_version);
        self.shared.events.emit(SDKEvent::ConflictDetected(conflict));
        Ok(resolved)
    }
}
