//! Calsync SDK - realtime sync core for calendar and project clients
//!
//! The SDK keeps a client in step with the realtime server:
//! - 🔗 one managed connection with heartbeat and automatic reconnect
//! - 📤 an outbound sync queue with priorities, acks and retry backoff
//! - 📡 topic subscriptions that survive reconnects
//! - 🧠 version tracking and conflict resolution for inbound updates
//! - ⚙️ listeners and broadcast streams for every event
//!
//! # Quick start
//!
//! ```rust,no_run
//! use calsync_sdk::{CalsyncConfig, RealtimeManager, UpdateAction};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CalsyncConfig::builder()
//!         .server_url("wss://realtime.example.com/ws")
//!         .auth_token("token")
//!         .user_id("user123")
//!         .build();
//!     calsync_sdk::init_tracing(config.debug_mode);
//!
//!     let manager = RealtimeManager::with_websocket(config);
//!     let _updates = manager.on_calendar_update(|update| {
//!         println!("schedule {} {}", update.schedule_id, update.action);
//!     });
//!
//!     manager.initialize().await?;
//!     manager.subscribe_to_calendar("project-1");
//!
//!     manager
//!         .send_calendar_update("schedule-1", "project-1", UpdateAction::Update, json!({"title": "Review"}))
//!         .await?;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection_state;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod reconnect;
pub mod subscription;
pub mod sync;
pub mod transport;
pub mod utils;
pub mod version;

pub use config::{CalsyncConfig, CalsyncConfigBuilder, ConflictConfig, EventConfig, HeartbeatConfig, QueueConfig};
pub use connection_state::{ConnectionMetrics, ConnectionState, ConnectionStateManager, ConnectionStatus};
pub use error::{CalsyncError, Result};
pub use events::{Disposer, EventFilter, EventManager, EventStats, FilteredEventReceiver, SDKEvent};
pub use logging::init_tracing;
pub use manager::RealtimeManager;
pub use protocol::{CalendarUpdateEvent, ProjectUpdateEvent, RealtimeEvent, ResourceType, UpdateAction};
pub use queue::{QueueStats, RetryPolicy, SyncItemStatus, SyncItemType, SyncPriority, SyncQueueItem};
pub use reconnect::{ReconnectConfig, ReconnectState, ReconnectStats};
pub use subscription::Topic;
pub use sync::{
    ConflictDetectedEvent, ConflictResolution, ConflictResolver, ConflictStrategy, ConflictType, LocalResource,
};
pub use transport::{Transport, TransportEvent, WebSocketTransport};
pub use version::SDK_VERSION;
