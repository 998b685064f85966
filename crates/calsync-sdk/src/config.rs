//! SDK configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::error::{CalsyncError, Result};
use crate::protocol::ResourceType;
use crate::queue::RetryPolicy;
use crate::reconnect::ReconnectConfig;
use crate::sync::{ConflictResolver, ConflictStrategy};

/// Calsync SDK configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalsyncConfig {
    /// Realtime endpoint, `ws://` or `wss://`
    pub server_url: String,
    /// Sent as a Bearer token on the upgrade request
    pub auth_token: Option<String>,
    /// Acting user, stamped on outbound frames
    pub user_id: Option<String>,
    /// Single open attempt timeout (milliseconds)
    pub connection_timeout_ms: u64,
    pub heartbeat_config: HeartbeatConfig,
    pub reconnect_config: ReconnectConfig,
    pub retry_config: RetryPolicy,
    pub queue_config: QueueConfig,
    pub event_config: EventConfig,
    pub conflict_config: ConflictConfig,
    pub debug_mode: bool,
}

/// Heartbeat configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// Consecutive unanswered pings before the connection counts as lost
    pub max_missed: u32,
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum pending + processing items
    pub capacity: usize,
    /// Time to wait for an ack (milliseconds)
    pub ack_timeout_ms: u64,
    /// How long completed / failed items stay visible (milliseconds)
    pub completed_retention_ms: u64,
    /// Items awaiting an ack at the same time
    pub max_in_flight: usize,
}

/// Event configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    /// Broadcast channel buffer size
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictConfig {
    pub default_strategy: ConflictStrategy,
    /// Overrides per resource type
    #[serde(default)]
    pub per_resource: HashMap<ResourceType, ConflictStrategy>,
}

impl ConflictConfig {
    pub fn resolver(&self) -> ConflictResolver {
        self.per_resource
            .iter()
            .fold(ConflictResolver::new(self.default_strategy), |resolver, (ty, strategy)| {
                resolver.with_strategy(*ty, *strategy)
            })
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            max_missed: 2,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            ack_timeout_ms: 10_000,
            completed_retention_ms: 5_000,
            max_in_flight: 16,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 1_000 }
    }
}

impl Default for CalsyncConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            auth_token: None,
            user_id: None,
            connection_timeout_ms: 15_000,
            heartbeat_config: HeartbeatConfig::default(),
            reconnect_config: ReconnectConfig::default(),
            retry_config: RetryPolicy::default(),
            queue_config: QueueConfig::default(),
            event_config: EventConfig::default(),
            conflict_config: ConflictConfig::default(),
            debug_mode: false,
        }
    }
}

impl CalsyncConfig {
    pub fn builder() -> CalsyncConfigBuilder {
        CalsyncConfigBuilder::new()
    }

    /// Missing or malformed settings are fatal and never retried
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(CalsyncError::Config("server url is required".to_string()));
        }
        let url = Url::parse(&self.server_url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(CalsyncError::Config(format!(
                "server url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(CalsyncError::Config("server url has no host".to_string()));
        }

        if let Some(ref token) = self.auth_token {
            if token.trim().is_empty() {
                return Err(CalsyncError::Config("auth token is empty".to_string()));
            }
        }
        if let Some(ref user_id) = self.user_id {
            if user_id.trim().is_empty() {
                return Err(CalsyncError::Config("user id is empty".to_string()));
            }
        }

        if self.connection_timeout_ms == 0 {
            return Err(CalsyncError::Config("connection timeout must be positive".to_string()));
        }
        if self.heartbeat_config.interval_ms == 0 || self.heartbeat_config.max_missed == 0 {
            return Err(CalsyncError::Config("heartbeat interval and max missed must be positive".to_string()));
        }
        if self.queue_config.capacity == 0 || self.queue_config.max_in_flight == 0 {
            return Err(CalsyncError::Config("queue capacity and max in flight must be positive".to_string()));
        }
        if self.queue_config.ack_timeout_ms == 0 {
            return Err(CalsyncError::Config("ack timeout must be positive".to_string()));
        }
        if self.reconnect_config.backoff_multiplier < 1.0 || self.retry_config.backoff_factor < 1.0 {
            return Err(CalsyncError::Config("backoff multipliers must be >= 1.0".to_string()));
        }
        let jitters = [self.reconnect_config.jitter_factor, self.retry_config.jitter_factor];
        if jitters.iter().any(|j| !(0.0..=1.0).contains(j)) {
            return Err(CalsyncError::Config("jitter factors must be within 0.0..=1.0".to_string()));
        }

        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_config.interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_config.ack_timeout_ms)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.queue_config.completed_retention_ms)
    }
}

/// Calsync SDK configuration builder
#[derive(Debug, Default)]
pub struct CalsyncConfigBuilder {
    config: CalsyncConfig,
}

impl CalsyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.server_url = url.into();
        self
    }

    pub fn auth_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.config.user_id = Some(user_id.into());
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn heartbeat(mut self, interval: Duration, max_missed: u32) -> Self {
        self.config.heartbeat_config = HeartbeatConfig {
            interval_ms: interval.as_millis() as u64,
            max_missed,
        };
        self
    }

    pub fn reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect_config = config;
        self
    }

    pub fn retry_config(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_config = policy;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.config.queue_config = config;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_config.buffer_size = size;
        self
    }

    pub fn conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.config.conflict_config.default_strategy = strategy;
        self
    }

    pub fn conflict_strategy_for(mut self, resource_type: ResourceType, strategy: ConflictStrategy) -> Self {
        self.config.conflict_config.per_resource.insert(resource_type, strategy);
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> CalsyncConfig {
        self.config
    }
}
