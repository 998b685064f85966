//! Connection state tracking
//!
//! Holds the realtime connection status plus the metrics derived from it:
//! - latency from the last ping/pong round trip
//! - packets lost (pings that were never answered)
//! - reconnection count and accumulated uptime
//!
//! All reads return copies; only the manager's driver mutates the state.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

use crate::utils::now_millis;

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        }
    }

    /// An open attempt is underway or the link is up
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection metrics, exposed as a copy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    /// Last ping/pong round trip (milliseconds)
    pub latency: Option<u64>,
    pub packets_lost: u64,
    /// Successful re-establishments after a drop
    pub reconnection_count: u64,
    /// Time spent connected across all sessions (milliseconds)
    pub total_uptime: u64,
    /// Last answered heartbeat, UTC milliseconds
    pub last_heartbeat: Option<i64>,
}

/// Full connection state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub server_url: String,
    pub user_id: Option<String>,
    pub metrics: ConnectionMetrics,
    /// Current session start, UTC milliseconds
    pub connected_at: Option<i64>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub sdk_version: String,
}

impl ConnectionState {
    pub fn new(server_url: String, user_id: Option<String>) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            server_url,
            user_id,
            metrics: ConnectionMetrics::default(),
            connected_at: None,
            messages_sent: 0,
            messages_received: 0,
            sdk_version: crate::version::SDK_VERSION.to_string(),
        }
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "status={} server={} user={} latency={:?}ms lost={} reconnects={} uptime={}ms sent={} received={}",
            self.status,
            self.server_url,
            self.user_id.as_deref().unwrap_or("-"),
            self.metrics.latency,
            self.metrics.packets_lost,
            self.metrics.reconnection_count,
            self.metrics.total_uptime,
            self.messages_sent,
            self.messages_received
        )
    }
}

/// Heartbeat tick result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeartbeatTick {
    /// Nonce for the ping to send now
    pub nonce: u64,
    /// Consecutive unanswered pings, including the one just given up on
    pub missed: u32,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    /// Accumulated uptime of finished sessions
    closed_uptime_ms: u64,
    connected_since: Option<Instant>,
    has_connected: bool,
    pending_ping: Option<(u64, Instant)>,
    next_nonce: u64,
    missed: u32,
}

impl Inner {
    fn uptime_ms(&self, now: Instant) -> u64 {
        let live = self
            .connected_since
            .map(|since| now.saturating_duration_since(since).as_millis() as u64)
            .unwrap_or(0);
        self.closed_uptime_ms + live
    }
}

/// Thread-safe connection state handle
#[derive(Debug, Clone)]
pub struct ConnectionStateManager {
    inner: Arc<RwLock<Inner>>,
}

impl ConnectionStateManager {
    pub fn new(server_url: String, user_id: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                state: ConnectionState::new(server_url, user_id),
                closed_uptime_ms: 0,
                connected_since: None,
                has_connected: false,
                pending_ping: None,
                next_nonce: 0,
                missed: 0,
            })),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.read().state.status
    }

    /// Returns the previous status when it actually changed
    pub fn set_status(&self, status: ConnectionStatus) -> Option<ConnectionStatus> {
        let mut inner = self.inner.write();
        let old = inner.state.status;
        if old == status {
            return None;
        }
        let now = Instant::now();

        if old == ConnectionStatus::Connected {
            inner.closed_uptime_ms = inner.uptime_ms(now);
            inner.connected_since = None;
            inner.state.connected_at = None;
            inner.pending_ping = None;
            inner.missed = 0;
        }
        if status == ConnectionStatus::Connected {
            if inner.has_connected {
                inner.state.metrics.reconnection_count += 1;
            }
            inner.has_connected = true;
            inner.connected_since = Some(now);
            inner.state.connected_at = Some(now_millis());
        }

        inner.state.status = status;
        Some(old)
    }

    /// Copy of the metrics with uptime computed up to now
    pub fn metrics(&self) -> ConnectionMetrics {
        let inner = self.inner.read();
        let mut metrics = inner.state.metrics.clone();
        metrics.total_uptime = inner.uptime_ms(Instant::now());
        metrics
    }

    pub fn get_state(&self) -> ConnectionState {
        let inner = self.inner.read();
        let mut state = inner.state.clone();
        state.metrics.total_uptime = inner.uptime_ms(Instant::now());
        state
    }

    pub fn increment_sent(&self) {
        self.inner.write().state.messages_sent += 1;
    }

    pub fn increment_received(&self) {
        self.inner.write().state.messages_received += 1;
    }

    /// Starts a new ping. An outstanding unanswered ping counts as lost.
    pub(crate) fn heartbeat_tick(&self) -> HeartbeatTick {
        let mut inner = self.inner.write();
        if inner.pending_ping.take().is_some() {
            inner.state.metrics.packets_lost += 1;
            inner.missed += 1;
        }
        inner.next_nonce += 1;
        let nonce = inner.next_nonce;
        inner.pending_ping = Some((nonce, Instant::now()));
        HeartbeatTick {
            nonce,
            missed: inner.missed,
        }
    }

    /// Records a pong; returns the round trip when the nonce matches the
    /// outstanding ping
    pub(crate) fn record_pong(&self, nonce: u64) -> Option<u64> {
        let mut inner = self.inner.write();
        match inner.pending_ping {
            Some((expected, sent_at)) if expected == nonce => {
                let latency = Instant::now().saturating_duration_since(sent_at).as_millis() as u64;
                inner.pending_ping = None;
                inner.missed = 0;
                inner.state.metrics.latency = Some(latency);
                inner.state.metrics.last_heartbeat = Some(now_millis());
                Some(latency)
            }
            _ => None,
        }
    }
}
