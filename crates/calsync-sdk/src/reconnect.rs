//! Reconnect state machine
//!
//! `Idle → Connecting → Connected → BackoffWait → Connecting … → Failed`
//!
//! The driver asks this controller what to do after every failed open or
//! dropped connection. Delays grow exponentially (1s → 2s → 4s → 8s → 15s cap)
//! with jitter; after `max_attempts` consecutive failed reconnects the
//! controller settles in `Failed` and only an explicit reset brings it back.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::queue::retry_policy::backoff_delay;

/// Reconnect configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Automatic reconnect attempts before giving up
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Random jitter factor (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 15_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_delay_ms,
            self.backoff_multiplier,
            self.max_delay_ms,
            self.jitter_factor,
            attempt,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectState {
    #[default]
    Idle,
    Connecting,
    Connected,
    BackoffWait { attempt: u32 },
    Failed,
}

/// What the driver should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Open again once `delay` elapsed; `attempt` is 1-based
    RetryAfter { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Snapshot of the reconnect state machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectStats {
    pub state: ReconnectState,
    pub consecutive_failures: u32,
    pub total_attempts: u64,
    pub last_success_elapsed_ms: Option<u64>,
}

#[derive(Debug)]
pub struct ReconnectController {
    config: ReconnectConfig,
    state: ReconnectState,
    consecutive_failures: u32,
    total_attempts: u64,
    last_success: Option<Instant>,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ReconnectState::Idle,
            consecutive_failures: 0,
            total_attempts: 0,
            last_success: None,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// An open attempt starts
    pub fn begin_attempt(&mut self) {
        self.total_attempts += 1;
        self.state = ReconnectState::Connecting;
        debug!("connect attempt #{} (failures so far: {})", self.total_attempts, self.consecutive_failures);
    }

    pub fn mark_connected(&mut self) {
        if self.consecutive_failures > 0 {
            info!("✅ connected after {} failed attempt(s)", self.consecutive_failures);
        }
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());
        self.state = ReconnectState::Connected;
    }

    /// An open attempt failed or an established connection dropped
    pub fn on_failure(&mut self) -> ReconnectStep {
        self.consecutive_failures += 1;
        if self.consecutive_failures > self.config.max_attempts {
            let attempts = self.consecutive_failures - 1;
            warn!("reconnect gave up after {} attempt(s)", attempts);
            self.state = ReconnectState::Failed;
            return ReconnectStep::GiveUp { attempts };
        }

        let attempt = self.consecutive_failures;
        let delay = self.config.delay_for(attempt - 1);
        info!("reconnect attempt {}/{} in {:?}", attempt, self.config.max_attempts, delay);
        self.state = ReconnectState::BackoffWait { attempt };
        ReconnectStep::RetryAfter { attempt, delay }
    }

    /// Back to `Idle` with a fresh attempt budget (manual reconnect, shutdown)
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.state = ReconnectState::Idle;
    }

    pub fn stats(&self) -> ReconnectStats {
        ReconnectStats {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            total_attempts: self.total_attempts,
            last_success_elapsed_ms: self
                .last_success
                .map(|t| Instant::now().saturating_duration_since(t).as_millis() as u64),
        }
    }
}
