use thiserror::Error;

/// Errors surfaced by the realtime layer.
///
/// Every variant is `Clone` so the same error can be returned to a caller and
/// broadcast to `on_error` observers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CalsyncError {
    /// Connection failed to open or dropped mid-session
    #[error("Transport error: {0}")]
    Transport(String),

    /// An outbound item received no ack within the configured timeout
    #[error("Send timeout: item {item_id} was not acknowledged after {attempts} attempt(s)")]
    SendTimeout { item_id: String, attempts: u32 },

    /// The server rejected an outbound item, or retries were exhausted
    #[error("Send failed: item {item_id}: {reason}")]
    SendFailed { item_id: String, reason: String },

    /// Automatic reconnect gave up; an explicit `reconnect()` is required
    #[error("Reconnect exhausted after {attempts} attempt(s)")]
    ReconnectExhausted { attempts: u32 },

    /// Missing or invalid connection settings, fatal and never retried
    #[error("Config error: {0}")]
    Config(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    #[error("Sync queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl CalsyncError {
    /// Whether the failure is worth another attempt under the retry policy
    pub fn is_retryable(&self) -> bool {
        match self {
            CalsyncError::Transport(_)
            | CalsyncError::SendTimeout { .. }
            | CalsyncError::NotConnected => true,
            CalsyncError::SendFailed { .. }
            | CalsyncError::ReconnectExhausted { .. }
            | CalsyncError::Config(_)
            | CalsyncError::ShuttingDown(_)
            | CalsyncError::QueueFull(_)
            | CalsyncError::Serialization(_)
            | CalsyncError::InvalidArgument(_)
            | CalsyncError::InvalidData(_)
            | CalsyncError::NotFound(_) => false,
        }
    }

    /// Stable short name, used in logs and error events
    pub fn kind(&self) -> &'static str {
        match self {
            CalsyncError::Transport(_) => "transport",
            CalsyncError::SendTimeout { .. } => "send_timeout",
            CalsyncError::SendFailed { .. } => "send_failed",
            CalsyncError::ReconnectExhausted { .. } => "reconnect_exhausted",
            CalsyncError::Config(_) => "configuration",
            CalsyncError::NotConnected => "not_connected",
            CalsyncError::ShuttingDown(_) => "shutting_down",
            CalsyncError::QueueFull(_) => "queue_full",
            CalsyncError::Serialization(_) => "serialization",
            CalsyncError::InvalidArgument(_) => "invalid_argument",
            CalsyncError::InvalidData(_) => "invalid_data",
            CalsyncError::NotFound(_) => "not_found",
        }
    }
}

impl From<serde_json::Error> for CalsyncError {
    fn from(error: serde_json::Error) -> Self {
        CalsyncError::Serialization(error.to_string())
    }
}

impl From<url::ParseError> for CalsyncError {
    fn from(error: url::ParseError) -> Self {
        CalsyncError::Config(format!("invalid server url: {}", error))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CalsyncError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        CalsyncError::Transport(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CalsyncError>;
