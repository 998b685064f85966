//! Time helpers
//!
//! All timestamps exchanged with the server and stored on queue items are
//! UTC milliseconds since the epoch, generated with `Utc::now().timestamp_millis()`.

use chrono::Utc;

/// Current UTC time in milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
