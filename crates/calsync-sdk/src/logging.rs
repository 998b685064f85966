//! Tracing setup for applications embedding the SDK

use tracing::Level;

/// Installs a fmt subscriber. Returns `false` when a global subscriber was
/// already set, which is not an error.
pub fn init_tracing(debug_mode: bool) -> bool {
    let level = if debug_mode { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(debug_mode)
        .try_init()
        .is_ok()
}
