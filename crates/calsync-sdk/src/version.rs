//! SDK version metadata

/// SDK semver, taken from Cargo.toml.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client identifier sent with the connection request.
pub fn user_agent() -> String {
    format!("calsync-sdk/{} ({})", SDK_VERSION, std::env::consts::OS)
}
