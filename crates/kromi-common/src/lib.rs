//! Shared types for Kromi live streaming: signaling protocol, connectivity
//! configuration, identifiers, error types.
//!
//! Both the relay (`kromi-signal`) and the participants (`kromi-peer`) speak
//! the protocol defined here.

#![forbid(unsafe_code)]

pub mod error;
pub mod ice;
pub mod ids;
pub mod protocol;

pub use error::{Error, Result};
pub use ice::{IceServer, RtcConfig};
pub use ids::{generate_viewer_id, is_valid_participant_id, PairKey};
pub use protocol::*;

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
