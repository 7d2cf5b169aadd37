//! Signaling relay for Kromi live streams: presence of capture devices,
//! viewer stream commands and WebRTC negotiation relay.

pub mod config;
pub mod dispatch;
pub mod hub;
pub mod ledger;
pub mod lifecycle;
pub mod presence;
pub mod security;
pub mod signal;
pub mod web;

pub use config::{Args, SignalLimits};
pub use dispatch::StartOutcome;
pub use hub::{HubStats, Participant, SignalHub};
pub use presence::Removed;
pub use signal::{ConnectionId, Signaler};
pub use web::{router, AppState};
