//! Participant side of Kromi live streaming: per-pair negotiation, candidate
//! buffering and the WebSocket signaling client used by capture devices and
//! viewers.

pub mod coordinator;
pub mod roster;
pub mod session;
pub mod signaling;
pub mod transport;

pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorEvent, CoordinatorHandle, CoordinatorInput,
};
pub use roster::DeviceRoster;
pub use session::{PeerSession, SessionTable};
pub use signaling::{forward_to_coordinator, validate_signaling_url, SignalingClient};
pub use transport::{CaptureLayer, LocalSource, MediaTransport, TransportEvent};
