//! Seams to the media layer. The coordinator never touches media itself: it
//! asks a [`MediaTransport`] for descriptions and a [`CaptureLayer`] for the
//! camera feed, and receives transport callbacks as [`TransportEvent`]s.

use async_trait::async_trait;
use kromi_common::{IceCandidate, PairKey, Result, SessionDescription, TransportState};

/// Handle to a capture source owned by the capture layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSource {
    pub id: String,
    pub label: String,
}

/// Peer-connection layer, one logical connection per pair.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Viewer side: create the connection and produce its offer.
    async fn create_offer(&self, pair: &PairKey) -> Result<SessionDescription>;

    /// Device side: apply the remote offer with `source` attached and
    /// produce the answer.
    async fn accept_offer(
        &self,
        pair: &PairKey,
        offer: SessionDescription,
        source: LocalSource,
    ) -> Result<SessionDescription>;

    /// Viewer side: apply the device's answer.
    async fn apply_answer(&self, pair: &PairKey, answer: SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&self, pair: &PairKey, candidate: IceCandidate) -> Result<()>;

    /// Release everything held for `pair`. Called at most once per session.
    async fn teardown(&self, pair: &PairKey);
}

#[async_trait]
pub trait CaptureLayer: Send + Sync {
    async fn acquire(&self) -> Result<LocalSource>;
    async fn release(&self, source: LocalSource);
}

/// Callback from the media layer, posted into the coordinator's mailbox.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate {
        pair: PairKey,
        candidate: IceCandidate,
    },
    StateChanged {
        pair: PairKey,
        state: TransportState,
    },
}
