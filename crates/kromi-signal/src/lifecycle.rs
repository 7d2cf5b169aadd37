//! Connection Lifecycle Manager: teardown on stop, disconnect, failure and
//! negotiation timeout.

use std::time::{Duration, Instant};

use kromi_common::{CloseReason, PairKey, SessionClosed, SignalMessage};
use tracing::{debug, info};

use crate::hub::{HubState, Participant, SignalHub};
use crate::presence::Removed;

impl HubState {
    /// Remove the pair and tell both sides. Closing an absent pair is a
    /// no-op and returns false.
    pub(crate) fn close_session(&mut self, pair: &PairKey, reason: CloseReason) -> bool {
        let Some(entry) = self.ledger.remove(pair) else {
            debug!("close of {} ignored: no live session", pair);
            return false;
        };
        info!("closing {} in state {} ({})", pair, entry.state, reason);

        let notice = SessionClosed {
            device_id: pair.device_id.clone(),
            viewer_id: pair.viewer_id.clone(),
            reason,
        };
        self.presence
            .send_to(&pair.device_id, SignalMessage::SessionClosed(notice.clone()));
        self.presence
            .send_to(&pair.viewer_id, SignalMessage::SessionClosed(notice));

        if !self.ledger.device_has_sessions(&pair.device_id) {
            self.presence.set_streaming(&pair.device_id, false);
        }
        true
    }

    /// Close every pair referencing `participant_id`.
    pub(crate) fn on_participant_removed(&mut self, participant_id: &str, reason: CloseReason) -> usize {
        self.ledger
            .pairs_involving(participant_id)
            .iter()
            .filter(|pair| self.close_session(pair, reason))
            .count()
    }
}

impl SignalHub {
    /// Transport disconnect or explicit unregister of `participant`.
    pub async fn disconnect(&self, participant: &Participant) -> Option<Removed> {
        let mut state = self.lock().await;
        let removed = state
            .presence
            .unregister(&participant.id, participant.connection)?;
        let closed = state.on_participant_removed(&participant.id, CloseReason::ParticipantLeft);
        if closed > 0 {
            info!("closed {} sessions after {} left", closed, participant.id);
        }
        Some(removed)
    }

    pub async fn close_session(&self, pair: &PairKey, reason: CloseReason) -> bool {
        self.lock().await.close_session(pair, reason)
    }

    /// Force-close pairs that did not reach `connected` within `timeout`.
    pub async fn sweep_stalled(&self, timeout: Duration) -> usize {
        let mut state = self.lock().await;
        let stalled = state.ledger.stalled(Instant::now(), timeout);
        stalled
            .iter()
            .filter(|pair| state.close_session(pair, CloseReason::NegotiationTimeout))
            .count()
    }
}
