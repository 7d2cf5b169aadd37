//! Command Dispatcher and description/candidate forwarding.

use std::time::Instant;

use kromi_common::{
    AnswerPayload, CandidatePayload, CloseReason, Error, OfferPayload, PairKey, ParticipantRole,
    Result, SessionState, SessionStateReport, SignalMessage, StreamCommand, StreamCommandPayload,
    TransportState,
};
use tracing::{debug, info, warn};

use crate::hub::{Participant, SignalHub};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// `start` was queued for the device.
    Forwarded,
    /// The pair already has a live session; nothing was sent.
    AlreadyActive,
}

fn require_role(participant: &Participant, role: ParticipantRole, action: &str) -> Result<()> {
    if participant.role != role {
        return Err(Error::protocol(format!("{} requires a {} registration", action, role)));
    }
    Ok(())
}

/// Pair addressed by a message from `sender` to `target`.
fn pair_for(sender: &Participant, target: &str) -> PairKey {
    match sender.role {
        ParticipantRole::Device => PairKey::new(sender.id.clone(), target),
        ParticipantRole::Viewer => PairKey::new(target, sender.id.clone()),
    }
}

impl SignalHub {
    /// Ask `device_id` to start capturing for `viewer`.
    ///
    /// Does not wait for the device to act on the command.
    pub async fn start_stream(&self, viewer: &Participant, device_id: &str) -> Result<StartOutcome> {
        require_role(viewer, ParticipantRole::Viewer, "start-stream")?;

        let mut state = self.lock().await;
        let online = state
            .presence
            .device(device_id)
            .map(|device| device.is_online())
            .unwrap_or(false);
        if !online {
            info!("start-stream from {} for unavailable device {}", viewer.id, device_id);
            return Err(Error::DeviceUnavailable(device_id.to_string()));
        }

        let pair = PairKey::new(device_id, viewer.id.clone());
        if !state.ledger.begin(pair.clone(), Instant::now()) {
            debug!("start-stream for {} ignored: session already active", pair);
            return Ok(StartOutcome::AlreadyActive);
        }

        state.presence.send_to(
            device_id,
            SignalMessage::StreamCommand(StreamCommandPayload {
                command: StreamCommand::Start,
                viewer_id: viewer.id.clone(),
            }),
        );
        state.presence.set_streaming(device_id, true);
        info!("start-stream forwarded for {}", pair);
        Ok(StartOutcome::Forwarded)
    }

    /// Forward `stop` to the device when reachable and always tear down the
    /// pair on the relay.
    pub async fn stop_stream(&self, viewer: &Participant, device_id: &str) -> Result<bool> {
        require_role(viewer, ParticipantRole::Viewer, "stop-stream")?;

        let mut state = self.lock().await;
        let delivered = state.presence.send_to(
            device_id,
            SignalMessage::StreamCommand(StreamCommandPayload {
                command: StreamCommand::Stop,
                viewer_id: viewer.id.clone(),
            }),
        );
        if !delivered {
            debug!("stop-stream for {}: device not reachable", device_id);
        }

        let pair = PairKey::new(device_id, viewer.id.clone());
        state.close_session(&pair, CloseReason::StopRequested);
        Ok(delivered)
    }

    /// Viewer → device. Opens the ledger entry if the viewer skipped
    /// `start-stream`.
    pub async fn relay_offer(&self, sender: &Participant, payload: OfferPayload) -> Result<bool> {
        require_role(sender, ParticipantRole::Viewer, "offer")?;

        let mut state = self.lock().await;
        if state.presence.role_of(&payload.to) != Some(ParticipantRole::Device) {
            warn!("dropping offer from {}: unknown device {}", sender.id, payload.to);
            return Ok(false);
        }

        let now = Instant::now();
        let pair = pair_for(sender, &payload.to);
        if state.ledger.begin(pair.clone(), now) {
            state.presence.set_streaming(&pair.device_id, true);
        }
        if let Err(err) = state.ledger.advance(&pair, SessionState::OfferSent, now) {
            debug!("offer for {} does not advance ledger: {}", pair, err);
        }

        Ok(state.presence.send_to(
            &payload.to,
            SignalMessage::Offer(OfferPayload {
                from: sender.id.clone(),
                to: payload.to.clone(),
                offer: payload.offer,
            }),
        ))
    }

    /// Device → viewer.
    pub async fn relay_answer(&self, sender: &Participant, payload: AnswerPayload) -> Result<bool> {
        require_role(sender, ParticipantRole::Device, "answer")?;

        let mut state = self.lock().await;
        let pair = pair_for(sender, &payload.to);
        if !state.ledger.contains(&pair) {
            warn!("dropping answer for unknown pair {}", pair);
            return Ok(false);
        }
        if state.presence.role_of(&payload.to) != Some(ParticipantRole::Viewer) {
            warn!("dropping answer from {}: unknown viewer {}", sender.id, payload.to);
            return Ok(false);
        }
        if let Err(err) = state
            .ledger
            .advance(&pair, SessionState::AnswerSent, Instant::now())
        {
            debug!("answer for {} does not advance ledger: {}", pair, err);
        }

        Ok(state.presence.send_to(
            &payload.to,
            SignalMessage::Answer(AnswerPayload {
                from: sender.id.clone(),
                to: payload.to.clone(),
                answer: payload.answer,
            }),
        ))
    }

    /// Either side → the other. Never buffered here.
    pub async fn relay_candidate(
        &self,
        sender: &Participant,
        payload: CandidatePayload,
    ) -> Result<bool> {
        let state = self.lock().await;
        let pair = pair_for(sender, &payload.to);
        if !state.ledger.contains(&pair) {
            debug!("dropping candidate for unknown pair {}", pair);
            return Ok(false);
        }

        let delivered = state.presence.send_to(
            &payload.to,
            SignalMessage::IceCandidate(CandidatePayload {
                from: sender.id.clone(),
                to: payload.to.clone(),
                candidate: payload.candidate,
            }),
        );
        if !delivered {
            debug!("dropping candidate for {}: target not reachable", pair);
        }
        Ok(delivered)
    }

    /// Record a transport-reported connection state for a pair.
    pub async fn report_state(&self, sender: &Participant, report: SessionStateReport) -> Result<()> {
        let mut state = self.lock().await;
        let pair = pair_for(sender, &report.to);
        if !state.ledger.contains(&pair) {
            debug!("ignoring {:?} report for unknown pair {}", report.state, pair);
            return Ok(());
        }

        match report.state {
            TransportState::Connecting => {}
            TransportState::Connected => {
                match state
                    .ledger
                    .advance(&pair, SessionState::Connected, Instant::now())
                {
                    Ok(_) => info!("pair {} connected", pair),
                    Err(err) => debug!("connected report for {}: {}", pair, err),
                }
            }
            TransportState::Failed | TransportState::Disconnected => {
                let _ = state
                    .ledger
                    .advance(&pair, SessionState::Failed, Instant::now());
                warn!("pair {} reported {:?} by {}", pair, report.state, sender.id);
                state.close_session(&pair, CloseReason::TransportFailed);
            }
        }
        Ok(())
    }
}
