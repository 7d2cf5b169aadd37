//! The relay's shared state: presence plus the session ledger behind one
//! mutex.
//!
//! Every operation that touches either structure takes the lock for its whole
//! duration, so a viewer's snapshot and the deltas that follow it are queued
//! into its outbox in a consistent order.

use std::sync::Arc;

use kromi_common::{
    generate_viewer_id, is_valid_participant_id, CloseReason, DeviceInfo, DeviceRegistration,
    Error, ParticipantRole, Registered, Result, SignalMessage, ViewerRegistration,
};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::ledger::{SessionLedger, SessionStateCounts};
use crate::presence::PresenceRegistry;
use crate::signal::{ConnectionId, Signaler};

#[derive(Default)]
pub struct HubState {
    pub(crate) presence: PresenceRegistry,
    pub(crate) ledger: SessionLedger,
}

/// Identity a signaling connection registered as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub role: ParticipantRole,
    pub event_id: String,
    pub connection: ConnectionId,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub devices: usize,
    pub viewers: usize,
    pub sessions: usize,
    pub session_states: SessionStateCounts,
}

#[derive(Clone, Default)]
pub struct SignalHub {
    state: Arc<Mutex<HubState>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().await
    }

    /// Register (or refresh) a capture device on `connection`.
    ///
    /// A device id taken over by a new connection closes every session the
    /// old connection had open.
    pub async fn register_device(
        &self,
        registration: DeviceRegistration,
        connection: ConnectionId,
        signaler: Signaler,
    ) -> Result<Participant> {
        if !is_valid_participant_id(&registration.device_id) {
            return Err(Error::protocol("invalid deviceId"));
        }
        if !is_valid_participant_id(&registration.event_id) {
            return Err(Error::protocol("invalid eventId"));
        }

        let device_id = registration.device_id.clone();
        let event_id = registration.event_id.clone();

        let mut state = self.lock().await;
        let moved_from = state
            .presence
            .device(&device_id)
            .filter(|prev| prev.is_online() && prev.event_id != event_id)
            .map(|prev| prev.event_id.clone());
        let replaced = state
            .presence
            .register_device(registration, connection, signaler.clone())?;
        if let Some(previous) = replaced {
            let _ = previous.try_send(SignalMessage::error(
                "session replaced by a newer connection",
            ));
            let closed = state.on_participant_removed(&device_id, CloseReason::Replaced);
            if closed > 0 {
                info!("closed {} sessions of replaced device {}", closed, device_id);
            }
        } else if let Some(old_event) = moved_from {
            // Offline in the old event: its viewers lose their sessions.
            let closed = state.on_participant_removed(&device_id, CloseReason::ParticipantLeft);
            info!(
                "device {} moved from event {} to {}, {} sessions closed",
                device_id, old_event, event_id, closed
            );
        }

        let _ = signaler.try_send(SignalMessage::Registered(Registered {
            participant_id: device_id.clone(),
            role: ParticipantRole::Device,
            event_id: event_id.clone(),
        }));

        Ok(Participant {
            id: device_id,
            role: ParticipantRole::Device,
            event_id,
            connection,
        })
    }

    /// Register a viewer; it receives `registered` then the event's
    /// `devices-list` snapshot.
    pub async fn register_viewer(
        &self,
        registration: ViewerRegistration,
        connection: ConnectionId,
        signaler: Signaler,
    ) -> Result<Participant> {
        if !is_valid_participant_id(&registration.event_id) {
            return Err(Error::protocol("invalid eventId"));
        }
        let viewer_id = match registration.viewer_id {
            Some(id) if is_valid_participant_id(&id) => id,
            Some(_) => return Err(Error::protocol("invalid viewerId")),
            None => generate_viewer_id(),
        };
        let event_id = registration.event_id;

        let mut state = self.lock().await;
        let (snapshot, replaced) = state.presence.register_viewer(
            viewer_id.clone(),
            event_id.clone(),
            connection,
            signaler.clone(),
        )?;
        if let Some(previous) = replaced {
            let _ = previous.try_send(SignalMessage::error(
                "session replaced by a newer connection",
            ));
            state.on_participant_removed(&viewer_id, CloseReason::Replaced);
        }

        let _ = signaler.try_send(SignalMessage::Registered(Registered {
            participant_id: viewer_id.clone(),
            role: ParticipantRole::Viewer,
            event_id: event_id.clone(),
        }));
        let _ = signaler.try_send(SignalMessage::DevicesList(snapshot));

        Ok(Participant {
            id: viewer_id,
            role: ParticipantRole::Viewer,
            event_id,
            connection,
        })
    }

    /// Presence list for an event, as served to external collaborators.
    pub async fn snapshot(&self, event_id: &str) -> Vec<DeviceInfo> {
        self.lock().await.presence.snapshot(event_id)
    }

    pub async fn stats(&self) -> HubStats {
        let state = self.lock().await;
        HubStats {
            devices: state.presence.device_count(),
            viewers: state.presence.viewer_count(),
            sessions: state.ledger.len(),
            session_states: state.ledger.state_counts(),
        }
    }
}
