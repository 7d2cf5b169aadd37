//! Presence Registry: which devices are online and which viewers watch
//! which event.
//!
//! All broadcasts are fire-and-forget `try_send`s into connection outboxes.

use std::collections::HashMap;

use kromi_common::{
    DeviceInfo, DeviceRegistration, DeviceStatus, Error, ParticipantRole, Result, SignalMessage,
};
use tracing::{debug, info, warn};

use crate::signal::{ConnectionId, Signaler};

pub struct DeviceEntry {
    pub device_id: String,
    pub event_id: String,
    pub display_name: String,
    pub status: DeviceStatus,
    pub streaming: bool,
    pub connection: ConnectionId,
    signaler: Signaler,
}

impl DeviceEntry {
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.clone(),
            device_name: self.display_name.clone(),
            status: self.status,
            streaming: self.streaming,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }
}

pub struct ViewerEntry {
    pub viewer_id: String,
    pub event_id: String,
    pub connection: ConnectionId,
    signaler: Signaler,
}

/// What `unregister` removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removed {
    Device { info: DeviceInfo, event_id: String },
    Viewer { viewer_id: String, event_id: String },
}

impl Removed {
    pub fn participant_id(&self) -> &str {
        match self {
            Removed::Device { info, .. } => &info.device_id,
            Removed::Viewer { viewer_id, .. } => viewer_id,
        }
    }
}

#[derive(Default)]
pub struct PresenceRegistry {
    devices: HashMap<String, DeviceEntry>,
    viewers: HashMap<String, ViewerEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a device and announce it to the event's viewers.
    ///
    /// Returns the signaler of a previous connection that registered the same
    /// id, so the caller can tell it it was replaced.
    pub fn register_device(
        &mut self,
        registration: DeviceRegistration,
        connection: ConnectionId,
        signaler: Signaler,
    ) -> Result<Option<Signaler>> {
        if self.viewers.contains_key(&registration.device_id) {
            return Err(Error::protocol(format!(
                "id {} is already registered as a viewer",
                registration.device_id
            )));
        }

        let DeviceRegistration {
            device_id,
            event_id,
            device_name,
        } = registration;

        let previous = self.devices.remove(&device_id);
        let mut replaced = None;
        let mut announce = true;
        let mut streaming = false;

        if let Some(prev) = previous {
            if prev.connection != connection {
                replaced = Some(prev.signaler.clone());
            }
            if prev.event_id == event_id && prev.is_online() {
                announce = false;
                streaming = prev.streaming;
            } else if prev.is_online() {
                let mut offline = prev.info();
                offline.status = DeviceStatus::Offline;
                offline.streaming = false;
                self.broadcast_to_viewers(&prev.event_id, &SignalMessage::DeviceOffline(offline));
            }
        }

        let entry = DeviceEntry {
            device_id: device_id.clone(),
            event_id: event_id.clone(),
            display_name: device_name,
            status: DeviceStatus::Online,
            streaming,
            connection,
            signaler,
        };
        let info = entry.info();
        self.devices.insert(device_id.clone(), entry);

        if announce {
            info!("device {} online for event {}", device_id, event_id);
            self.broadcast_to_viewers(&event_id, &SignalMessage::DeviceOnline(info));
        } else {
            debug!("device {} refreshed registration", device_id);
        }

        Ok(replaced)
    }

    /// Add a viewer and return the event's current device snapshot.
    pub fn register_viewer(
        &mut self,
        viewer_id: String,
        event_id: String,
        connection: ConnectionId,
        signaler: Signaler,
    ) -> Result<(Vec<DeviceInfo>, Option<Signaler>)> {
        if self.devices.contains_key(&viewer_id) {
            return Err(Error::protocol(format!(
                "id {} is already registered as a device",
                viewer_id
            )));
        }

        let replaced = self
            .viewers
            .remove(&viewer_id)
            .filter(|prev| prev.connection != connection)
            .map(|prev| prev.signaler);

        info!("viewer {} watching event {}", viewer_id, event_id);
        self.viewers.insert(
            viewer_id.clone(),
            ViewerEntry {
                viewer_id,
                event_id: event_id.clone(),
                connection,
                signaler,
            },
        );

        Ok((self.snapshot(&event_id), replaced))
    }

    /// Remove `participant_id` if it is still owned by `connection`.
    ///
    /// A device removal is broadcast as `device-offline` to the event's
    /// viewers. A stale connection whose id was taken over by a newer one
    /// removes nothing.
    pub fn unregister(&mut self, participant_id: &str, connection: ConnectionId) -> Option<Removed> {
        if let Some(entry) = self.devices.get(participant_id) {
            if entry.connection != connection {
                debug!(
                    "ignoring unregister of {} from superseded connection",
                    participant_id
                );
                return None;
            }
            let entry = self.devices.remove(participant_id)?;
            let mut info = entry.info();
            info.status = DeviceStatus::Offline;
            info.streaming = false;
            info!("device {} offline", participant_id);
            self.broadcast_to_viewers(&entry.event_id, &SignalMessage::DeviceOffline(info.clone()));
            return Some(Removed::Device {
                info,
                event_id: entry.event_id,
            });
        }

        if let Some(entry) = self.viewers.get(participant_id) {
            if entry.connection != connection {
                return None;
            }
            let entry = self.viewers.remove(participant_id)?;
            info!("viewer {} left event {}", participant_id, entry.event_id);
            return Some(Removed::Viewer {
                viewer_id: entry.viewer_id,
                event_id: entry.event_id,
            });
        }

        None
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceEntry> {
        self.devices.get(device_id)
    }

    pub fn viewer(&self, viewer_id: &str) -> Option<&ViewerEntry> {
        self.viewers.get(viewer_id)
    }

    pub fn role_of(&self, participant_id: &str) -> Option<ParticipantRole> {
        if self.devices.contains_key(participant_id) {
            Some(ParticipantRole::Device)
        } else if self.viewers.contains_key(participant_id) {
            Some(ParticipantRole::Viewer)
        } else {
            None
        }
    }

    /// Deliver `msg` to a registered participant. Returns false when the
    /// participant is unknown or its outbox refused the message.
    pub fn send_to(&self, participant_id: &str, msg: SignalMessage) -> bool {
        let signaler = self
            .devices
            .get(participant_id)
            .map(|d| &d.signaler)
            .or_else(|| self.viewers.get(participant_id).map(|v| &v.signaler));

        match signaler {
            Some(signaler) => {
                let kind = msg.kind();
                if signaler.try_send(msg) {
                    true
                } else {
                    warn!("failed to queue {} for {}", kind, participant_id);
                    false
                }
            }
            None => false,
        }
    }

    /// Returns true when the flag changed.
    pub fn set_streaming(&mut self, device_id: &str, streaming: bool) -> bool {
        match self.devices.get_mut(device_id) {
            Some(entry) if entry.streaming != streaming => {
                entry.streaming = streaming;
                true
            }
            _ => false,
        }
    }

    /// Point-in-time list of the event's online devices, ordered by id.
    pub fn snapshot(&self, event_id: &str) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .devices
            .values()
            .filter(|d| d.event_id == event_id && d.is_online())
            .map(DeviceEntry::info)
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn broadcast_to_viewers(&self, event_id: &str, msg: &SignalMessage) -> usize {
        let mut delivered = 0;
        for viewer in self.viewers.values().filter(|v| v.event_id == event_id) {
            if viewer.signaler.try_send(msg.clone()) {
                delivered += 1;
            } else {
                warn!("failed to queue {} for viewer {}", msg.kind(), viewer.viewer_id);
            }
        }
        delivered
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }
}
