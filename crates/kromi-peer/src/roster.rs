use std::collections::BTreeMap;

use kromi_common::{DeviceInfo, DeviceStatus};

/// A viewer's local view of the devices in its event.
#[derive(Debug, Default, Clone)]
pub struct DeviceRoster {
    devices: BTreeMap<String, DeviceInfo>,
}

impl DeviceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with a `devices-list` snapshot.
    pub fn replace(&mut self, devices: Vec<DeviceInfo>) {
        self.devices = devices
            .into_iter()
            .map(|device| (device.device_id.clone(), device))
            .collect();
    }

    /// Returns true if the device was not already listed online.
    pub fn upsert(&mut self, device: DeviceInfo) -> bool {
        let was_online = self.is_online(&device.device_id);
        self.devices.insert(device.device_id.clone(), device);
        !was_online
    }

    pub fn remove(&mut self, device_id: &str) -> Option<DeviceInfo> {
        self.devices.remove(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceInfo> {
        self.devices.get(device_id)
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        self.devices
            .get(device_id)
            .map(|device| device.status == DeviceStatus::Online)
            .unwrap_or(false)
    }

    /// Listed devices ordered by id.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
