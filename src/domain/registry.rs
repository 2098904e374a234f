//! Device Registry
//!
//! Deduplicates scan results into a stable, order-preserving candidate list.

use crate::domain::models::DeviceDescriptor;

/// Outcome of observing one scan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Appended,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `candidate` unless a device with the same id is already known.
    ///
    /// First-seen wins for identity; a repeated sighting only refreshes RSSI.
    pub fn observe(&mut self, candidate: DeviceDescriptor) -> Observation {
        if let Some(existing) = self.devices.iter_mut().find(|d| d.id == candidate.id) {
            if candidate.rssi.is_some() {
                existing.rssi = candidate.rssi;
            }
            return Observation::Unchanged;
        }

        self.devices.push(candidate);
        Observation::Appended
    }

    /// Forget everything; called when a new scan cycle starts.
    pub fn reset(&mut self) {
        self.devices.clear();
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn get(&self, id: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
