//! Registry of currently connected devices
//!
//! Every mutation publishes the full, ordered device list; listeners never
//! see deltas and need no merge logic.

use crate::device::{Device, DeviceId};
use intunnel_core::{ListenerHandle, Notifier};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Device registry is full ({0} devices)")]
    Full(usize),
}

impl From<RegistryError> for intunnel_core::Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Full(cap) => intunnel_core::Error::RegistryFull(cap),
        }
    }
}

/// Tracks connected devices and broadcasts snapshots on change
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceId, Device>>,
    notifier: Notifier<Vec<Device>>,
    max_devices: Option<usize>,
}

impl DeviceRegistry {
    /// Create an empty registry, optionally capped at `max_devices` entries
    pub fn new(max_devices: Option<usize>) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            notifier: Notifier::new(Vec::new()),
            max_devices,
        }
    }

    /// Add a device, or refresh the address and connect time of a known id
    pub fn register(&self, device: Device) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = devices.get_mut(&device.id) {
            debug!(
                "Device {} reconnected from {} (was {})",
                device.id, device.remote_address, existing.remote_address
            );
            existing.remote_address = device.remote_address;
            existing.connected_at = device.connected_at;
        } else {
            if let Some(cap) = self.max_devices {
                if devices.len() >= cap {
                    warn!("Rejected device {}: registry full", device.id);
                    return Err(RegistryError::Full(cap));
                }
            }
            info!(
                "Device {} ({}) connected from {}",
                device.id, device.display_name, device.remote_address
            );
            devices.insert(device.id.clone(), device);
        }

        self.notifier.publish(snapshot(&devices));
        Ok(())
    }

    /// Remove a device; returns whether it was present
    pub fn unregister(&self, id: &DeviceId) -> bool {
        self.unregister_if(id, |_| true)
    }

    /// Remove `id` only while its entry satisfies `predicate`
    ///
    /// The check and the removal happen under one lock, so an entry refreshed
    /// by a concurrent reconnect is never removed on behalf of the old one.
    pub fn unregister_if<F>(&self, id: &DeviceId, predicate: F) -> bool
    where
        F: FnOnce(&Device) -> bool,
    {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if !devices.get(id).is_some_and(predicate) {
            return false;
        }
        devices.remove(id);
        info!("Device {} disconnected", id);
        self.notifier.publish(snapshot(&devices));
        true
    }

    /// Remove every device
    pub fn clear(&self) {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if devices.is_empty() {
            return;
        }
        devices.clear();
        info!("Cleared all connected devices");
        self.notifier.publish(Vec::new());
    }

    /// Snapshot ordered by connection time, oldest first
    pub fn list(&self) -> Vec<Device> {
        self.notifier.current()
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `listener` with the full device list after every change
    pub fn add_listener<F>(&self, listener: F) -> intunnel_core::Result<ListenerHandle>
    where
        F: Fn(Vec<Device>) + Send + 'static,
    {
        self.notifier.add_listener(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.notifier.remove_listener(handle);
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Device>> {
        self.notifier.subscribe()
    }
}

fn snapshot(devices: &HashMap<DeviceId, Device>) -> Vec<Device> {
    let mut list: Vec<Device> = devices.values().cloned().collect();
    list.sort_by(|a, b| {
        a.connected_at
            .cmp(&b.connected_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    list
}
