//! Connected device identity
//!
//! Represents a mobile client for as long as its connection is alive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection identity of a device
///
/// Clients may supply a stable id so a reconnect replaces their previous entry;
/// otherwise each connection gets a random one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Generate a new random device ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connected device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Connection identity
    pub id: DeviceId,
    /// Human-readable device name (e.g., "iPhone 15 Pro")
    pub display_name: String,
    /// Remote socket address of the connection
    pub remote_address: String,
    /// When the current connection was accepted
    pub connected_at: DateTime<Utc>,
}

impl Device {
    /// Create a device with a fresh id, connected now
    pub fn new(display_name: impl Into<String>, remote_address: impl Into<String>) -> Self {
        Self::with_id(DeviceId::new(), display_name, remote_address)
    }

    /// Create a device with a client-supplied id, connected now
    pub fn with_id(
        id: DeviceId,
        display_name: impl Into<String>,
        remote_address: impl Into<String>,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            remote_address: remote_address.into(),
            connected_at: Utc::now(),
        }
    }

    /// Whether `other` describes the same connection, not just the same id
    ///
    /// A reconnect refreshes the registry entry in place; the address and
    /// connect time tell the two connections apart.
    pub fn same_connection(&self, other: &Device) -> bool {
        self.id == other.id
            && self.remote_address == other.remote_address
            && self.connected_at == other.connected_at
    }
}

/// Summary information about a device for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub remote_address: String,
    pub connected_at: DateTime<Utc>,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.to_string(),
            name: device.display_name.clone(),
            remote_address: device.remote_address.clone(),
            connected_at: device.connected_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_generation() {
        let id1 = DeviceId::new();
        let id2 = DeviceId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_device_creation() {
        let device = Device::with_id("phone-1".into(), "Test Phone", "10.0.0.5:4000");
        assert_eq!(device.id.as_str(), "phone-1");
        assert_eq!(device.display_name, "Test Phone");
        assert_eq!(device.remote_address, "10.0.0.5:4000");
    }

    #[test]
    fn test_device_info_projection() {
        let device = Device::new("Tablet", "10.0.0.9:5000");
        let info = DeviceInfo::from(&device);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "Tablet");
        assert_eq!(json["remoteAddress"], "10.0.0.9:5000");
        assert_eq!(json["id"], device.id.to_string());
    }
}
