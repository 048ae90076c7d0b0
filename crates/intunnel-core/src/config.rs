//! Configuration types for intunnel

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the Cloudflare quick-tunnel provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudflareConfig {
    /// Path or name of the `cloudflared` binary
    pub binary: PathBuf,
    /// How long to wait for the assigned hostname before giving up
    #[serde(with = "duration_secs")]
    pub startup_timeout: Duration,
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("cloudflared"),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

/// Settings for the Tailscale provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailscaleConfig {
    /// Path or name of the `tailscale` binary
    pub binary: PathBuf,
    /// Use `tailscale funnel` (public internet) instead of `tailscale serve` (tailnet only)
    pub funnel: bool,
    /// How long the serve process must stay up before the URL is reported
    #[serde(with = "duration_secs")]
    pub settle_delay: Duration,
}

impl Default for TailscaleConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tailscale"),
            funnel: true,
            settle_delay: Duration::from_secs(2),
        }
    }
}

/// What the exposure controller does when a running tunnel crashes
///
/// With `max_attempts == 0` a crash leaves the exposure in the error state
/// until the user starts it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Automatic restarts allowed after a crash, reset by every manual start
    pub max_attempts: u32,
    /// Delay before each automatic restart
    #[serde(with = "duration_secs")]
    pub backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Main configuration for intunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local server port (0 picks a free port)
    pub port: u16,
    /// Host advertised to mobile clients (auto-detected if None)
    pub host: Option<String>,
    /// Maximum simultaneously connected devices (unbounded if None)
    pub max_devices: Option<usize>,
    /// Default QR code size in pixels
    pub qr_size: u32,
    /// Cloudflare provider settings
    pub cloudflare: CloudflareConfig,
    /// Tailscale provider settings
    pub tailscale: TailscaleConfig,
    /// Crash restart policy for running tunnels
    pub restart: RestartPolicy,
    /// Settings file location (defaults to ~/.config/intunnel/settings.json)
    pub settings_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8765,
            host: None,
            max_devices: None,
            qr_size: 220,
            cloudflare: CloudflareConfig::default(),
            tailscale: TailscaleConfig::default(),
            restart: RestartPolicy::default(),
            settings_path: None,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set advertised host
    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    /// Builder pattern: set device cap
    pub fn with_max_devices(mut self, max_devices: Option<usize>) -> Self {
        self.max_devices = max_devices;
        self
    }

    /// Builder pattern: set Cloudflare settings
    pub fn with_cloudflare(mut self, cloudflare: CloudflareConfig) -> Self {
        self.cloudflare = cloudflare;
        self
    }

    /// Builder pattern: set Tailscale settings
    pub fn with_tailscale(mut self, tailscale: TailscaleConfig) -> Self {
        self.tailscale = tailscale;
        self
    }

    /// Builder pattern: set restart policy
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Builder pattern: set settings file location
    pub fn with_settings_path(mut self, path: PathBuf) -> Self {
        self.settings_path = Some(path);
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8765);
        assert_eq!(config.restart.max_attempts, 0);
        assert!(config.tailscale.funnel);
    }

    #[test]
    fn test_builder() {
        let config = Config::new()
            .with_port(9000)
            .with_host(Some("10.0.0.2".to_string()))
            .with_max_devices(Some(3));
        assert_eq!(config.port, 9000);
        assert_eq!(config.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(config.max_devices, Some(3));
    }

    #[test]
    fn test_durations_serialize_as_seconds() {
        let json = serde_json::to_value(RestartPolicy::default()).unwrap();
        assert_eq!(json["backoff"], 5);
    }
}
