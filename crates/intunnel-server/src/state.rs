//! Shared state for the pairing server

use intunnel_auth::{Device, DeviceId, DeviceRegistry, TokenIssuer};
use intunnel_core::{
    Config, ConnectionDescriptor, ExposureMode, ExposureState, Result, SettingsStore,
};
use intunnel_exposure::ExposureController;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Name used when a client does not announce one
pub const UNNAMED_DEVICE: &str = "Unknown device";

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Pairing token for this server lifetime
    pub issuer: TokenIssuer,
    /// Currently connected devices
    pub registry: Arc<DeviceRegistry>,
    /// Exposure state machine
    pub controller: ExposureController,
    /// Persisted user settings
    pub settings: Arc<SettingsStore>,
    /// URL of this server on the local network
    pub local_url: String,
}

impl AppState {
    pub fn new(
        config: Config,
        issuer: TokenIssuer,
        registry: Arc<DeviceRegistry>,
        controller: ExposureController,
        settings: Arc<SettingsStore>,
        local_url: String,
    ) -> Self {
        Self {
            config,
            issuer,
            registry,
            controller,
            settings,
            local_url,
        }
    }

    /// What a client needs to connect right now
    pub fn descriptor(&self) -> ConnectionDescriptor {
        descriptor_for(&self.controller.state(), &self.local_url, self.issuer.token())
    }

    /// Verify `token` and register the connecting device
    ///
    /// A rejected connection never reaches the registry.
    pub fn admit(
        &self,
        token: &str,
        name: Option<&str>,
        device_id: Option<&str>,
        remote: SocketAddr,
    ) -> Result<Device> {
        if let Err(e) = self.issuer.verify(token) {
            warn!("Rejected connection from {}: {}", remote, e);
            return Err(e.into());
        }

        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(UNNAMED_DEVICE);
        let device = match device_id.filter(|id| !id.is_empty()) {
            Some(id) => Device::with_id(DeviceId::from(id), name, remote.to_string()),
            None => Device::new(name, remote.to_string()),
        };

        self.registry.register(device.clone())?;
        info!("Device connected: {} ({}) from {}", device.display_name, device.id, remote);
        Ok(device)
    }

    /// Switch exposure mode and remember it
    pub fn set_mode(&self, mode: ExposureMode) {
        select_mode(&self.controller, &self.settings, mode);
    }

    pub fn exposure(&self) -> ExposureState {
        self.controller.state()
    }
}

/// The public URL while a tunnel runs, the local one otherwise
pub fn descriptor_for(state: &ExposureState, local_url: &str, token: &str) -> ConnectionDescriptor {
    let base_url = state.public_url().unwrap_or(local_url);
    ConnectionDescriptor::new(base_url, token)
}

/// Apply `mode` to the controller and persist it; persistence failures are logged
pub(crate) fn select_mode(
    controller: &ExposureController,
    settings: &SettingsStore,
    mode: ExposureMode,
) {
    controller.set_mode(mode);
    if let Err(e) = settings.set_exposure_mode(mode) {
        warn!("Failed to save exposure mode: {}", e);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use intunnel_core::RestartPolicy;
    use intunnel_exposure::ProviderSet;
    use tempfile::TempDir;

    /// State backed by a temporary settings file and no tunnel providers
    pub fn app_state(max_devices: Option<usize>) -> (Arc<AppState>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::with_path(dir.path().join("settings.json")).unwrap();
        let config = Config::default().with_max_devices(max_devices);
        let controller = ExposureController::new(ProviderSet::new(), RestartPolicy::default());
        controller.set_local_url("http://192.168.1.10:8765");
        let state = AppState::new(
            config,
            TokenIssuer::new(),
            Arc::new(DeviceRegistry::new(max_devices)),
            controller,
            Arc::new(settings),
            "http://192.168.1.10:8765".to_string(),
        );
        (Arc::new(state), dir)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::app_state;
    use super::*;
    use intunnel_core::Error;

    fn remote() -> SocketAddr {
        "192.168.1.40:51234".parse().unwrap()
    }

    #[test]
    fn test_descriptor_prefers_public_url_while_running() {
        let local = "http://192.168.1.10:8765";
        let running = ExposureState::running(ExposureMode::Cloudflare, "https://x.example");
        assert_eq!(
            descriptor_for(&running, local, "tok").payload(),
            "https://x.example?token=tok"
        );

        for state in [
            ExposureState::stopped(ExposureMode::Cloudflare),
            ExposureState::starting(ExposureMode::Tailscale),
            ExposureState::failed(ExposureMode::Tailscale, "boom"),
        ] {
            assert_eq!(
                descriptor_for(&state, local, "tok").payload(),
                "http://192.168.1.10:8765?token=tok"
            );
        }
    }

    #[test]
    fn test_admit_valid_token() {
        let (state, _dir) = app_state(None);
        let token = state.issuer.token().to_string();
        let device = state
            .admit(&token, Some(" Pixel 8 "), Some("phone-1"), remote())
            .unwrap();
        assert_eq!(device.display_name, "Pixel 8");
        assert_eq!(device.id.as_str(), "phone-1");
        assert_eq!(device.remote_address, "192.168.1.40:51234");
        assert_eq!(state.registry.list(), vec![device]);
    }

    #[test]
    fn test_admit_rejects_bad_token_without_registering() {
        let (state, _dir) = app_state(None);
        let overlong = format!("{}x", state.issuer.token());
        for candidate in ["", "nope", overlong.as_str()] {
            assert!(matches!(
                state.admit(candidate, Some("Pixel"), None, remote()),
                Err(Error::AuthenticationFailed)
            ));
        }
        assert!(state.registry.is_empty());
    }

    #[test]
    fn test_admit_defaults_name_and_id() {
        let (state, _dir) = app_state(None);
        let token = state.issuer.token().to_string();
        let device = state.admit(&token, Some("  "), Some(""), remote()).unwrap();
        assert_eq!(device.display_name, UNNAMED_DEVICE);
        assert!(!device.id.as_str().is_empty());
    }

    #[test]
    fn test_admit_when_full() {
        let (state, _dir) = app_state(Some(1));
        let token = state.issuer.token().to_string();
        state.admit(&token, None, Some("a"), remote()).unwrap();
        assert!(matches!(
            state.admit(&token, None, Some("b"), remote()),
            Err(Error::RegistryFull(1))
        ));
        // A known device may reconnect
        state.admit(&token, None, Some("a"), remote()).unwrap();
        assert_eq!(state.registry.len(), 1);
    }

    #[test]
    fn test_set_mode_persists() {
        let (state, _dir) = app_state(None);
        state.set_mode(ExposureMode::Tailscale);
        assert_eq!(state.exposure().mode(), ExposureMode::Tailscale);
        assert_eq!(state.settings.get().exposure_mode, ExposureMode::Tailscale);
    }
}
