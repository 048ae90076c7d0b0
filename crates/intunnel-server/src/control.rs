//! Control plane facade
//!
//! One `ControlPlane` per process wires the token issuer, device registry,
//! exposure controller and local HTTP server together. Construct it once and
//! hand it to whatever drives the host lifecycle.

use intunnel_auth::{Device, DeviceId, DeviceRegistry, TokenIssuer};
use intunnel_core::{
    Config, ConnectionDescriptor, Error, ExposureMode, ExposureState, ListenerHandle, Result,
    SettingsStore,
};
use intunnel_exposure::{ExposureController, ProviderSet};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http::{create_router, ServerInfo};
use crate::state::{self, AppState};

/// How long `shutdown` waits for open connections to drain
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Where the local server is listening
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalServer {
    /// URL advertised to clients on the local network
    pub url: String,
    /// Socket address actually bound
    pub addr: SocketAddr,
}

/// Handle to stop a running server
struct ServerHandle {
    local: LocalServer,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Process-wide coordinator for pairing and exposure
pub struct ControlPlane {
    config: Config,
    registry: Arc<DeviceRegistry>,
    controller: ExposureController,
    settings: Arc<SettingsStore>,
    server: Mutex<Option<ServerHandle>>,
    state: RwLock<Option<Arc<AppState>>>,
}

impl ControlPlane {
    /// Build the control plane with the built-in tunnel providers
    ///
    /// Opens the settings store and restores the last selected exposure mode.
    /// Nothing is started.
    pub fn new(config: Config) -> Result<Self> {
        let settings = match &config.settings_path {
            Some(path) => SettingsStore::with_path(path.clone())?,
            None => SettingsStore::new()?,
        };
        let providers = ProviderSet::from_config(&config);
        Ok(Self::with_providers(config, providers, settings))
    }

    /// Build the control plane with an explicit provider set
    pub fn with_providers(config: Config, providers: ProviderSet, settings: SettingsStore) -> Self {
        let controller = ExposureController::new(providers, config.restart);
        let saved = settings.get().exposure_mode;
        if !saved.is_local() {
            info!("Restoring exposure mode: {}", saved.display_name());
        }
        controller.set_mode(saved);

        Self {
            registry: Arc::new(DeviceRegistry::new(config.max_devices)),
            controller,
            settings: Arc::new(settings),
            config,
            server: Mutex::new(None),
            state: RwLock::new(None),
        }
    }

    /// Start the local server unless it already runs
    ///
    /// The first call issues the pairing token and binds the port; later calls
    /// return the same server.
    pub async fn ensure_started(&self) -> Result<LocalServer> {
        let mut server = self.server.lock().await;
        if let Some(handle) = server.as_ref() {
            debug!("Server already running at {}", handle.local.url);
            return Ok(handle.local.clone());
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(|e| Error::Server(format!("cannot bind port {}: {}", self.config.port, e)))?;
        let addr = listener.local_addr()?;
        let host = self
            .config
            .host
            .clone()
            .or_else(get_local_ip)
            .unwrap_or_else(|| "localhost".to_string());
        let url = format!("http://{}:{}", host, addr.port());

        let issuer = TokenIssuer::new();
        info!("Pairing token fingerprint: {}", issuer.fingerprint());
        self.controller.set_local_url(url.clone());

        let app_state = Arc::new(AppState::new(
            self.config.clone(),
            issuer,
            self.registry.clone(),
            self.controller.clone(),
            self.settings.clone(),
            url.clone(),
        ));
        let router = create_router(app_state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
            if let Err(e) = result {
                warn!("Server error: {}", e);
            }
            info!("Server stopped");
        });

        info!("Server listening on {} ({})", addr, url);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(app_state);

        let local = LocalServer { url, addr };
        *server = Some(ServerHandle {
            local: local.clone(),
            shutdown_tx,
            task,
        });
        Ok(local)
    }

    /// Stop every tunnel, forget all devices and release the local server
    pub async fn shutdown(&self) {
        info!("Shutting down control plane...");
        self.controller.shutdown();
        self.registry.clear();
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(handle) = self.server.lock().await.take() else {
            return;
        };
        let _ = handle.shutdown_tx.send(());
        let abort = handle.task.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, handle.task).await.is_err() {
            warn!("Server did not drain within {:?}, aborting", SHUTDOWN_GRACE);
            abort.abort();
        }
    }

    fn app_state(&self) -> Option<Arc<AppState>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Server details, once started
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.app_state().map(|state| ServerInfo::collect(&state))
    }

    pub fn exposure_state(&self) -> ExposureState {
        self.controller.state()
    }

    /// Connected devices, oldest connection first
    pub fn devices(&self) -> Vec<Device> {
        self.registry.list()
    }

    /// What a client needs to connect right now, once started
    pub fn descriptor(&self) -> Option<ConnectionDescriptor> {
        self.app_state().map(|state| state.descriptor())
    }

    /// Select an exposure mode and remember it; never starts the tunnel
    pub fn set_mode(&self, mode: ExposureMode) {
        state::select_mode(&self.controller, &self.settings, mode);
    }

    /// Start exposure in the current mode; see [`ExposureController::start`]
    pub fn start_exposure(&self) -> bool {
        self.controller.start()
    }

    pub fn stop_exposure(&self) {
        self.controller.stop();
    }

    /// Verify a connecting client and register it
    pub fn admit(
        &self,
        token: &str,
        name: Option<&str>,
        device_id: Option<&str>,
        remote: SocketAddr,
    ) -> Result<Device> {
        let state = self.app_state().ok_or(Error::NotStarted)?;
        state.admit(token, name, device_id, remote)
    }

    /// Drop a device; its socket is closed by the server
    pub fn disconnect(&self, id: &DeviceId) -> bool {
        self.registry.unregister(id)
    }

    pub fn force_classic_terminal(&self) -> bool {
        self.settings.get().force_classic_terminal
    }

    pub fn set_force_classic_terminal(&self, enabled: bool) -> Result<()> {
        self.settings.set_force_classic_terminal(enabled)
    }

    /// Modes a user can pick from
    pub fn available_modes(&self) -> Vec<ExposureMode> {
        self.controller.modes()
    }

    pub fn add_exposure_listener<F>(&self, listener: F) -> Result<ListenerHandle>
    where
        F: Fn(ExposureState) + Send + 'static,
    {
        self.controller.add_listener(listener)
    }

    pub fn add_device_listener<F>(&self, listener: F) -> Result<ListenerHandle>
    where
        F: Fn(Vec<Device>) + Send + 'static,
    {
        self.registry.add_listener(listener)
    }
}

/// Get the local IP address
fn get_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    Some(addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use intunnel_core::{ExposureStatus, RestartPolicy};
    use intunnel_exposure::{ProviderResult, Reporter, TunnelProvider};
    use tempfile::TempDir;

    /// Reports a public URL as soon as it is started
    struct InstantProvider;

    impl TunnelProvider for InstantProvider {
        fn mode(&self) -> ExposureMode {
            ExposureMode::Cloudflare
        }

        fn start(&self, _local_url: &str, reporter: Reporter) -> ProviderResult<()> {
            reporter.ready("https://demo.trycloudflare.com");
            Ok(())
        }

        fn stop(&self) -> ProviderResult<()> {
            Ok(())
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        Config::default()
            .with_port(0)
            .with_host(Some("127.0.0.1".to_string()))
            .with_restart(RestartPolicy::default())
            .with_settings_path(dir.path().join("settings.json"))
    }

    fn plane(dir: &TempDir) -> ControlPlane {
        let mut providers = ProviderSet::new();
        providers.insert(Arc::new(InstantProvider));
        let settings = SettingsStore::with_path(dir.path().join("settings.json")).unwrap();
        ControlPlane::with_providers(test_config(dir), providers, settings)
    }

    fn remote() -> SocketAddr {
        "192.168.1.40:51234".parse().unwrap()
    }

    #[tokio::test]
    async fn test_ensure_started_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(&dir);

        let first = plane.ensure_started().await.unwrap();
        let token = plane.descriptor().unwrap().token;
        let second = plane.ensure_started().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(plane.descriptor().unwrap().token, token);
        assert_ne!(first.addr.port(), 0);
        assert_eq!(first.url, format!("http://127.0.0.1:{}", first.addr.port()));

        let info = plane.server_info().unwrap();
        assert_eq!(info.local_url, first.url);
        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_nothing_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(&dir);
        assert!(plane.descriptor().is_none());
        assert!(plane.server_info().is_none());
        assert!(matches!(
            plane.admit("token", None, None, remote()),
            Err(Error::NotStarted)
        ));
        // Shutting down an idle plane is harmless
        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_descriptor_follows_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(&dir);
        let local = plane.ensure_started().await.unwrap();
        assert_eq!(plane.descriptor().unwrap().base_url, local.url);

        plane.set_mode(ExposureMode::Cloudflare);
        assert!(plane.start_exposure());
        assert_eq!(plane.exposure_state().status(), ExposureStatus::Running);
        assert_eq!(
            plane.descriptor().unwrap().base_url,
            "https://demo.trycloudflare.com"
        );

        plane.stop_exposure();
        assert_eq!(plane.descriptor().unwrap().base_url, local.url);
        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_admit_and_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(&dir);
        plane.ensure_started().await.unwrap();
        let token = plane.descriptor().unwrap().token;

        assert!(matches!(
            plane.admit("wrong", Some("Pixel"), None, remote()),
            Err(Error::AuthenticationFailed)
        ));
        let device = plane
            .admit(&token, Some("Pixel"), Some("phone-1"), remote())
            .unwrap();
        assert_eq!(plane.devices(), vec![device.clone()]);

        assert!(plane.disconnect(&device.id));
        assert!(!plane.disconnect(&device.id));
        assert!(plane.devices().is_empty());
        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(&dir);
        let local = plane.ensure_started().await.unwrap();
        let token = plane.descriptor().unwrap().token;
        plane.admit(&token, None, None, remote()).unwrap();
        plane.set_mode(ExposureMode::Cloudflare);
        plane.start_exposure();

        plane.shutdown().await;
        assert!(plane.devices().is_empty());
        assert_eq!(
            plane.exposure_state(),
            ExposureState::stopped(ExposureMode::Cloudflare)
        );
        assert!(plane.descriptor().is_none());
        assert!(tokio::net::TcpStream::connect(local.addr).await.is_err());

        // A new server lifetime gets a new token
        plane.ensure_started().await.unwrap();
        assert_ne!(plane.descriptor().unwrap().token, token);
        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_mode_restored_without_starting() {
        let dir = tempfile::tempdir().unwrap();
        {
            let plane = plane(&dir);
            plane.set_mode(ExposureMode::Cloudflare);
        }

        let plane = plane(&dir);
        assert_eq!(
            plane.exposure_state(),
            ExposureState::stopped(ExposureMode::Cloudflare)
        );
    }

    #[tokio::test]
    async fn test_force_classic_terminal_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let plane = plane(&dir);
            assert!(!plane.force_classic_terminal());
            plane.set_force_classic_terminal(true).unwrap();
        }
        assert!(plane(&dir).force_classic_terminal());
    }

    #[tokio::test]
    async fn test_listeners_see_changes() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(&dir);
        plane.ensure_started().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _exposure = plane
            .add_exposure_listener(move |state: ExposureState| {
                let _ = tx.send(state.mode());
            })
            .unwrap();
        let (dev_tx, mut dev_rx) = tokio::sync::mpsc::unbounded_channel();
        let _devices = plane
            .add_device_listener(move |devices: Vec<Device>| {
                let _ = dev_tx.send(devices.len());
            })
            .unwrap();

        plane.set_mode(ExposureMode::Cloudflare);
        assert_eq!(rx.recv().await, Some(ExposureMode::Cloudflare));

        let token = plane.descriptor().unwrap().token;
        plane.admit(&token, None, None, remote()).unwrap();
        assert_eq!(dev_rx.recv().await, Some(1));
        plane.shutdown().await;
    }

    #[test]
    fn test_available_modes() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            plane(&dir).available_modes(),
            vec![ExposureMode::Local, ExposureMode::Cloudflare]
        );
    }
}
