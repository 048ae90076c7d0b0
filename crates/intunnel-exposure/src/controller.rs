//! Exposure controller
//!
//! Owns the single process-wide [`ExposureState`] and drives the provider for
//! the selected mode.
//!
//! Two locks are involved. `transition` serializes whole operations
//! (`set_mode`, `start`, `stop`) including the provider calls they make, so
//! at most one transition is in flight. `inner` guards the state itself and
//! is only held for short, non-blocking updates; provider callbacks take only
//! this one, which lets a provider report synchronously from inside `start`.
//! Every attempt gets a number, and outcomes carrying an old number are dropped.

use crate::error::ProviderError;
use crate::provider::{Outcome, OutcomeSink, ProviderSet, Reporter, TunnelProvider};
use intunnel_core::{
    ExposureMode, ExposureState, ExposureStatus, ListenerHandle, Notifier, RestartPolicy,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Drives tunnel providers through the STOPPED/STARTING/RUNNING/ERROR machine
#[derive(Clone)]
pub struct ExposureController {
    shared: Arc<Shared>,
}

struct Shared {
    transition: Mutex<()>,
    inner: Mutex<Inner>,
    notifier: Notifier<ExposureState>,
    providers: ProviderSet,
    restart: RestartPolicy,
    this: Weak<Shared>,
}

struct Inner {
    state: ExposureState,
    attempt: u64,
    local_url: Option<String>,
    restarts: u32,
}

/// Why an attempt is being started
#[derive(Debug, Clone, Copy)]
enum Trigger {
    User,
    Restart { after: u64 },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExposureController {
    /// Create a controller in `LOCAL`/`STOPPED`
    pub fn new(providers: ProviderSet, restart: RestartPolicy) -> Self {
        let shared = Arc::new_cyclic(|this| Shared {
            transition: Mutex::new(()),
            inner: Mutex::new(Inner {
                state: ExposureState::default(),
                attempt: 0,
                local_url: None,
                restarts: 0,
            }),
            notifier: Notifier::new(ExposureState::default()),
            providers,
            restart,
            this: this.clone(),
        });
        Self { shared }
    }

    /// URL of the local server handed to providers on the next start
    pub fn set_local_url(&self, url: impl Into<String>) {
        lock(&self.shared.inner).local_url = Some(url.into());
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ExposureState {
        lock(&self.shared.inner).state.clone()
    }

    /// Selectable modes: `Local` plus every registered provider
    pub fn modes(&self) -> Vec<ExposureMode> {
        let mut modes = vec![ExposureMode::Local];
        modes.extend(self.shared.providers.modes());
        modes
    }

    /// Switch modes, stopping the running provider first. Never starts the new one.
    pub fn set_mode(&self, mode: ExposureMode) {
        self.shared.set_mode(mode);
    }

    /// Start the provider for the current mode
    ///
    /// Returns whether a new attempt was initiated. A no-op under `Local` and
    /// while an attempt is already starting or running.
    pub fn start(&self) -> bool {
        self.shared.start(Trigger::User)
    }

    /// Stop the current attempt, from any status
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Stop the current attempt and every registered provider
    pub fn shutdown(&self) {
        self.shared.stop();
        let _transition = lock(&self.shared.transition);
        for provider in self.shared.providers.iter() {
            stop_provider(provider.as_ref());
        }
        info!("Exposure controller shut down");
    }

    /// Call `listener` with the full state after every transition
    pub fn add_listener<F>(&self, listener: F) -> intunnel_core::Result<ListenerHandle>
    where
        F: Fn(ExposureState) + Send + 'static,
    {
        self.shared.notifier.add_listener(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.shared.notifier.remove_listener(handle);
    }

    pub fn subscribe(&self) -> watch::Receiver<ExposureState> {
        self.shared.notifier.subscribe()
    }
}

impl Shared {
    /// Store and broadcast `state`; callers hold `inner`
    fn set_state(&self, inner: &mut Inner, state: ExposureState) {
        if inner.state != state {
            inner.state = state.clone();
            self.notifier.publish(state);
        }
    }

    fn set_mode(&self, mode: ExposureMode) {
        let _transition = lock(&self.transition);

        let previous = {
            let mut inner = lock(&self.inner);
            let current = inner.state.mode();
            if current == mode {
                debug!("Exposure mode already {:?}", mode);
                return;
            }
            inner.attempt += 1;
            match inner.state.status() {
                ExposureStatus::Stopped => None,
                _ => self.providers.get(current),
            }
        };

        if let Some(provider) = previous {
            info!("Stopping {} before switching to {}", provider.mode(), mode);
            stop_provider(provider.as_ref());
        }

        let mut inner = lock(&self.inner);
        inner.restarts = 0;
        self.set_state(&mut inner, ExposureState::stopped(mode));
        info!("Exposure mode set to {}", mode);
    }

    fn start(&self, trigger: Trigger) -> bool {
        let _transition = lock(&self.transition);

        let (provider, mode, attempt, local_url) = {
            let mut inner = lock(&self.inner);
            let mode = inner.state.mode();
            let status = inner.state.status();

            if mode.is_local() {
                debug!("Start ignored: local mode has nothing to expose");
                return false;
            }
            match trigger {
                Trigger::User => {
                    if status.is_active() {
                        debug!("Start ignored: {} already {:?}", mode, status);
                        return false;
                    }
                    inner.restarts = 0;
                }
                Trigger::Restart { after } => {
                    if inner.attempt != after || status != ExposureStatus::Error {
                        debug!("Restart of attempt {} superseded", after);
                        return false;
                    }
                }
            }

            inner.attempt += 1;
            let Some(provider) = self.providers.get(mode) else {
                let error = ProviderError::Unavailable(format!("no provider registered for {}", mode));
                self.set_state(&mut inner, ExposureState::failed(mode, error.to_string()));
                return false;
            };
            let Some(local_url) = inner.local_url.clone() else {
                let error = ProviderError::Unavailable("local server is not running".to_string());
                self.set_state(&mut inner, ExposureState::failed(mode, error.to_string()));
                return false;
            };
            self.set_state(&mut inner, ExposureState::starting(mode));
            (provider, mode, inner.attempt, local_url)
        };

        info!("Starting {} exposure of {} (attempt {})", mode, local_url, attempt);
        let sink: Weak<dyn OutcomeSink> = self.this.clone();
        if let Err(e) = provider.start(&local_url, Reporter::new(attempt, sink)) {
            warn!("{} failed to start: {}", mode, e);
            let mut inner = lock(&self.inner);
            if inner.attempt == attempt {
                self.set_state(&mut inner, ExposureState::failed(mode, e.to_string()));
            }
        }
        true
    }

    fn stop(&self) {
        let _transition = lock(&self.transition);

        let provider = {
            let mut inner = lock(&self.inner);
            inner.attempt += 1;
            let mode = inner.state.mode();
            if mode.is_local() {
                None
            } else {
                self.providers.get(mode)
            }
        };

        if let Some(provider) = provider {
            stop_provider(provider.as_ref());
        }

        let mut inner = lock(&self.inner);
        let mode = inner.state.mode();
        if inner.state.status() != ExposureStatus::Stopped {
            info!("{} exposure stopped", mode);
        }
        self.set_state(&mut inner, ExposureState::stopped(mode));
    }

    fn schedule_restart(&self, after: u64) {
        let Some(shared) = self.this.upgrade() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!("Cannot schedule tunnel restart: no async runtime");
            return;
        };
        let backoff = self.restart.backoff;
        runtime.spawn(async move {
            tokio::time::sleep(backoff).await;
            if shared.start(Trigger::Restart { after }) {
                info!("Restarted tunnel after crash");
            }
        });
    }
}

impl OutcomeSink for Shared {
    fn apply(&self, attempt: u64, outcome: Outcome) {
        let mut inner = lock(&self.inner);
        if attempt != inner.attempt {
            debug!(
                "Discarding {:?} from superseded attempt {} (current {})",
                outcome, attempt, inner.attempt
            );
            return;
        }

        let mode = inner.state.mode();
        let status = inner.state.status();
        match outcome {
            Outcome::Ready(url) if status.is_active() => {
                info!("{} exposure running at {}", mode, url);
                self.set_state(&mut inner, ExposureState::running(mode, url));
            }
            Outcome::Failed(error) if status.is_active() => {
                warn!("{} exposure failed: {}", mode, error);
                let crashed = status == ExposureStatus::Running
                    && matches!(error, ProviderError::Crashed(_));
                self.set_state(&mut inner, ExposureState::failed(mode, error.to_string()));

                if crashed && inner.restarts < self.restart.max_attempts {
                    inner.restarts += 1;
                    info!(
                        "Restarting {} in {:?} ({}/{})",
                        mode, self.restart.backoff, inner.restarts, self.restart.max_attempts
                    );
                    drop(inner);
                    self.schedule_restart(attempt);
                }
            }
            outcome => debug!("Ignoring {:?} while {:?}", outcome, status),
        }
    }
}

/// Teardown is best effort: failures are logged and otherwise dropped
fn stop_provider(provider: &dyn TunnelProvider) {
    if let Err(e) = provider.stop() {
        warn!("Failed to stop {} provider: {}", provider.mode(), e);
    }
}
