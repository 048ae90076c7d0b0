//! Tunnel provider capability and the mode -> provider mapping
//!
//! A provider starts an external tunnel asynchronously and reports the outcome
//! through a [`Reporter`]. Adding a provider means implementing
//! [`TunnelProvider`] and inserting it into a [`ProviderSet`].

use crate::cloudflare::CloudflareProvider;
use crate::error::{ProviderError, ProviderResult};
use crate::tailscale::TailscaleProvider;
use intunnel_core::{Config, ExposureMode};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Result of a tunnel attempt, as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The tunnel is reachable at this public URL
    Ready(String),
    /// The attempt failed, or a running tunnel died
    Failed(ProviderError),
}

/// Receives outcomes tagged with the attempt they belong to
pub(crate) trait OutcomeSink: Send + Sync {
    fn apply(&self, attempt: u64, outcome: Outcome);
}

/// Callback handle given to a provider for one tunnel attempt
///
/// Cheap to clone. Reports from an attempt that has since been stopped or
/// replaced are discarded by the receiving side.
#[derive(Clone)]
pub struct Reporter {
    attempt: u64,
    sink: Weak<dyn OutcomeSink>,
}

impl Reporter {
    pub(crate) fn new(attempt: u64, sink: Weak<dyn OutcomeSink>) -> Self {
        Self { attempt, sink }
    }

    /// Report the public URL of the tunnel
    pub fn ready(&self, public_url: impl Into<String>) {
        self.send(Outcome::Ready(public_url.into()));
    }

    /// Report a startup failure or the death of a running tunnel
    pub fn failed(&self, error: ProviderError) {
        self.send(Outcome::Failed(error));
    }

    fn send(&self, outcome: Outcome) {
        match self.sink.upgrade() {
            Some(sink) => sink.apply(self.attempt, outcome),
            None => debug!("Dropping outcome for attempt {}: controller gone", self.attempt),
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// One way of exposing the local server beyond the local network
pub trait TunnelProvider: Send + Sync {
    /// The exposure mode this provider implements
    fn mode(&self) -> ExposureMode;

    /// Begin exposing `local_url`
    ///
    /// Must return without waiting for the tunnel; the outcome arrives later
    /// through `reporter`. An `Err` means the attempt could not even begin.
    fn start(&self, local_url: &str, reporter: Reporter) -> ProviderResult<()>;

    /// Tear down the tunnel, if any
    ///
    /// Idempotent, and safe to call while `start`'s background work is still running.
    fn stop(&self) -> ProviderResult<()>;
}

/// Registered providers keyed by exposure mode
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: HashMap<ExposureMode, Arc<dyn TunnelProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in Cloudflare and Tailscale providers
    pub fn from_config(config: &Config) -> Self {
        let mut set = Self::new();
        set.insert(Arc::new(CloudflareProvider::new(config.cloudflare.clone())));
        set.insert(Arc::new(TailscaleProvider::new(config.tailscale.clone())));
        set
    }

    /// Register a provider, replacing any existing one for the same mode
    pub fn insert(&mut self, provider: Arc<dyn TunnelProvider>) {
        self.providers.insert(provider.mode(), provider);
    }

    pub fn get(&self, mode: ExposureMode) -> Option<Arc<dyn TunnelProvider>> {
        self.providers.get(&mode).cloned()
    }

    pub fn modes(&self) -> Vec<ExposureMode> {
        let mut modes: Vec<ExposureMode> = self.providers.keys().copied().collect();
        modes.sort_by_key(|m| ExposureMode::ALL.iter().position(|x| x == m));
        modes
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TunnelProvider>> {
        self.providers.values()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Reporter wired to a channel, for exercising providers directly

    use super::*;
    use tokio::sync::mpsc;

    pub struct ChannelSink(mpsc::UnboundedSender<(u64, Outcome)>);

    impl OutcomeSink for ChannelSink {
        fn apply(&self, attempt: u64, outcome: Outcome) {
            let _ = self.0.send((attempt, outcome));
        }
    }

    /// The sink must be kept alive for the reporter to deliver
    pub fn channel_reporter(
        attempt: u64,
    ) -> (
        Reporter,
        Arc<ChannelSink>,
        mpsc::UnboundedReceiver<(u64, Outcome)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink(tx));
        let weak = Arc::downgrade(&sink);
        let weak: Weak<dyn OutcomeSink> = weak;
        (Reporter::new(attempt, weak), sink, rx)
    }
}
