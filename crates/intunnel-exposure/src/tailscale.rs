//! Tailscale funnel / serve
//!
//! Checks `tailscale status --json` for a logged-in node, then keeps
//! `tailscale funnel <port>` (or `serve`) running in the foreground. The public
//! URL is the node's MagicDNS name, so it is known before the process starts.

use crate::error::{ProviderError, ProviderResult};
use crate::process::{self, LineVerdict, Readiness, Supervision, TunnelSlot};
use crate::provider::{Reporter, TunnelProvider};
use intunnel_core::{ExposureMode, TailscaleConfig};
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info};
use url::Url;

/// Subset of `tailscale status --json` we rely on
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailscaleStatus {
    backend_state: String,
    #[serde(rename = "Self")]
    self_node: Option<SelfNode>,
}

#[derive(Debug, Deserialize)]
struct SelfNode {
    #[serde(rename = "DNSName", default)]
    dns_name: String,
}

/// Exposes the local server through Tailscale
pub struct TailscaleProvider {
    config: TailscaleConfig,
    slot: Arc<TunnelSlot>,
}

impl TailscaleProvider {
    pub fn new(config: TailscaleConfig) -> Self {
        Self {
            config,
            slot: Arc::new(TunnelSlot::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_active()
    }
}

impl TunnelProvider for TailscaleProvider {
    fn mode(&self) -> ExposureMode {
        ExposureMode::Tailscale
    }

    fn start(&self, local_url: &str, reporter: Reporter) -> ProviderResult<()> {
        let runtime = Handle::try_current()
            .map_err(|_| ProviderError::Unavailable("no async runtime".to_string()))?;
        let port = local_port(local_url).ok_or_else(|| {
            ProviderError::Unavailable(format!("cannot determine local port of {}", local_url))
        })?;

        let slot = self.slot.clone();
        let config = self.config.clone();

        self.slot.launch(|id, shutdown_rx| {
            info!("Starting tailscale exposure of port {} (tunnel {})", port, id);
            runtime.spawn(async move {
                run(config, port, shutdown_rx, reporter).await;
                slot.release(id);
            });
            Ok(())
        })
    }

    fn stop(&self) -> ProviderResult<()> {
        if self.slot.stop() {
            info!("Stopping tailscale exposure");
        }
        Ok(())
    }
}

async fn run(
    config: TailscaleConfig,
    port: u16,
    mut shutdown_rx: oneshot::Receiver<()>,
    reporter: Reporter,
) {
    let public_url = tokio::select! {
        _ = &mut shutdown_rx => {
            debug!("tailscale start cancelled during status check");
            return;
        }
        result = query_public_url(&config) => match result {
            Ok(url) => url,
            Err(e) => {
                reporter.failed(e);
                return;
            }
        }
    };

    let subcommand = if config.funnel { "funnel" } else { "serve" };
    let port_arg = port.to_string();
    let mut command = Command::new(&config.binary);
    command.args([subcommand, port_arg.as_str()]);
    let mut child = match process::spawn(&mut command, "tailscale") {
        Ok(child) => child,
        Err(e) => {
            reporter.failed(e);
            return;
        }
    };
    let lines = process::output_lines(&mut child);

    process::supervise(Supervision {
        name: "tailscale",
        child,
        lines,
        shutdown_rx,
        reporter,
        readiness: Readiness::AfterSettle {
            delay: config.settle_delay,
            public_url,
        },
        classify: classify_line,
    })
    .await;
}

/// Ask the local tailscaled for this node's public URL
async fn query_public_url(config: &TailscaleConfig) -> ProviderResult<String> {
    let output = Command::new(&config.binary)
        .args(["status", "--json"])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ProviderError::Unavailable("tailscale not found in PATH".to_string())
            }
            _ => ProviderError::Unavailable(format!("failed to run tailscale status: {}", e)),
        })?;

    // `status --json` prints the document even when logged out, with a non-zero exit
    if output.stdout.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not logged in") || stderr.contains("NeedsLogin") {
            return Err(ProviderError::AuthRequired(
                "tailscale is not logged in; run `tailscale up`".to_string(),
            ));
        }
        return Err(ProviderError::Unavailable(format!(
            "tailscale status failed: {}",
            stderr.trim()
        )));
    }

    public_url_from_status(&output.stdout)
}

fn public_url_from_status(json: &[u8]) -> ProviderResult<String> {
    let status: TailscaleStatus = serde_json::from_slice(json).map_err(|e| {
        ProviderError::Unavailable(format!("unreadable tailscale status: {}", e))
    })?;

    match status.backend_state.as_str() {
        "Running" => {}
        "NeedsLogin" | "NeedsMachineAuth" => {
            return Err(ProviderError::AuthRequired(format!(
                "tailscale is in state {}; run `tailscale up`",
                status.backend_state
            )))
        }
        other => {
            return Err(ProviderError::Unavailable(format!(
                "tailscale is not running (state {})",
                other
            )))
        }
    }

    let dns_name = status
        .self_node
        .map(|node| node.dns_name.trim_end_matches('.').to_string())
        .unwrap_or_default();
    if dns_name.is_empty() {
        return Err(ProviderError::AuthRequired(
            "MagicDNS name unavailable; enable MagicDNS and HTTPS for the tailnet".to_string(),
        ));
    }
    Ok(format!("https://{}", dns_name))
}

fn classify_line(line: &str) -> LineVerdict {
    let lower = line.to_lowercase();
    if lower.contains("not enabled") || lower.contains("login.tailscale.com") {
        return LineVerdict::AuthRequired(format!("tailscale: {}", line.trim()));
    }
    LineVerdict::Ignore
}

/// Port of an `http://host:port/...` URL
fn local_port(local_url: &str) -> Option<u16> {
    Url::parse(local_url).ok()?.port_or_known_default()
}
