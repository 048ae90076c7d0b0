//! Cloudflare quick tunnels
//!
//! Runs `cloudflared tunnel --url <local>` and waits for the randomly assigned
//! `*.trycloudflare.com` hostname to show up in its log output.

use crate::error::{ProviderError, ProviderResult};
use crate::process::{self, LineVerdict, Readiness, Supervision, TunnelSlot};
use crate::provider::{Reporter, TunnelProvider};
use intunnel_core::{CloudflareConfig, ExposureMode};
use std::sync::Arc;
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::info;

const QUICK_TUNNEL_SUFFIX: &str = ".trycloudflare.com";

/// Exposes the local server through a Cloudflare quick tunnel
pub struct CloudflareProvider {
    config: CloudflareConfig,
    slot: Arc<TunnelSlot>,
}

impl CloudflareProvider {
    pub fn new(config: CloudflareConfig) -> Self {
        Self {
            config,
            slot: Arc::new(TunnelSlot::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_active()
    }
}

impl TunnelProvider for CloudflareProvider {
    fn mode(&self) -> ExposureMode {
        ExposureMode::Cloudflare
    }

    fn start(&self, local_url: &str, reporter: Reporter) -> ProviderResult<()> {
        let runtime = Handle::try_current()
            .map_err(|_| ProviderError::Unavailable("no async runtime".to_string()))?;

        let slot = self.slot.clone();
        let timeout = self.config.startup_timeout;
        let mut command = Command::new(&self.config.binary);
        command.args(["tunnel", "--no-autoupdate", "--url", local_url]);

        self.slot.launch(|id, shutdown_rx| {
            let mut child = process::spawn(&mut command, "cloudflared")?;
            let lines = process::output_lines(&mut child);
            info!("Started cloudflared for {} (tunnel {})", local_url, id);

            runtime.spawn(async move {
                process::supervise(Supervision {
                    name: "cloudflared",
                    child,
                    lines,
                    shutdown_rx,
                    reporter,
                    readiness: Readiness::FromOutput { timeout },
                    classify: classify_line,
                })
                .await;
                slot.release(id);
            });
            Ok(())
        })
    }

    fn stop(&self) -> ProviderResult<()> {
        if self.slot.stop() {
            info!("Stopping cloudflared");
        }
        Ok(())
    }
}

fn classify_line(line: &str) -> LineVerdict {
    if let Some(url) = find_quick_tunnel_url(line) {
        return LineVerdict::Ready(url);
    }
    if line.contains("cloudflared tunnel login") || line.contains("origin certificate") {
        return LineVerdict::AuthRequired(
            "cloudflared needs an origin certificate; run `cloudflared tunnel login`".to_string(),
        );
    }
    LineVerdict::Ignore
}

/// Extract `https://<name>.trycloudflare.com` from a log line
fn find_quick_tunnel_url(line: &str) -> Option<String> {
    line.match_indices("https://").find_map(|(start, _)| {
        let rest = &line[start + "https://".len()..];
        let host_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '.'))
            .unwrap_or(rest.len());
        let host = &rest[..host_len];
        let name = host.strip_suffix(QUICK_TUNNEL_SUFFIX)?;
        // The bare api.trycloudflare.com endpoint also appears in logs
        if name.is_empty() || name == "api" {
            return None;
        }
        Some(format!("https://{}", host))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::channel_reporter;
    use crate::provider::Outcome;
    use std::path::Path;
    use std::time::Duration;

    #[test]
    fn test_finds_url_in_banner() {
        let line = "2024-05-01T10:00:00Z INF |  https://quiet-river-bright-fox.trycloudflare.com                                |";
        assert_eq!(
            find_quick_tunnel_url(line),
            Some("https://quiet-river-bright-fox.trycloudflare.com".to_string())
        );
    }

    #[test]
    fn test_ignores_unrelated_urls() {
        assert_eq!(
            find_quick_tunnel_url("INF Requesting new quick Tunnel on https://api.trycloudflare.com..."),
            None
        );
        assert_eq!(
            find_quick_tunnel_url("INF See https://developers.cloudflare.com/ for docs"),
            None
        );
        assert_eq!(find_quick_tunnel_url("no url here"), None);
    }

    #[test]
    fn test_classify_login_prompt() {
        assert!(matches!(
            classify_line("ERR Cannot determine default origin certificate path."),
            LineVerdict::AuthRequired(_)
        ));
        assert_eq!(classify_line("INF Version 2024.4.1"), LineVerdict::Ignore);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_synchronously() {
        let provider = CloudflareProvider::new(CloudflareConfig {
            binary: "/nonexistent/cloudflared".into(),
            ..CloudflareConfig::default()
        });
        let (reporter, _sink, _rx) = channel_reporter(1);
        let err = provider.start("http://127.0.0.1:8765", reporter).unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
        assert!(!provider.is_running());
        // Stopping something that never started is fine
        provider.stop().unwrap();
    }

    #[cfg(unix)]
    fn fake_cloudflared(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("cloudflared");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reports_url_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(
            dir.path(),
            "echo 'INF |  https://unit-test-tunnel.trycloudflare.com  |' >&2\nexec sleep 30",
        );
        let provider = CloudflareProvider::new(CloudflareConfig {
            binary,
            startup_timeout: Duration::from_secs(10),
        });
        let (reporter, _sink, mut rx) = channel_reporter(3);
        provider.start("http://127.0.0.1:8765", reporter).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome,
            (3, Outcome::Ready("https://unit-test-tunnel.trycloudflare.com".into()))
        );

        provider.stop().unwrap();
        provider.stop().unwrap();
        // No failure is reported for a requested shutdown
        let after = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(!matches!(after, Ok(Some(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_after_ready_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(
            dir.path(),
            "echo 'INF |  https://short-lived.trycloudflare.com  |' >&2\nsleep 1\nexit 1",
        );
        let provider = CloudflareProvider::new(CloudflareConfig {
            binary,
            startup_timeout: Duration::from_secs(10),
        });
        let (reporter, _sink, mut rx) = channel_reporter(1);
        provider.start("http://127.0.0.1:8765", reporter).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first.1, Outcome::Ready(_)));

        let second = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second.1, Outcome::Failed(ProviderError::Crashed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_certificate_notice_after_ready_keeps_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(
            dir.path(),
            "echo 'INF |  https://stays-up.trycloudflare.com  |' >&2\n\
             sleep 1\n\
             echo 'INF Cannot determine default origin certificate path. No file cert.pem' >&2\n\
             exec sleep 30",
        );
        let provider = CloudflareProvider::new(CloudflareConfig {
            binary,
            startup_timeout: Duration::from_secs(10),
        });
        let (reporter, _sink, mut rx) = channel_reporter(1);
        provider.start("http://127.0.0.1:8765", reporter).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            (1, Outcome::Ready("https://stays-up.trycloudflare.com".into()))
        );

        // The notice arrives about a second later and must not end the tunnel
        let after = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(after.is_err(), "unexpected outcome: {:?}", after);
        assert!(provider.is_running());
        provider.stop().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_login_prompt_before_ready_requires_auth() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(
            dir.path(),
            "echo 'ERR Cannot determine default origin certificate path.' >&2\nexec sleep 30",
        );
        let provider = CloudflareProvider::new(CloudflareConfig {
            binary,
            startup_timeout: Duration::from_secs(10),
        });
        let (reporter, _sink, mut rx) = channel_reporter(1);
        provider.start("http://127.0.0.1:8765", reporter).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome.1,
            Outcome::Failed(ProviderError::AuthRequired(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_no_url_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(dir.path(), "exec sleep 30");
        let provider = CloudflareProvider::new(CloudflareConfig {
            binary,
            startup_timeout: Duration::from_millis(300),
        });
        let (reporter, _sink, mut rx) = channel_reporter(1);
        provider.start("http://127.0.0.1:8765", reporter).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome.1,
            Outcome::Failed(ProviderError::Unavailable(_))
        ));
    }
}
