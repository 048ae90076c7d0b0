//! Exposure mode and state model
//!
//! `ExposureState` can only be built through its constructors, which keep
//! `public_url` present exactly when running and `error` present exactly
//! when failed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the local server is reachable from outside the local network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    /// No external exposure
    #[default]
    Local,
    /// Cloudflare quick tunnel via `cloudflared`
    Cloudflare,
    /// Tailscale funnel/serve
    Tailscale,
}

impl ExposureMode {
    pub const ALL: [ExposureMode; 3] = [
        ExposureMode::Local,
        ExposureMode::Cloudflare,
        ExposureMode::Tailscale,
    ];

    /// Human-readable name for status lines and pickers
    pub fn display_name(&self) -> &'static str {
        match self {
            ExposureMode::Local => "Local network",
            ExposureMode::Cloudflare => "Cloudflare Tunnel",
            ExposureMode::Tailscale => "Tailscale",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ExposureMode::Local)
    }
}

impl fmt::Display for ExposureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl std::str::FromStr for ExposureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "lan" | "none" => Ok(ExposureMode::Local),
            "cloudflare" | "cloudflared" => Ok(ExposureMode::Cloudflare),
            "tailscale" | "funnel" => Ok(ExposureMode::Tailscale),
            _ => Err(format!(
                "Invalid exposure mode: {}. Use: local, cloudflare, tailscale",
                s
            )),
        }
    }
}

/// Lifecycle status of the active exposure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl ExposureStatus {
    /// Whether a tunnel attempt is currently alive
    pub fn is_active(&self) -> bool {
        matches!(self, ExposureStatus::Starting | ExposureStatus::Running)
    }
}

/// Snapshot of the process-wide exposure state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureState {
    mode: ExposureMode,
    status: ExposureStatus,
    public_url: Option<String>,
    error: Option<String>,
}

impl ExposureState {
    pub fn stopped(mode: ExposureMode) -> Self {
        Self {
            mode,
            status: ExposureStatus::Stopped,
            public_url: None,
            error: None,
        }
    }

    pub fn starting(mode: ExposureMode) -> Self {
        Self {
            status: ExposureStatus::Starting,
            ..Self::stopped(mode)
        }
    }

    pub fn running(mode: ExposureMode, public_url: impl Into<String>) -> Self {
        Self {
            status: ExposureStatus::Running,
            public_url: Some(public_url.into()),
            ..Self::stopped(mode)
        }
    }

    pub fn failed(mode: ExposureMode, error: impl Into<String>) -> Self {
        Self {
            status: ExposureStatus::Error,
            error: Some(error.into()),
            ..Self::stopped(mode)
        }
    }

    pub fn mode(&self) -> ExposureMode {
        self.mode
    }

    pub fn status(&self) -> ExposureStatus {
        self.status
    }

    pub fn public_url(&self) -> Option<&str> {
        self.public_url.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// One-line status text for the presentation layer
    pub fn status_line(&self) -> String {
        if self.mode.is_local() {
            return "Local network only".to_string();
        }
        let label = self.mode.display_name();
        match self.status {
            ExposureStatus::Starting => format!("{} starting...", label),
            ExposureStatus::Running => format!("{} running", label),
            ExposureStatus::Error => {
                format!("{} error: {}", label, self.error.as_deref().unwrap_or("unknown"))
            }
            ExposureStatus::Stopped => format!("{} stopped", label),
        }
    }
}
