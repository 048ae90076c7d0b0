//! intunnel Exposure
//!
//! Makes the local server reachable from outside the local network:
//!
//! - **Cloudflare**: runs a `cloudflared` quick tunnel and picks up the
//!   randomly assigned `*.trycloudflare.com` URL from its output.
//!
//! - **Tailscale**: serves the local port on the node's MagicDNS name with
//!   `tailscale funnel` (public) or `tailscale serve` (tailnet only).
//!
//! [`ExposureController`] owns the single exposure state and decides which
//! provider runs. Providers never touch that state; they report back through
//! a [`Reporter`] scoped to one attempt.

pub mod cloudflare;
pub mod controller;
mod error;
mod process;
pub mod provider;
pub mod tailscale;

pub use cloudflare::CloudflareProvider;
pub use controller::ExposureController;
pub use error::{ProviderError, ProviderResult};
pub use provider::{Outcome, ProviderSet, Reporter, TunnelProvider};
pub use tailscale::TailscaleProvider;
