//! intunnel - Pair mobile devices with a local terminal relay
//!
//! Starts the pairing server, prints the connection QR code, and optionally
//! exposes the server beyond the local network through Cloudflare or Tailscale.

use anyhow::Result;
use clap::Parser;
use intunnel_auth::Device;
use intunnel_core::{
    CloudflareConfig, Config, ExposureMode, ExposureState, ExposureStatus, RestartPolicy,
    TailscaleConfig,
};
use intunnel_server::{render_terminal, ControlPlane};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// intunnel - Connect your phone to this machine's terminal
#[derive(Parser, Debug)]
#[command(name = "intunnel")]
#[command(version, about, long_about = None)]
struct Args {
    /// Server port (0 picks a free port)
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// Host advertised to devices (auto-detected by default)
    #[arg(long)]
    host: Option<String>,

    /// Exposure mode to select: local, cloudflare or tailscale
    /// Defaults to the mode selected last time
    #[arg(short, long)]
    mode: Option<ExposureMode>,

    /// Start exposure right after startup
    #[arg(long)]
    start: bool,

    /// Maximum number of simultaneously connected devices
    #[arg(long)]
    max_devices: Option<usize>,

    /// Path to the cloudflared binary
    #[arg(long, default_value = "cloudflared")]
    cloudflared: PathBuf,

    /// Path to the tailscale binary
    #[arg(long, default_value = "tailscale")]
    tailscale: PathBuf,

    /// Use `tailscale serve` (tailnet only) instead of a public funnel
    #[arg(long)]
    no_funnel: bool,

    /// Automatic restarts after a running tunnel crashes
    #[arg(long, default_value = "0")]
    restart_attempts: u32,

    /// Seconds to wait before each automatic restart
    #[arg(long, default_value = "5")]
    restart_backoff_secs: u64,

    /// Do not print QR codes
    #[arg(long)]
    no_qr: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> Config {
        Config::new()
            .with_port(self.port)
            .with_host(self.host.clone())
            .with_max_devices(self.max_devices)
            .with_cloudflare(CloudflareConfig {
                binary: self.cloudflared.clone(),
                ..CloudflareConfig::default()
            })
            .with_tailscale(TailscaleConfig {
                binary: self.tailscale.clone(),
                funnel: !self.no_funnel,
                ..TailscaleConfig::default()
            })
            .with_restart(RestartPolicy {
                max_attempts: self.restart_attempts,
                backoff: Duration::from_secs(self.restart_backoff_secs),
            })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("intunnel v{}", env!("CARGO_PKG_VERSION"));

    let plane = Arc::new(ControlPlane::new(args.config())?);
    if let Some(mode) = args.mode {
        plane.set_mode(mode);
    }

    let local = plane.ensure_started().await?;
    info!("");
    info!("  Server:   {}", local.url);
    info!("  Exposure: {}", plane.exposure_state().status_line());
    info!("");
    print_descriptor(&plane, args.no_qr);

    // Re-print the QR code whenever the address devices should use changes
    let printer = plane.clone();
    let no_qr = args.no_qr;
    let last_public_url = Mutex::new(None::<String>);
    let _exposure_listener = plane.add_exposure_listener(move |state: ExposureState| {
        match state.status() {
            ExposureStatus::Error => warn!("Exposure: {}", state.status_line()),
            _ => info!("Exposure: {}", state.status_line()),
        }
        let public_url = state.public_url().map(str::to_string);
        let mut last = last_public_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *last != public_url {
            *last = public_url;
            print_descriptor(&printer, no_qr);
        }
    })?;

    let _device_listener = plane.add_device_listener(|devices: Vec<Device>| {
        let names: Vec<&str> = devices.iter().map(|d| d.display_name.as_str()).collect();
        info!("{} device(s) connected: {}", devices.len(), names.join(", "));
    })?;

    if args.start && !plane.start_exposure() {
        warn!(
            "Exposure not started: {}",
            plane.exposure_state().status_line()
        );
    }

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.ok();

    info!("Shutting down...");
    plane.shutdown().await;
    Ok(())
}

/// Print the current connection descriptor, as a QR code unless disabled
fn print_descriptor(plane: &ControlPlane, no_qr: bool) {
    let Some(descriptor) = plane.descriptor() else {
        return;
    };

    println!();
    if !no_qr {
        match render_terminal(&descriptor.payload()) {
            Ok(code) => {
                for line in code.lines() {
                    println!("  {}", line);
                }
            }
            Err(e) => warn!("Failed to generate QR code: {}", e),
        }
        println!();
    }
    println!("  Scan the QR code with the mobile app, or open:");
    println!("    {}", descriptor.payload());
    println!();
}
