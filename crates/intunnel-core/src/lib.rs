//! intunnel Core - Shared types for the pairing and exposure control plane
//!
//! This crate provides the foundational types used across all intunnel components:
//! configuration, the error type, the connection descriptor handed to mobile
//! clients, the exposure state model, and the snapshot broadcast primitive.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod exposure;
pub mod notify;
pub mod settings;

pub use config::{CloudflareConfig, Config, RestartPolicy, TailscaleConfig};
pub use descriptor::ConnectionDescriptor;
pub use error::{Error, Result};
pub use exposure::{ExposureMode, ExposureState, ExposureStatus};
pub use notify::{ListenerHandle, Notifier};
pub use settings::{Settings, SettingsStore};
