//! Error types for intunnel

use thiserror::Error;

/// Main error type for intunnel operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("QR encoding error: {0}")]
    Encoding(String),

    #[error("Device registry is full ({0} devices)")]
    RegistryFull(usize),

    #[error("Control plane not started")]
    NotStarted,

    #[error("No async runtime available")]
    NoRuntime,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Configuration directory not found")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using intunnel's Error
pub type Result<T> = std::result::Result<T, Error>;
