//! Tunnel provider error types

use thiserror::Error;

/// Failures reported by a tunnel provider adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{0}")]
    Unavailable(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("{0}")]
    Crashed(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;
