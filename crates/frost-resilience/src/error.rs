//! Error types for the resilience layer.

use thiserror::Error;

/// Errors that can occur when configuring or persisting resilience components.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// Invalid configuration supplied at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
