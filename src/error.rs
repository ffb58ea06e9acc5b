//! Error types for the tenant gateway

use std::io;

use thiserror::Error;

/// Result type alias for the tenant gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level gateway errors.
///
/// Request-local failures (authentication, forwarding) have their own types
/// in [`crate::gateway::auth`] and [`crate::proxy`] and never reach this enum.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
