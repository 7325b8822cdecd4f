//! Error types for the trust sidecar

use thiserror::Error;

/// Result type alias for the trust sidecar
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level errors.
///
/// Request-scoped failures (token verification, policy denial, routing,
/// transport) have their own types next to the component that raises them
/// and are turned into HTTP statuses there; only startup and server errors
/// travel through this enum.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (unreadable or malformed source at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listener / server failure
    #[error("Server error: {0}")]
    Server(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error happened while loading startup configuration.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
