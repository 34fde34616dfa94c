//! Error types for Trickle

use thiserror::Error;

/// Main error type for Trickle operations
#[derive(Error, Debug)]
pub enum TrickleError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream client construction or transport errors
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// HTTP server errors (bind, serve)
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for Trickle operations
pub type Result<T> = std::result::Result<T, TrickleError>;
