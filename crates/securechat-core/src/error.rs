//! Error types for `SecureChat` core library.

use thiserror::Error;

/// Result type alias using `SecureChat` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `SecureChat` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
