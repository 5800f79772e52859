//! Error types for the Slidegate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Slidegate operations.
#[derive(Error, Debug)]
pub enum SlidegateError {
    /// Limiter configuration that would silently disable limiting
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the shared counter store.
///
/// None of these reach an HTTP caller; the limiter routes them through the
/// degraded-mode policy instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection could not be established or was lost
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured bound
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered, but not with what the script should return
    #[error("store script failed: {0}")]
    Script(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Script(err.to_string())
        }
    }
}

impl From<config::ConfigError> for SlidegateError {
    fn from(err: config::ConfigError) -> Self {
        SlidegateError::Config(err.to_string())
    }
}

/// Result type alias for Slidegate operations.
pub type Result<T> = std::result::Result<T, SlidegateError>;
