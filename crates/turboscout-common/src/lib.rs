//! # TurboScout Common
//!
//! Shared error type, logging setup, and retry/timeout helpers used by the TurboScout offline
//! worker crates.

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Errors raised by the shared layer.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Configuration could not be loaded or applied.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A deadline passed before the operation finished.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl CommonError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Configuration error caused by `source`.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias for shared operations.
pub type Result<T> = std::result::Result<T, CommonError>;
