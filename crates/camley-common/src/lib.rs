//! # Camley Common
//!
//! Shared error types, logging setup, and configuration for the Camley
//! offline cache.
//!
//! ## Features
//!
//! - Unified error type with backtrace support
//! - Logging configuration and setup
//! - Offline cache configuration with deployed defaults
//! - Result extension trait

use thiserror::Error;

pub mod config;
pub mod logging;

pub use config::{NotificationDefaults, OfflineConfig};
pub use logging::{init_logging, LogConfig, LogFormat};

/// Unified error type for Camley.
#[derive(Error, Debug)]
pub enum CamleyError {
    /// Cache storage errors.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl CamleyError {
    /// Create a cache error with source.
    pub fn cache_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            CamleyError::Cache { .. } => "cache",
            CamleyError::Config { .. } => "config",
            CamleyError::Io(_) => "io",
            CamleyError::Json(_) => "json",
            CamleyError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for Camley operations.
pub type Result<T> = std::result::Result<T, CamleyError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| CamleyError::Internal {
            message: format!("{}: {}", message.into(), e),
            backtrace: Some(backtrace::Backtrace::new()),
        })
    }
}
