//! Error types for the Ratekeeper engine.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule failed validation at registration time
    #[error("Invalid rule '{name}': {reason}")]
    InvalidRule { name: String, reason: String },

    /// Counter storage errors (connection failures, query errors)
    #[error("Backend error ({backend}): {message}")]
    Backend { backend: &'static str, message: String },

    /// JSON/YAML (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Build a backend error tagged with the backend name.
    pub fn backend(backend: &'static str, message: impl std::fmt::Display) -> Self {
        RateLimitError::Backend {
            backend,
            message: message.to_string(),
        }
    }

    /// Whether this error came from counter storage.
    pub fn is_backend(&self) -> bool {
        matches!(self, RateLimitError::Backend { .. })
    }
}

impl From<serde_json::Error> for RateLimitError {
    fn from(e: serde_json::Error) -> Self {
        RateLimitError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for RateLimitError {
    fn from(e: serde_yaml::Error) -> Self {
        RateLimitError::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for RateLimitError {
    fn from(e: config::ConfigError) -> Self {
        RateLimitError::Config(e.to_string())
    }
}

impl From<sqlx::Error> for RateLimitError {
    fn from(e: sqlx::Error) -> Self {
        RateLimitError::backend("sqlite", e)
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for RateLimitError {
    fn from(e: redis::RedisError) -> Self {
        RateLimitError::backend("redis", e)
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
