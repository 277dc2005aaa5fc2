//! Error types for chama cache operations

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Validation errors. Raised before any I/O is attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Cache key must not be empty")]
    EmptyKey,

    #[error("Cache key is {size} bytes, limit is {max}")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Cache value is {size} bytes, limit is {max}")]
    ValueTooLarge { size: usize, max: usize },

    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Remote tier transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Remote store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Remote command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Remote command {command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Remote store circuit is open")]
    CircuitOpen,
}

impl TransportError {
    /// True when the failure says something about the health of the remote
    /// tier itself rather than about one malformed command.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::CircuitOpen
        )
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all chama cache errors.
///
/// `Clone` so that a single failed computation can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ChamaError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Fetch failed: {0}")]
    Fetch(Arc<dyn std::error::Error + Send + Sync>),

    #[error("Telemetry error: {reason}")]
    Telemetry { reason: String },
}

impl ChamaError {
    /// Wrap an error produced by a caller-supplied fetch function.
    pub fn fetch<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Fetch(Arc::new(err))
    }

    /// Returns true if this error came from the caller's fetch function
    /// rather than from the cache layer.
    pub fn is_fetch(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }
}

impl From<serde_json::Error> for ChamaError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            reason: e.to_string(),
        }
    }
}

/// Result type alias for chama cache operations.
pub type ChamaResult<T> = Result<T, ChamaError>;

// =============================================================================
// TESTS
// =============================================================================
