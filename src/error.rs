//! Error types for the panel cache

use thiserror::Error;

use crate::cache::TierKind;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the panel cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Tier Errors (recovered inside the orchestrator)
    // =========================================================================
    /// Tier unreachable, timed out, or cooling down after a failure
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: TierKind, reason: String },

    /// Stored payload could not be decoded
    #[error("Failed to decode cached payload: {0}")]
    Decode(String),

    // =========================================================================
    // Misuse (surfaced to the caller)
    // =========================================================================
    /// Namespace not present in the configuration
    #[error("Unknown cache namespace: {0}")]
    UnknownNamespace(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Redis client error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `TierUnavailable` error
    pub fn unavailable(tier: TierKind, reason: impl Into<String>) -> Self {
        Error::TierUnavailable {
            tier,
            reason: reason.into(),
        }
    }

    /// True for runtime conditions the orchestrator absorbs (outages, poison
    /// entries). False for misuse, which is returned to the caller.
    pub fn is_operational(&self) -> bool {
        !matches!(self, Error::UnknownNamespace(_) | Error::Config(_))
    }
}
