//! Error types for the multi-level cache
//!
//! Remote-tier faults are contained inside the coordinator and never reach
//! callers of `lookup`/`put`/`evict`/`clear`. The variants below exist for the
//! remote adapters, the circuit breaker, configuration validation, and the one
//! failure that does propagate: no value could be produced from any source.

use crate::resilience::CircuitBreakerError;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid expiry policy: {0}")]
    InvalidExpiry(String),

    // =========================================================================
    // Value Production Errors
    // =========================================================================
    #[error("Value for key '{key}' in cache '{cache}' could not be loaded: {source}")]
    ValueRetrieval {
        cache: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    // =========================================================================
    // Remote Tier Errors
    // =========================================================================
    #[error("Remote store operation failed: {operation} - {reason}")]
    Remote { operation: String, reason: String },

    #[error("Remote store operation {operation} timed out after {after:?}")]
    RemoteTimeout { operation: String, after: Duration },

    #[error("Circuit breaker '{name}' does not permit further calls")]
    CircuitOpen { name: String },

    #[error("Remote payload could not be decoded: {0}")]
    Decode(String),

    // =========================================================================
    // Invalidation Errors
    // =========================================================================
    #[error("Malformed invalidation message: {0}")]
    MalformedMessage(String),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a remote-tier failure
    pub fn remote(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Remote {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is transient (remote outage, timeout, open breaker)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Remote { .. } | Error::RemoteTimeout { .. } | Error::CircuitOpen { .. }
        )
    }
}

impl From<CircuitBreakerError<Error>> for Error {
    fn from(err: CircuitBreakerError<Error>) -> Self {
        match err {
            CircuitBreakerError::CallNotPermitted { name } => Error::CircuitOpen { name },
            CircuitBreakerError::Timeout { name, after } => Error::RemoteTimeout {
                operation: name,
                after,
            },
            CircuitBreakerError::Failed(inner) => inner,
        }
    }
}

/// Result type alias for the cache
pub type Result<T> = std::result::Result<T, Error>;
