//! Error types for the reference-data cache
//!
//! Provides unified error handling using thiserror.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache subsystem.
///
/// Callers of the facade see `LockTimeout` and `FetchFailed`. `Corrupted`,
/// `TooLarge` and `Io` describe maintenance failures that the store recovers
/// from internally.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The lock file could not be created within the configured bound
    #[error("Timed out after {waited:?} waiting for cache lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The cache file exists but does not parse
    #[error("Cache file {} is corrupted: {reason}", .path.display())]
    Corrupted { path: PathBuf, reason: String },

    /// The cache file exceeds the configured byte limit
    #[error("Cache file {} is {size} bytes, over the {limit} byte limit", .path.display())]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    /// The caller-supplied fetch operation failed
    #[error("Fetch failed for key {key}: {cause:#}")]
    FetchFailed {
        key: String,
        cause: Arc<anyhow::Error>,
    },

    /// A payload could not be converted to or from JSON
    #[error("Invalid payload for key {key}: {source}")]
    Payload {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// File system failure
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Internal error (e.g. a panicked worker task)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns the error produced by the fetch operation, if this is a fetch failure.
    pub fn fetch_cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::FetchFailed { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
