//! Track Cache - local reference-data cache for a time-tracking CLI
//!
//! A JSON file cache with TTL expiration, LRU eviction, a cross-process
//! lock file and coalescing of concurrent fetches for the same key.

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{Cache, CacheStats, CacheStore};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
