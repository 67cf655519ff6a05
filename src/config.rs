//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// File name of the default cache inside the user's home directory.
pub const DEFAULT_CACHE_FILE: &str = ".track-cache.json";

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Path of the JSON cache file; the lock file lives next to it
    pub path: PathBuf,
    /// Maximum number of entries kept after a write
    pub max_entries: usize,
    /// Maximum size of the cache file in bytes
    pub max_file_size_bytes: u64,
    /// How long to wait for the cross-process lock
    pub lock_timeout: Duration,
    /// Age after which an existing lock file is considered abandoned
    pub lock_stale_after: Duration,
    /// Sleep between lock acquisition attempts
    pub lock_poll_interval: Duration,
    /// Minimum interval between disk refreshes of the in-memory mirror
    pub sync_interval: Duration,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `TRACK_CACHE_FILE` - Cache file path (default: `~/.track-cache.json`)
    /// - `TRACK_CACHE_MAX_ENTRIES` - Maximum cache entries (default: 2000)
    /// - `TRACK_CACHE_MAX_FILE_SIZE` - Maximum file size in bytes (default: 5 MiB)
    /// - `TRACK_CACHE_LOCK_TIMEOUT_MS` - Lock wait in milliseconds (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            path: env::var_os("TRACK_CACHE_FILE")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.path),
            max_entries: env::var("TRACK_CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_entries),
            max_file_size_bytes: env::var("TRACK_CACHE_MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_file_size_bytes),
            lock_timeout: env::var("TRACK_CACHE_LOCK_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            ..defaults
        }
    }

    /// Uses `name` as the cache file name inside the home directory.
    ///
    /// Distinct names give isolated caches for different data classes.
    pub fn with_file_name(name: &str) -> Self {
        Self {
            path: home_dir().join(name),
            ..Self::default()
        }
    }

    /// Uses an explicit cache file path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: home_dir().join(DEFAULT_CACHE_FILE),
            max_entries: 2000,
            max_file_size_bytes: 5 * 1024 * 1024,
            lock_timeout: Duration::from_secs(5),
            lock_stale_after: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(50),
            sync_interval: Duration::from_secs(1),
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 2000);
        assert_eq!(config.max_file_size_bytes, 5 * 1024 * 1024);
        assert_eq!(config.lock_stale_after, Duration::from_secs(30));
        assert!(config.path.ends_with(DEFAULT_CACHE_FILE));
    }

    #[test]
    fn test_with_file_name_keeps_defaults() {
        let config = CacheConfig::with_file_name(".track-cache-test.json");
        assert!(config.path.ends_with(".track-cache-test.json"));
        assert_eq!(config.max_entries, 2000);
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        env::remove_var("TRACK_CACHE_FILE");
        env::remove_var("TRACK_CACHE_MAX_ENTRIES");
        env::remove_var("TRACK_CACHE_MAX_FILE_SIZE");
        env::remove_var("TRACK_CACHE_LOCK_TIMEOUT_MS");

        let config = CacheConfig::from_env();
        assert_eq!(config.max_entries, 2000);
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert!(config.path.ends_with(DEFAULT_CACHE_FILE));
    }

    #[test]
    #[serial]
    fn test_config_from_env_overrides() {
        env::set_var("TRACK_CACHE_FILE", "/tmp/other-cache.json");
        env::set_var("TRACK_CACHE_MAX_ENTRIES", "10");
        env::set_var("TRACK_CACHE_LOCK_TIMEOUT_MS", "not-a-number");

        let config = CacheConfig::from_env();
        assert_eq!(config.path, PathBuf::from("/tmp/other-cache.json"));
        assert_eq!(config.max_entries, 10);
        assert_eq!(config.lock_timeout, Duration::from_secs(5));

        env::remove_var("TRACK_CACHE_FILE");
        env::remove_var("TRACK_CACHE_MAX_ENTRIES");
        env::remove_var("TRACK_CACHE_LOCK_TIMEOUT_MS");
    }
}
