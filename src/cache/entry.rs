//! Cache Entry Module
//!
//! Defines the on-disk representation of cached entries and the file that holds them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::clock::duration_ms;

// == Cache File ==
/// The whole cache file: a flat JSON object of key to entry.
///
/// Always written in full, never patched in place.
pub type CacheFile = BTreeMap<String, CacheEntry>;

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// The stored payload, of whatever shape the caller wrote
    pub data: Value,
    /// Expiration timestamp (Unix milliseconds)
    pub expires_at: u64,
    /// Last read or write (Unix milliseconds), drives LRU eviction
    pub last_accessed: u64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry written at `now_ms` that lives for `ttl`.
    pub fn new(data: Value, ttl: Duration, now_ms: u64) -> Self {
        Self {
            data,
            expires_at: now_ms.saturating_add(duration_ms(ttl)),
            last_accessed: now_ms,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// Boundary condition: an entry is expired once `now >= expires_at`, so a
    /// zero TTL yields an entry that is never readable.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    /// Records a read at `now_ms`.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_accessed = now_ms;
    }

    // == Time To Live ==
    /// Returns remaining TTL in milliseconds, zero once expired.
    pub fn ttl_remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at.saturating_sub(now_ms)
    }
}

/// Drops every expired entry, returning how many were removed.
pub fn remove_expired(entries: &mut CacheFile, now_ms: u64) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now_ms));
    before - entries.len()
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_creation() {
        let entry = CacheEntry::new(json!({"id": 1}), Duration::from_secs(60), 1_000);

        assert_eq!(entry.data, json!({"id": 1}));
        assert_eq!(entry.expires_at, 61_000);
        assert_eq!(entry.last_accessed, 1_000);
        assert!(!entry.is_expired(1_000));
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let entry = CacheEntry::new(json!("x"), Duration::from_millis(300_000), 0);

        assert!(!entry.is_expired(299_999));
        assert!(entry.is_expired(300_000), "Entry should be expired at boundary");
        assert!(entry.is_expired(300_001));
    }

    #[test]
    fn test_zero_ttl_is_immediately_expired() {
        let entry = CacheEntry::new(json!(null), Duration::ZERO, 42);
        assert!(entry.is_expired(42));
    }

    #[test]
    fn test_huge_ttl_saturates_instead_of_wrapping() {
        let ttl = Duration::from_secs(u64::MAX / 1000 + 1);
        let entry = CacheEntry::new(json!(1), ttl, 1_000);

        assert_eq!(entry.expires_at, u64::MAX);
        assert!(!entry.is_expired(1_000_000));
    }

    #[test]
    fn test_ttl_remaining() {
        let entry = CacheEntry::new(json!(1), Duration::from_secs(10), 0);

        assert_eq!(entry.ttl_remaining_ms(4_000), 6_000);
        assert_eq!(entry.ttl_remaining_ms(20_000), 0);
    }

    #[test]
    fn test_serialized_field_names() {
        let entry = CacheEntry::new(json!([1, 2]), Duration::from_millis(5), 10);
        let text = serde_json::to_string(&entry).unwrap();

        assert!(text.contains("\"expiresAt\":15"));
        assert!(text.contains("\"lastAccessed\":10"));
        assert!(text.contains("\"data\":[1,2]"));
    }

    #[test]
    fn test_remove_expired() {
        let mut entries = CacheFile::new();
        entries.insert("old".into(), CacheEntry::new(json!(1), Duration::from_secs(1), 0));
        entries.insert("new".into(), CacheEntry::new(json!(2), Duration::from_secs(60), 0));

        assert_eq!(remove_expired(&mut entries, 5_000), 1);
        assert!(entries.contains_key("new"));
        assert!(!entries.contains_key("old"));
    }
}
