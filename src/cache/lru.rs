//! LRU Module
//!
//! Least Recently Used ordering over persisted `lastAccessed` timestamps.

use std::cmp::Reverse;

use crate::cache::entry::CacheFile;

// == Recency Order ==
/// Returns all keys ordered from most to least recently accessed.
///
/// `keep` (the key just written) always ranks first. Ties on `lastAccessed`
/// break by key so the order is deterministic.
pub fn recency_order(entries: &CacheFile, keep: Option<&str>) -> Vec<String> {
    let mut ranked: Vec<(&String, u64)> = entries
        .iter()
        .map(|(key, entry)| (key, entry.last_accessed))
        .collect();

    ranked.sort_by_key(|(key, last_accessed)| {
        (
            Reverse(keep == Some(key.as_str())),
            Reverse(*last_accessed),
            *key,
        )
    });

    ranked.into_iter().map(|(key, _)| key.clone()).collect()
}

// == Evict ==
/// Keeps only the `max_entries` most recently accessed entries.
///
/// Returns the evicted keys, least recent last.
pub fn evict_least_recent(
    entries: &mut CacheFile,
    max_entries: usize,
    keep: Option<&str>,
) -> Vec<String> {
    if entries.len() <= max_entries {
        return Vec::new();
    }

    let evicted: Vec<String> = recency_order(entries, keep)
        .into_iter()
        .skip(max_entries)
        .collect();

    for key in &evicted {
        entries.remove(key);
    }
    evicted
}

/// Drops the `count` least recently accessed entries.
pub fn evict_oldest(entries: &mut CacheFile, count: usize, keep: Option<&str>) -> Vec<String> {
    let target = entries.len().saturating_sub(count);
    evict_least_recent(entries, target, keep)
}
