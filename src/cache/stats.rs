//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, evictions and coalesced waits.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Point-in-time view of the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Entries in the mirror that have not expired
    pub valid_entries: usize,
    /// Fetches currently in flight in this process
    pub pending_requests: usize,
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or expired)
    pub misses: u64,
    /// Number of entries evicted by the count or size limit
    pub evictions: u64,
    /// Callers that joined an in-flight fetch instead of starting one
    pub coalesced: u64,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Counters ==
/// Lock-free counters shared by the store and the facade.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    coalesced: AtomicU64,
}

impl CacheCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters into a stats snapshot.
    pub fn snapshot(&self, valid_entries: usize, pending_requests: usize) -> CacheStats {
        CacheStats {
            valid_entries,
            pending_requests,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}
