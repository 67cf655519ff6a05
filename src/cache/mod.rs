//! Cache Module
//!
//! File-backed reference-data cache with TTL expiration, LRU eviction,
//! cross-process locking and in-process request coalescing.

mod clock;
mod coalesce;
mod entry;
mod facade;
mod lock;
mod lru;
mod stats;
mod store;


// Re-export public types
pub use clock::{current_timestamp_ms, Clock, ManualClock, SystemClock};
pub use coalesce::{Flight, FlightResult, Joined, RequestCoalescer};
pub use entry::{CacheEntry, CacheFile};
pub use facade::Cache;
pub use lock::{lock_path_for, release_lock, FileLock, LockOptions};
pub use lru::{evict_least_recent, recency_order};
pub use stats::{CacheCounters, CacheStats};
pub use store::{CacheStore, EntryInfo};

// == TTL Tiers ==
/// Time-to-live tiers used by callers of the cache.
pub mod ttl {
    use std::time::Duration;

    /// Volatile state such as the running timer; callers normally skip caching it
    pub const VOLATILE: Duration = Duration::from_secs(30);

    /// Moderately fresh reference data (projects, tasks)
    pub const REFERENCE: Duration = Duration::from_secs(5 * 60);

    /// Near-static reference data (workspaces, clients)
    pub const STATIC: Duration = Duration::from_secs(7 * 24 * 60 * 60);
}
