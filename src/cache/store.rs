//! Cache Store Module
//!
//! File-backed cache engine: every read-modify-write runs under the
//! cross-process lock as a full load, mutate, save cycle. An in-memory
//! mirror of the last loaded file serves statistics without touching the lock.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::clock::duration_ms;
use crate::cache::entry::{remove_expired, CacheEntry, CacheFile};
use crate::cache::lock::{append_suffix, lock_path_for, FileLock, LockOptions};
use crate::cache::lru::{evict_least_recent, evict_oldest};
use crate::cache::{CacheCounters, CacheStats, Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

// == Entry Info ==
/// A valid entry as shown by `CacheStore::entries`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub key: String,
    pub ttl_remaining_ms: u64,
    pub last_accessed: u64,
}

#[derive(Debug, Default)]
struct Mirror {
    entries: CacheFile,
    synced_at: Option<u64>,
}

// == Cache Store ==
/// One cache namespace backed by one JSON file.
#[derive(Debug)]
pub struct CacheStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_options: LockOptions,
    max_entries: usize,
    max_file_size_bytes: u64,
    sync_interval_ms: u64,
    clock: Arc<dyn Clock>,
    mirror: Mutex<Mirror>,
    counters: CacheCounters,
}

impl CacheStore {
    // == Constructor ==
    /// Creates a store for `config.path` using wall-clock time.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a store with an explicit time source.
    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            lock_path: lock_path_for(&config.path),
            path: config.path.clone(),
            lock_options: LockOptions {
                timeout: config.lock_timeout,
                stale_after: config.lock_stale_after,
                poll_interval: config.lock_poll_interval,
            },
            max_entries: config.max_entries,
            max_file_size_bytes: config.max_file_size_bytes,
            sync_interval_ms: duration_ms(config.sync_interval),
            clock,
            mirror: Mutex::new(Mirror::default()),
            counters: CacheCounters::default(),
        }
    }

    /// Path of the backing cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // == Get ==
    /// Looks up `key`, returning `Ok(None)` when it is absent or expired.
    ///
    /// An expired entry is deleted from the file. A hit refreshes the
    /// entry's `lastAccessed`. Only a lock timeout is reported as an error.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let _lock = self.lock()?;
        let mut entries = self.load();
        let now = self.clock.now_ms();

        let expired = match entries.get(key) {
            None => {
                self.counters.record_miss();
                self.replace_mirror(entries, now);
                return Ok(None);
            }
            Some(entry) => entry.is_expired(now),
        };

        let found = if expired {
            debug!("Cache entry {} expired", key);
            entries.remove(key);
            self.counters.record_miss();
            None
        } else {
            let entry = entries
                .get_mut(key)
                .ok_or_else(|| CacheError::Internal(format!("entry {} vanished", key)))?;
            entry.touch(now);
            self.counters.record_hit();
            Some(entry.data.clone())
        };

        if let Err(e) = self.save(&mut entries, None) {
            debug!("Failed to persist cache after reading {}: {}", key, e);
        }
        self.replace_mirror(entries, now);
        Ok(found)
    }

    // == Set ==
    /// Stores `value` under `key` for `ttl`.
    ///
    /// Expired entries are purged and the entry limit enforced in the same
    /// cycle. Failures are logged and dropped: a failed write only means the
    /// next read misses.
    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        if let Err(e) = self.try_set(key, value, ttl) {
            debug!("Cache write for {} dropped: {}", key, e);
        }
    }

    fn try_set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let _lock = self.lock()?;
        let mut entries = self.load();
        let now = self.clock.now_ms();

        let expired = remove_expired(&mut entries, now);
        if expired > 0 {
            debug!("Purged {} expired cache entries", expired);
        }

        entries.insert(key.to_string(), CacheEntry::new(value, ttl, now));

        let evicted = evict_least_recent(&mut entries, self.max_entries, Some(key));
        if !evicted.is_empty() {
            debug!("Evicted {} least recently used entries", evicted.len());
            self.counters.record_evictions(evicted.len());
        }

        let result = self.save(&mut entries, Some(key));
        self.replace_mirror(entries, now);
        result
    }

    // == Delete ==
    /// Removes `key`. Failures are logged and dropped.
    pub fn delete(&self, key: &str) {
        if let Err(e) = self.try_delete(key) {
            debug!("Cache delete for {} dropped: {}", key, e);
        }
    }

    fn try_delete(&self, key: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut entries = self.load();
        let now = self.clock.now_ms();

        let result = if entries.remove(key).is_some() {
            self.save(&mut entries, None)
        } else {
            Ok(())
        };
        self.replace_mirror(entries, now);
        result
    }

    // == Clear ==
    /// Deletes the backing file and empties the mirror.
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed cache file {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove cache file {}: {}", self.path.display(), e),
        }
        self.replace_mirror(CacheFile::new(), self.clock.now_ms());
    }

    // == Stats ==
    /// Number of unexpired entries, read from the mirror.
    ///
    /// Does not take the file lock. The mirror is reloaded from disk when the
    /// last sync is older than the configured interval.
    pub fn valid_entry_count(&self) -> usize {
        self.with_synced_mirror(|entries, _| entries.len())
    }

    /// Valid entries with their remaining TTL, most recently accessed first.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let mut infos = self.with_synced_mirror(|entries, now| {
            entries
                .iter()
                .map(|(key, entry)| EntryInfo {
                    key: key.clone(),
                    ttl_remaining_ms: entry.ttl_remaining_ms(now),
                    last_accessed: entry.last_accessed,
                })
                .collect::<Vec<_>>()
        });
        infos.sort_by(|a, b| {
            b.last_accessed
                .cmp(&a.last_accessed)
                .then_with(|| a.key.cmp(&b.key))
        });
        infos
    }

    /// Counter snapshot with the given pending-request count.
    pub fn stats(&self, pending_requests: usize) -> CacheStats {
        self.counters
            .snapshot(self.valid_entry_count(), pending_requests)
    }

    pub(crate) fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    fn with_synced_mirror<R>(&self, f: impl FnOnce(&CacheFile, u64) -> R) -> R {
        let now = self.clock.now_ms();
        let mut mirror = self.mirror_guard();

        let due = mirror
            .synced_at
            .map_or(true, |at| now.saturating_sub(at) >= self.sync_interval_ms);
        if due {
            mirror.entries = match self.read_file() {
                Ok(Some(entries)) => entries,
                Ok(None) => CacheFile::new(),
                Err(e) => {
                    debug!("Mirror refresh skipped: {}", e);
                    CacheFile::new()
                }
            };
            mirror.synced_at = Some(now);
        }

        remove_expired(&mut mirror.entries, now);
        f(&mirror.entries, now)
    }

    fn replace_mirror(&self, entries: CacheFile, now: u64) {
        let mut mirror = self.mirror_guard();
        mirror.entries = entries;
        mirror.synced_at = Some(now);
    }

    fn mirror_guard(&self) -> MutexGuard<'_, Mirror> {
        self.mirror.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> Result<FileLock> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = fs::create_dir_all(parent);
            }
        }
        FileLock::acquire(&self.lock_path, &self.lock_options)
    }

    // == Load ==
    /// Loads the cache file, recovering from every failure as an empty cache.
    ///
    /// A corrupted file is moved aside to `<path>.corrupted.<timestamp>`.
    fn load(&self) -> CacheFile {
        match self.read_file() {
            Ok(Some(entries)) => entries,
            Ok(None) => CacheFile::new(),
            Err(e @ CacheError::Corrupted { .. }) => {
                warn!("{}; starting with an empty cache", e);
                self.back_up_corrupted();
                CacheFile::new()
            }
            Err(e) => {
                debug!("Ignoring unreadable cache file: {}", e);
                CacheFile::new()
            }
        }
    }

    /// Reads and parses the cache file. `Ok(None)` means it does not exist.
    fn read_file(&self) -> Result<Option<CacheFile>> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io("reading cache metadata", e)),
        };
        if size > self.max_file_size_bytes {
            return Err(CacheError::TooLarge {
                path: self.path.clone(),
                size,
                limit: self.max_file_size_bytes,
            });
        }

        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io("reading cache file", e)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CacheError::Corrupted {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    fn back_up_corrupted(&self) {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let backup = append_suffix(&self.path, &format!(".corrupted.{}", stamp));
        match fs::rename(&self.path, &backup) {
            Ok(()) => warn!("Moved corrupted cache to {}", backup.display()),
            Err(e) => debug!("Could not back up corrupted cache: {}", e),
        }
    }

    // == Save ==
    /// Writes `entries` through a temporary file renamed over the cache file.
    ///
    /// Drops least recently used entries until the serialized file fits in
    /// the byte limit; `entries` reflects what was written.
    fn save(&self, entries: &mut CacheFile, keep: Option<&str>) -> Result<()> {
        let bytes = self.serialize_within_limit(entries, keep)?;
        let tmp = append_suffix(&self.path, &format!(".tmp.{}", std::process::id()));

        let written = File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(&bytes)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &self.path));

        written.map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CacheError::io(format!("writing cache file {}", self.path.display()), e)
        })
    }

    fn serialize_within_limit(
        &self,
        entries: &mut CacheFile,
        keep: Option<&str>,
    ) -> Result<Vec<u8>> {
        loop {
            let bytes = serde_json::to_vec(entries).map_err(|source| CacheError::Payload {
                key: keep.unwrap_or_default().to_string(),
                source,
            })?;
            if bytes.len() as u64 <= self.max_file_size_bytes || entries.is_empty() {
                return Ok(bytes);
            }

            let batch = (entries.len() / 4).max(1);
            // The kept key goes last, once it is the only entry left
            let keep = keep.filter(|_| entries.len() > 1);
            let evicted = evict_oldest(entries, batch, keep);
            debug!(
                "Cache file over {} bytes, evicted {} entries",
                self.max_file_size_bytes,
                evicted.len()
            );
            self.counters.record_evictions(evicted.len());
        }
    }
}
