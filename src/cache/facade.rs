//! Cache Facade Module
//!
//! Async cache-aside entry point: check the store, join or start a
//! coalesced fetch, populate the store on success.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::coalesce::{FlightResult, RequestCoalescer};
use crate::cache::{CacheStats, CacheStore};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

// == Cache ==
/// A cache namespace: one store plus its in-process coalescer.
///
/// Cheap to clone; clones share the same store and pending table. File
/// access runs on tokio's blocking pool so lock polling never stalls the
/// event loop.
#[derive(Debug, Clone)]
pub struct Cache {
    store: Arc<CacheStore>,
    coalescer: RequestCoalescer,
}

impl Cache {
    // == Constructor ==
    /// Creates a cache for `config.path`.
    pub fn new(config: &CacheConfig) -> Self {
        Self::from_store(Arc::new(CacheStore::new(config)))
    }

    /// Wraps an existing store.
    pub fn from_store(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            coalescer: RequestCoalescer::new(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    // == Get ==
    /// Returns the cached value for `key`.
    ///
    /// A payload that does not deserialize into `T` reads as absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let owned = key.to_string();
        let raw = self.blocking(move |store| store.get(&owned)).await??;

        Ok(raw.and_then(|data| match serde_json::from_value(data) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Cached value for {} has an unexpected shape: {}", key, e);
                None
            }
        }))
    }

    // == Set ==
    /// Caches `value` under `key` for `ttl`. Never fails.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(e) => {
                debug!("Not caching {}: {}", key, e);
                return;
            }
        };
        let owned = key.to_string();
        if let Err(e) = self.blocking(move |store| store.set(&owned, data, ttl)).await {
            debug!("Cache write for {} dropped: {}", key, e);
        }
    }

    // == Delete ==
    /// Removes `key`. Never fails.
    pub async fn delete(&self, key: &str) {
        let owned = key.to_string();
        if let Err(e) = self.blocking(move |store| store.delete(&owned)).await {
            debug!("Cache delete for {} dropped: {}", key, e);
        }
    }

    // == Clear ==
    /// Removes the whole cache file.
    pub async fn clear(&self) {
        if let Err(e) = self.blocking(|store| store.clear()).await {
            debug!("Cache clear dropped: {}", e);
        }
    }

    // == Get Or Fetch ==
    /// Returns the cached value for `key`, calling `fetch` only on a miss.
    ///
    /// Concurrent callers missing on the same key share a single call to
    /// `fetch`. A successful result is cached for `ttl`; a failure reaches
    /// every waiter as `FetchFailed` and leaves the cache untouched. A cache
    /// that cannot be read (lock timeout) counts as a miss.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, fetch: F, ttl: Duration) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        match self.get::<T>(key).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => debug!("Cache unavailable for {}, fetching: {}", key, e),
        }

        let store = Arc::clone(&self.store);
        let joined = self.coalescer.join_or_start(key, || {
            fetch_and_store(store, key.to_string(), fetch(), ttl)
        });
        if joined.coalesced {
            self.store.counters().record_coalesced();
        }

        let data = joined.flight.await.map_err(|cause| CacheError::FetchFailed {
            key: key.to_string(),
            cause,
        })?;
        serde_json::from_value(data).map_err(|source| CacheError::Payload {
            key: key.to_string(),
            source,
        })
    }

    // == Stats ==
    /// Valid entry count, pending fetches and counters.
    pub async fn stats(&self) -> CacheStats {
        let pending = self.coalescer.len();
        match self.blocking(move |store| store.stats(pending)).await {
            Ok(stats) => stats,
            Err(e) => {
                debug!("Stats unavailable: {}", e);
                self.store.counters().snapshot(0, pending)
            }
        }
    }

    /// Number of fetches currently in flight.
    pub fn pending_requests(&self) -> usize {
        self.coalescer.len()
    }

    async fn blocking<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CacheStore) -> R + Send + 'static,
        R: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| CacheError::Internal(format!("cache worker failed: {}", e)))
    }
}

/// Body of a flight: run the fetch, cache its result, hand it to the waiters.
async fn fetch_and_store<T, Fut>(
    store: Arc<CacheStore>,
    key: String,
    pending: Fut,
    ttl: Duration,
) -> FlightResult
where
    T: Serialize + Send,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    let value = pending.await?;
    let data: Value = serde_json::to_value(&value)
        .map_err(|e| anyhow::Error::new(e).context(format!("serializing result for {}", key)))?;

    let cached = data.clone();
    let written = tokio::task::spawn_blocking(move || store.set(&key, cached, ttl)).await;
    if let Err(e) = written {
        debug!("Cache write after fetch dropped: {}", e);
    }
    Ok(data)
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Project {
        id: u64,
        name: String,
    }

    fn test_cache(dir: &TempDir) -> (Cache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let config = CacheConfig {
            lock_timeout: Duration::from_secs(2),
            lock_poll_interval: Duration::from_millis(5),
            ..CacheConfig::with_path(dir.path().join("cache.json"))
        };
        let store = CacheStore::with_clock(&config, clock.clone());
        (Cache::from_store(Arc::new(store)), clock)
    }

    fn projects() -> Vec<Project> {
        vec![Project {
            id: 1,
            name: "A".to_string(),
        }]
    }

    #[tokio::test]
    async fn test_typed_set_and_get() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = test_cache(&dir);

        cache.set("projects", &projects(), Duration::from_secs(300)).await;
        let cached: Option<Vec<Project>> = cache.get("projects").await.unwrap();

        assert_eq!(cached, Some(projects()));
    }

    #[tokio::test]
    async fn test_shape_mismatch_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = test_cache(&dir);

        cache.set("projects", &"not a list", Duration::from_secs(300)).await;
        let cached: Option<Vec<Project>> = cache.get("projects").await.unwrap();

        assert_eq!(cached, None);
    }

    #[tokio::test]
    async fn test_get_or_fetch_hit_skips_fetch() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = test_cache(&dir);
        cache.set("projects", &projects(), Duration::from_secs(300)).await;

        let result: Vec<Project> = cache
            .get_or_fetch(
                "projects",
                || async { Err::<Vec<Project>, _>(anyhow::anyhow!("should not be called")) },
                Duration::from_secs(300),
            )
            .await
            .unwrap();

        assert_eq!(result, projects());
    }

    #[tokio::test]
    async fn test_get_or_fetch_populates_cache() {
        let dir = TempDir::new().unwrap();
        let (cache, clock) = test_cache(&dir);

        let fetched = cache
            .get_or_fetch(
                "projects",
                || async { Ok::<_, anyhow::Error>(projects()) },
                Duration::from_secs(300),
            )
            .await
            .unwrap();
        assert_eq!(fetched, projects());

        let cached: Option<Vec<Project>> = cache.get("projects").await.unwrap();
        assert_eq!(cached, Some(projects()));

        clock.advance(Duration::from_millis(300_001));
        let expired: Option<Vec<Project>> = cache.get("projects").await.unwrap();
        assert_eq!(expired, None);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_fetch_fetches_once() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = test_cache(&dir);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, anyhow::Error>(projects())
            }
        };

        let ttl = Duration::from_secs(300);
        let (a, b) = tokio::join!(
            cache.get_or_fetch("projects", fetch(calls.clone()), ttl),
            cache.get_or_fetch("projects", fetch(calls.clone()), ttl),
        );

        assert_eq!(a.unwrap(), projects());
        assert_eq!(b.unwrap(), projects());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates_and_skips_cache() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = test_cache(&dir);

        let failing = || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err::<Vec<Project>, _>(anyhow::anyhow!("401 Unauthorized"))
        };
        let ttl = Duration::from_secs(300);
        let (a, b) = tokio::join!(
            cache.get_or_fetch("projects", failing, ttl),
            cache.get_or_fetch("projects", failing, ttl),
        );

        for result in [a, b] {
            let err = result.unwrap_err();
            assert!(matches!(err, CacheError::FetchFailed { .. }));
            assert_eq!(err.fetch_cause().unwrap().to_string(), "401 Unauthorized");
        }
        let cached: Option<Vec<Project>> = cache.get("projects").await.unwrap();
        assert_eq!(cached, None);
        assert!(!dir.path().join("cache.json").exists());
    }

    #[tokio::test]
    async fn test_stats_reports_entries_and_pending() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = test_cache(&dir);

        cache.set("a", &1, Duration::from_secs(60)).await;
        cache.set("b", &2, Duration::from_secs(60)).await;
        cache.delete("b").await;

        let stats = cache.stats().await;
        assert_eq!(stats.valid_entries, 1);
        assert_eq!(stats.pending_requests, 0);

        cache.clear().await;
        assert_eq!(cache.stats().await.valid_entries, 0);
    }
}
