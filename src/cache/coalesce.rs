//! Request Coalescer Module
//!
//! Collapses concurrent fetches of the same key into one in-flight operation.
//!
//! Each flight runs on its own tokio task, so it completes and settles the
//! pending table even if every caller waiting on it goes away.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tracing::debug;

/// Outcome of a flight, shared by every waiter.
pub type FlightResult = std::result::Result<Value, Arc<anyhow::Error>>;

/// Handle to an in-flight fetch. Cloning it adds a waiter.
pub type Flight = Shared<BoxFuture<'static, FlightResult>>;

type PendingTable = Arc<Mutex<HashMap<String, Flight>>>;

// == Joined ==
/// A flight plus whether the caller joined an existing one.
pub struct Joined {
    pub flight: Flight,
    pub coalesced: bool,
}

// == Request Coalescer ==
/// In-process table of key to in-flight fetch.
#[derive(Clone, Default)]
pub struct RequestCoalescer {
    pending: PendingTable,
}

impl RequestCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    // == Join Or Start ==
    /// Returns the flight already running for `key`, or starts `start()` as a new one.
    ///
    /// `start` is only called when no flight exists. The new flight is
    /// removed from the table once it settles, success or failure.
    /// Must be called from within a tokio runtime.
    pub fn join_or_start<S, Fut>(&self, key: &str, start: S) -> Joined
    where
        S: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult> + Send + 'static,
    {
        let mut pending = lock_table(&self.pending);
        if let Some(flight) = pending.get(key) {
            debug!("Joining in-flight fetch for {}", key);
            return Joined {
                flight: flight.clone(),
                coalesced: true,
            };
        }

        let work = start();
        let table = Arc::clone(&self.pending);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            let result = work.await;
            lock_table(&table).remove(&owned_key);
            result
        });

        let flight = async move {
            handle.await.unwrap_or_else(|e| {
                Err(Arc::new(anyhow::anyhow!("fetch task did not complete: {}", e)))
            })
        }
        .boxed()
        .shared();

        pending.insert(key.to_string(), flight.clone());
        Joined {
            flight,
            coalesced: false,
        }
    }

    /// Number of flights currently in progress.
    pub fn len(&self) -> usize {
        lock_table(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a flight for `key` is in progress.
    pub fn is_pending(&self, key: &str) -> bool {
        lock_table(&self.pending).contains_key(key)
    }
}

impl fmt::Debug for RequestCoalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("pending", &self.len())
            .finish()
    }
}

fn lock_table(table: &PendingTable) -> MutexGuard<'_, HashMap<String, Flight>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
