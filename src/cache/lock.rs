//! Lock Module
//!
//! Advisory cross-process lock implemented as a sibling `.lock` file.
//!
//! The lock file is created with exclusive-create semantics and holds the
//! owner's process id. A lock whose modification time is older than the
//! staleness threshold is treated as abandoned: it is renamed aside, checked
//! again, and removed.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::error::{CacheError, Result};

// == Lock Options ==
/// Timing parameters for lock acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Give up after waiting this long
    pub timeout: Duration,
    /// Locks older than this are reclaimed
    pub stale_after: Duration,
    /// Sleep between attempts
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

// == File Lock ==
/// A held lock. Dropping it removes the lock file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    // == Acquire ==
    /// Polls until the lock file at `path` is created by this process.
    ///
    /// Fails with `LockTimeout` once `options.timeout` elapses. A stale lock
    /// is removed and the attempt retried immediately; a stale lock that
    /// cannot be removed is waited on like a live one.
    pub fn acquire(path: impl Into<PathBuf>, options: &LockOptions) -> Result<Self> {
        let path = path.into();
        let started = Instant::now();
        let deadline = started + options.timeout;
        let mut reclaim_failed = false;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = write!(file, "{}", std::process::id()) {
                        debug!("Could not record pid in {}: {}", path.display(), e);
                    }
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match file_age(&path) {
                        Some(age) if age > options.stale_after => {
                            match reclaim_stale(&path, options.stale_after) {
                                Ok(Reclaim::Removed) => {
                                    warn!(
                                        "Removed stale cache lock {} (age {:?})",
                                        path.display(),
                                        age
                                    );
                                    continue;
                                }
                                Ok(Reclaim::Refreshed) => {
                                    debug!("Cache lock {} was taken over", path.display());
                                }
                                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                                Err(e) => {
                                    if !reclaim_failed {
                                        warn!(
                                            "Cannot remove stale cache lock {}: {}",
                                            path.display(),
                                            e
                                        );
                                        reclaim_failed = true;
                                    }
                                }
                            }
                        }
                        // Released between our attempt and the metadata read
                        None if !path.exists() => continue,
                        _ => {}
                    }

                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CacheError::LockTimeout {
                            path,
                            waited: started.elapsed(),
                        });
                    }
                    thread::sleep(options.poll_interval.min(deadline - now));
                }
                Err(e) => {
                    return Err(CacheError::io(
                        format!("creating lock file {}", path.display()),
                        e,
                    ))
                }
            }
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // == Release ==
    /// Releases the lock now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = release_lock(&self.path) {
            warn!("Failed to release cache lock {}: {}", self.path.display(), e);
        }
    }
}

/// Deletes the lock file at `path`. A missing file is not an error.
pub fn release_lock(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Returns `<data_path>.lock`.
pub fn lock_path_for(data_path: &Path) -> PathBuf {
    append_suffix(data_path, ".lock")
}

/// Appends `suffix` to the full file name (`cache.json` -> `cache.json.lock`).
pub(crate) fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn file_age(path: &Path) -> Option<Duration> {
    fs::metadata(path)
        .ok()
        .and_then(|meta| meta.modified().ok())
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
}

#[derive(Debug, PartialEq, Eq)]
enum Reclaim {
    /// The stale lock is gone
    Removed,
    /// Another process replaced the lock before it was moved; it was put back
    Refreshed,
}

static RECLAIM_SEQ: AtomicU64 = AtomicU64::new(0);

/// Moves the stale lock at `path` to a private name, then deletes it.
///
/// Only the renamed file is inspected and removed, so a lock created by
/// another process after the age check is never deleted.
fn reclaim_stale(path: &Path, stale_after: Duration) -> io::Result<Reclaim> {
    if !fs::symlink_metadata(path)?.is_file() {
        return Err(io::Error::new(
            ErrorKind::Other,
            "lock path is not a regular file",
        ));
    }

    let seq = RECLAIM_SEQ.fetch_add(1, Ordering::Relaxed);
    let aside = append_suffix(path, &format!(".stale.{}.{}", std::process::id(), seq));
    fs::rename(path, &aside)?;

    let still_stale = file_age(&aside).map_or(true, |age| age > stale_after);
    if !still_stale {
        // hard_link never overwrites, so a newer lock at `path` is kept
        let restored = match fs::hard_link(&aside, path) {
            Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e),
            _ => Ok(Reclaim::Refreshed),
        };
        let _ = fs::remove_file(&aside);
        return restored;
    }
    fs::remove_file(&aside)?;
    Ok(Reclaim::Removed)
}
