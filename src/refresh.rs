//! Hot-reloading file cache.
//!
//! A [`RefreshingCache`] owns exactly one `(path, interval, apply)` triple:
//!
//! 1. [`RefreshingCache::new`] reads the file once, synchronously. If the file
//!    is unreadable or `apply` rejects it, no cache is produced.
//! 2. [`RefreshingCache::start`] spawns one background task that re-reads the
//!    file on every tick of `interval` and hands the bytes to `apply`.
//! 3. Cancelling the token passed to `start` ends the task. Whatever `apply`
//!    last published stays readable.
//!
//! `apply` owns its own atomicity: parse into a temporary value, then publish
//! it with [`Snapshot::swap`]. A failed reload is logged and the previous
//! state is left untouched; the next tick is the retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Parse-and-publish callback invoked with the raw file contents.
type ApplyFn = dyn Fn(&[u8]) -> std::result::Result<(), String> + Send + Sync;

/// Atomically swappable, shared snapshot.
///
/// Readers take a read-lock and clone the inner `Arc`; writers replace the
/// whole `Arc` under a write-lock, so a reader always holds one complete
/// generation and the write-lock is held only for the pointer swap.
pub struct Snapshot<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Snapshot<T> {
    /// Create a snapshot seeded with `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(value))),
        }
    }

    /// Current generation.
    #[must_use]
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.inner.read())
    }

    /// Publish a fully-built replacement.
    pub fn swap(&self, value: T) {
        let next = Arc::new(value);
        *self.inner.write() = next;
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Snapshot").field(&*self.load()).finish()
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// File-backed cache refreshed on a fixed interval.
pub struct RefreshingCache {
    path: PathBuf,
    interval: Duration,
    apply: Arc<ApplyFn>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshingCache {
    /// Load `path` once and build the cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or `apply`
    /// rejects its contents.
    pub fn new<F>(path: impl Into<PathBuf>, interval: Duration, apply: F) -> Result<Self>
    where
        F: Fn(&[u8]) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        let path = path.into();
        if interval.is_zero() {
            return Err(Error::Config(format!(
                "refresh interval for {} must be greater than zero",
                path.display()
            )));
        }

        let cache = Self {
            path,
            interval,
            apply: Arc::new(apply),
            task: Mutex::new(None),
        };
        cache.reload()?;
        Ok(cache)
    }

    /// File this cache reads.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Refresh interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Re-read the file and apply it once, synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on read or apply failure; the previously
    /// applied state is unchanged in that case.
    pub fn reload(&self) -> Result<()> {
        let bytes = std::fs::read(&self.path).map_err(|e| read_error(&self.path, &e))?;
        apply_bytes(&self.path, self.apply.as_ref(), &bytes)
    }

    /// Spawn the background refresh task.
    ///
    /// Only one task runs per cache; calling `start` while it is alive is a
    /// no-op. Must be called within a Tokio runtime.
    pub fn start(&self, cancel: CancellationToken) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(path = %self.path.display(), "Refresh task already running");
            return;
        }

        let path = self.path.clone();
        let apply = Arc::clone(&self.apply);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        *task = Some(tokio::spawn(async move {
            // The first tick completes immediately; the initial load already
            // happened in `new`.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(path = %path.display(), "Refresh task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let result = match tokio::fs::read(&path).await {
                            Ok(bytes) => apply_bytes(&path, apply.as_ref(), &bytes),
                            Err(e) => Err(read_error(&path, &e)),
                        };
                        match result {
                            Ok(()) => debug!(path = %path.display(), "File refreshed"),
                            Err(e) => warn!(
                                path = %path.display(),
                                error = %e,
                                "Refresh failed, keeping previous snapshot"
                            ),
                        }
                    }
                }
            }
        }));
    }

    /// Whether the background task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for RefreshingCache {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for RefreshingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshingCache")
            .field("path", &self.path)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

fn apply_bytes(path: &Path, apply: &ApplyFn, bytes: &[u8]) -> Result<()> {
    apply(bytes).map_err(|e| {
        Error::Config(format!(
            "failed to apply data from file {}: {e}",
            path.display()
        ))
    })
}

fn read_error(path: &Path, err: &std::io::Error) -> Error {
    Error::Config(format!("failed to read file {}: {err}", path.display()))
}
