//! Abortable waits for offline content to come back online.
//!
//! A size-changing mutation cannot proceed while offline extents overlap
//! the affected range; the caller releases its locks, waits here, and
//! retries from the top. The wait must be abortable by an explicit error
//! injection so an administrator can unwedge callers stuck behind a slow
//! or dead archive recall.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::error::EngineError;

/// Per-inode wait queue for offline-extent staging.
#[derive(Debug, Default)]
pub struct DataWait {
    /// Bumped on every wake so waiters that raced a wake don't sleep
    /// through it.
    changed: AtomicU64,
    notify: Notify,
    injected: Mutex<Option<EngineError>>,
}

impl DataWait {
    /// Snapshot the progress counter.
    ///
    /// Take the snapshot *before* checking for offline extents; a wake
    /// that lands between the check and [`wait_from`](Self::wait_from)
    /// then releases the waiter instead of being lost.
    #[must_use]
    pub fn snapshot(&self) -> u64 {
        self.changed.load(Ordering::Acquire)
    }

    /// Wait until staging progress is signalled.
    ///
    /// Returns an injected error if one was posted before or during the
    /// wait. The caller must not hold the inode's write lock or item
    /// guard across this call.
    pub async fn wait(&self) -> Result<(), EngineError> {
        self.wait_from(self.snapshot()).await
    }

    /// Wait for progress past a previously taken snapshot.
    pub async fn wait_from(&self, seen: u64) -> Result<(), EngineError> {
        loop {
            if let Some(err) = self.take_injected() {
                return Err(err);
            }
            // Register before re-checking so a wake between the check and
            // the await is not lost.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.changed.load(Ordering::Acquire) != seen {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Signal waiters that offline coverage shrank.
    pub fn wake(&self) {
        self.changed.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Abort current and future waiters with `err` (one-shot: the first
    /// waiter to observe the injection consumes it).
    pub fn inject_error(&self, err: EngineError) {
        *self
            .injected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(err);
        self.changed.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    fn take_injected(&self) -> Option<EngineError> {
        self.injected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}
