//! Writeback tracking across the transaction boundary.
//!
//! Writers holding the transaction register inodes that may have dirty
//! cached content; the committer drains the set — start writeback, then
//! wait for it — without chasing dirty state through higher layers.
//! Entries can disappear underneath a drain as inodes are evicted.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::cluster::{DataOps, Services};
use crate::error::EngineError;
use crate::inode::InodeHandle;
use crate::lifecycle::MetaEngine;

/// What a drain pass does with each tracked inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Start writing out dirty pages.
    Flush,
    /// Wait for started writeback to finish; successfully waited inodes
    /// leave the set.
    Wait,
}

/// The set of handles that might have dirty cached content.
///
/// Kept in insertion order: data block allocation tends to advance
/// through free space, so draining oldest-first roughly encourages
/// sequential I/O.
#[derive(Debug, Default)]
pub struct WritebackSet {
    list: Mutex<Vec<Arc<InodeHandle>>>,
}

impl WritebackSet {
    /// Add a handle if it is not already tracked.
    pub fn insert(&self, handle: &Arc<InodeHandle>) {
        if handle
            .writeback_linked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.lock().push(Arc::clone(handle));
        }
    }

    /// Remove a handle, e.g. when it is evicted or fully written.
    pub fn unlink(&self, handle: &Arc<InodeHandle>) {
        if handle
            .writeback_linked
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.lock().retain(|tracked| !Arc::ptr_eq(tracked, handle));
        }
    }

    /// Current entries, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<Arc<InodeHandle>> {
        self.lock().clone()
    }

    /// Number of tracked handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<InodeHandle>>> {
        self.list
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<S: Services> MetaEngine<S> {
    /// Track `handle` as possibly holding dirty cached content.
    ///
    /// Idempotent. Called by writers who hold the inode and the
    /// transaction; the entry leaves the set when the inode is evicted or
    /// when a wait-mode drain confirms it clean.
    pub fn mark_dirty(&self, handle: &Arc<InodeHandle>) {
        self.writeback.insert(handle);
    }

    /// Drain the writeback set at the commit boundary.
    ///
    /// The committer has excluded concurrent writers, so after a
    /// successful `Wait` drain no dirty content remains. Handles that
    /// fail their I/O are handed to the deferred-release worker rather
    /// than processed further, and the error surfaces to the committer —
    /// which aborts the commit rather than publishing items whose content
    /// never hit the disk.
    pub async fn drain_writeback(&self, mode: DrainMode) -> Result<(), EngineError> {
        for handle in self.writeback.snapshot() {
            if !handle.writeback_linked.load(Ordering::Acquire) {
                // Evicted since the snapshot.
                continue;
            }
            if !self.try_grab(&handle) {
                continue;
            }

            let ino = handle.ino();
            let io = match mode {
                DrainMode::Flush => self.svc.data().flush(ino).await,
                DrainMode::Wait => self.svc.data().wait_flushed(ino).await,
            };
            if let Err(err) = io {
                tracing::warn!(ino, error = %err, "inode writeback failed");
                self.queue_release(handle);
                return Err(err);
            }

            if mode == DrainMode::Wait {
                self.writeback.unlink(&handle);
            }
            self.queue_release(handle);
        }
        Ok(())
    }
}
