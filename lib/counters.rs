//! Diagnostic counters.
//!
//! Deletion never surfaces errors to unlinking callers, so these counters
//! (plus the structured logs) are the only way background progress and
//! trouble become observable.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counters for one engine instance.
///
/// All increments are relaxed; the counters are advisory diagnostics, not
/// synchronization.
#[derive(Debug, Default)]
pub struct Counters {
    /// Orphan scan passes started.
    pub orphan_scan: AtomicU64,
    /// Orphan markers visited by the scanner.
    pub orphan_scan_item: AtomicU64,
    /// Markers skipped because the inode was cached locally.
    pub orphan_scan_cached: AtomicU64,
    /// Markers skipped because the open bitmap showed a remote holder.
    pub orphan_scan_open: AtomicU64,
    /// Orphaned inodes the scanner instantiated for forced eviction.
    pub orphan_scan_read: AtomicU64,
    /// Scan passes that ended in an error.
    pub orphan_scan_error: AtomicU64,

    /// Index lock-and-hold attempts retried after the transaction
    /// sequence advanced under them.
    pub index_lock_retry: AtomicU64,
    /// Index reconciliations that found the new item already present.
    pub index_create_collision: AtomicU64,

    /// Final deletions that removed all of an inode's items.
    pub inode_deleted: AtomicU64,
    /// Deletion attempts that were no-ops because another attempt for the
    /// same inode number was already in flight.
    pub delete_dedup: AtomicU64,

    /// Invariant violations detected and reported.
    pub corruption: AtomicU64,
}

impl Counters {
    /// Bump a counter by one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter.
    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
