//! Persistent item store contract and the transaction sequence context.
//!
//! The store is an ordered key-value map that participates in atomic
//! multi-item transactions; its implementation (log trees, merging,
//! device I/O) lives outside this crate. Every consistent operation is
//! parameterized by the cluster lock covering the key.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StoreError;
use crate::format::ItemKey;
use crate::lock::Lock;

/// Contract of the persistent item store.
///
/// The `_force` variants work under write-only locks: they neither read
/// nor populate cached item state, only assert existence or absence.
/// `next_committed` reads the authoritative merged view — items that have
/// reached the shared persistent roots, excluding this node's uncommitted
/// working set — and needs no lock; scanners that use it must tolerate
/// going out of sync with racing writers.
pub trait ItemStore: Send + Sync + 'static {
    /// Look up the value stored under exactly `key`.
    fn lookup_exact(&self, key: &ItemKey, lock: &Arc<Lock>) -> Result<Vec<u8>, StoreError>;

    /// Create a new item; [`StoreError::Exists`] if the key is taken.
    fn create(&self, key: &ItemKey, value: &[u8], lock: &Arc<Lock>) -> Result<(), StoreError>;

    /// Create or overwrite an item. Returns `true` if the item was newly
    /// created, `false` if an item already existed under the key.
    fn create_force(
        &self,
        key: &ItemKey,
        value: &[u8],
        lock: &Arc<Lock>,
    ) -> Result<bool, StoreError>;

    /// Replace the value of an existing item.
    fn update(&self, key: &ItemKey, value: &[u8], lock: &Arc<Lock>) -> Result<(), StoreError>;

    /// Delete an existing item.
    fn delete(&self, key: &ItemKey, lock: &Arc<Lock>) -> Result<(), StoreError>;

    /// Delete an item under a write-only lock.
    fn delete_force(&self, key: &ItemKey, lock: &Arc<Lock>) -> Result<(), StoreError>;

    /// Return the first item with key in `[key, bound]`.
    fn next(
        &self,
        key: &ItemKey,
        bound: &ItemKey,
        lock: &Arc<Lock>,
    ) -> Result<(ItemKey, Vec<u8>), StoreError>;

    /// Like [`next`](Self::next) but over the authoritative merged view,
    /// without lock consistency.
    fn next_committed(&self, key: &ItemKey, bound: &ItemKey)
    -> Result<(ItemKey, Vec<u8>), StoreError>;
}

/// A held transaction: item mutations made while this guard lives land in
/// the same commit.
pub type TransHold<'a> = RwLockReadGuard<'a, ()>;

/// Exclusive access for the transaction committer.
pub struct TransCommit<'a> {
    trans: &'a Transactions,
    _gate: RwLockWriteGuard<'a, ()>,
}

impl TransCommit<'_> {
    /// Finish the commit, advancing the global sequence. Returns the new
    /// sequence, which subsequent holders will observe.
    pub fn finish(self) -> u64 {
        self.trans.seq.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// The process-wide transaction sequence, with explicit lifecycle.
///
/// Initialized at mount from the volume's last committed sequence and
/// advanced only by the transaction committer. Writers `hold()` the
/// current transaction open (shared); the committer excludes them
/// (exclusive), writes out the dirty items, and bumps the sequence.
#[derive(Debug)]
pub struct Transactions {
    seq: AtomicU64,
    gate: RwLock<()>,
}

impl Transactions {
    /// Start the sequence context at `seq` (the volume's last commit).
    #[must_use]
    pub fn new(seq: u64) -> Self {
        Self {
            seq: AtomicU64::new(seq),
            gate: RwLock::new(()),
        }
    }

    /// Consistent snapshot of the current transaction sequence.
    #[must_use]
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Join the currently open transaction, excluding commit until the
    /// returned hold is dropped.
    pub async fn hold(&self) -> TransHold<'_> {
        self.gate.read().await
    }

    /// Begin a commit: waits for all holders to drain and blocks new ones
    /// until [`TransCommit::finish`] runs or the guard is dropped.
    pub async fn commit_begin(&self) -> TransCommit<'_> {
        TransCommit {
            trans: self,
            _gate: self.gate.write().await,
        }
    }

    /// Convenience for committers with nothing else to do between
    /// draining holders and advancing the sequence.
    pub async fn commit(&self) -> u64 {
        self.commit_begin().await.finish()
    }
}
