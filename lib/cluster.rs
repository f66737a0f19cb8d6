//! Contracts of the cluster-side collaborators.
//!
//! The engine consumes these; their implementations (server RPC, open-map
//! tracking, the extent and xattr stores) live elsewhere. Tests provide
//! in-process mocks.

use std::future::Future;
use std::sync::Arc;

use crate::error::EngineError;
use crate::lock::Lock;
use crate::store::ItemStore;

/// Inode numbers per open-bitmap group.
pub const OPEN_GROUP_SHIFT: u32 = 10;
/// Mask of the bit position within an open-bitmap group.
pub const OPEN_GROUP_MASK: u64 = (1 << OPEN_GROUP_SHIFT) - 1;
/// 64-bit words per open bitmap.
pub const OPEN_BITMAP_WORDS: usize = 1 << (OPEN_GROUP_SHIFT - 6);

/// Which inodes in one number group are open somewhere in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBitmap {
    /// The group this bitmap describes (`ino >> OPEN_GROUP_SHIFT`).
    pub group: u64,
    /// One bit per inode number in the group.
    pub bits: [u64; OPEN_BITMAP_WORDS],
}

impl OpenBitmap {
    /// An all-clear bitmap for `group`.
    #[must_use]
    pub fn empty(group: u64) -> Self {
        Self {
            group,
            bits: [0; OPEN_BITMAP_WORDS],
        }
    }

    /// Whether the bit for `bit_nr` (`ino & OPEN_GROUP_MASK`) is set.
    #[must_use]
    pub fn is_set(&self, bit_nr: u64) -> bool {
        let word = (bit_nr >> 6) as usize;
        self.bits[word] & (1 << (bit_nr & 63)) != 0
    }

    /// Set the bit for `bit_nr`.
    pub fn set(&mut self, bit_nr: u64) {
        let word = (bit_nr >> 6) as usize;
        self.bits[word] |= 1 << (bit_nr & 63);
    }
}

/// The cluster-wide inode number authority.
///
/// Numbers are handed out in batches to amortize round-trips and are
/// never reused, even if a node abandons the rest of its batch.
pub trait InoAuthority: Send + Sync + 'static {
    /// Reserve up to `count` fresh inode numbers. Returns the first
    /// number and how many were actually granted.
    fn alloc_inodes(
        &self,
        count: u64,
    ) -> impl Future<Output = Result<(u64, u64), EngineError>> + Send;
}

/// The open-reference/presence tracker.
///
/// Tracks which inode numbers are held open by which cluster members so
/// final deletion runs exactly when the last holder lets go.
pub trait OpenTracker: Send + Sync + 'static {
    /// Record that this node holds a reference to `ino`.
    fn increment(&self, ino: u64) -> Result<(), EngineError>;

    /// Drop this node's reference to `ino`.
    fn decrement(&self, ino: u64);

    /// Whether this node holds the last known cluster-wide reference to
    /// `ino`. The caller supplies the on-disk link count it observed
    /// under its write lock; deletion proceeds only if both the count is
    /// zero and no other member holds the inode open.
    fn should_delete(
        &self,
        ino: u64,
        nlink: u32,
    ) -> impl Future<Output = Result<bool, EngineError>> + Send;

    /// Fetch the open bitmap for a number group.
    fn open_bitmap(&self, group: u64)
    -> impl Future<Output = Result<OpenBitmap, EngineError>> + Send;
}

/// Delegated data-plane operations.
///
/// Content extents, extended attributes, and symlink target storage are
/// owned by other subsystems; the engine only drives their removal and
/// writeback from the deletion pipeline and the commit boundary.
pub trait DataOps: Send + Sync + 'static {
    /// Remove content extents of `ino` from `from_block` through
    /// `until_block` inclusive. May span many internal transactions for
    /// large files.
    fn truncate_extents(
        &self,
        ino: u64,
        from_block: u64,
        until_block: u64,
        lock: &Arc<Lock>,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Remove all extended-attribute items of `ino`.
    fn drop_xattrs(
        &self,
        ino: u64,
        lock: &Arc<Lock>,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Release the out-of-line target storage of a symlink.
    fn drop_symlink_target(
        &self,
        ino: u64,
        size: u64,
        lock: &Arc<Lock>,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Whether any offline (archived) extent overlaps the byte range
    /// `[start, end)` of `ino`.
    fn offline_in_range(&self, ino: u64, start: u64, end: u64) -> bool;

    /// Start writing out dirty cached content of `ino`.
    fn flush(&self, ino: u64) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Wait for previously started writeback of `ino` to finish.
    fn wait_flushed(&self, ino: u64) -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// Bundle of the services one mounted engine instance runs against.
pub trait Services: Send + Sync + 'static {
    /// The persistent item store implementation.
    type Store: ItemStore;
    /// The cluster lock service implementation.
    type Locks: crate::lock::LockManager;
    /// The inode-number authority implementation.
    type Authority: InoAuthority;
    /// The open-reference tracker implementation.
    type Opens: OpenTracker;
    /// The data-plane delegate implementation.
    type Data: DataOps;

    /// The item store.
    fn store(&self) -> &Self::Store;
    /// The lock service.
    fn locks(&self) -> &Self::Locks;
    /// The inode-number authority.
    fn authority(&self) -> &Self::Authority;
    /// The open tracker.
    fn opens(&self) -> &Self::Opens;
    /// The data delegate.
    fn data(&self) -> &Self::Data;
}
