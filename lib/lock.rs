//! Cluster lock facade.
//!
//! The lock service itself lives outside this crate; here is the contract
//! the engine consumes plus the fixed lock-region geometry. Regions clamp
//! exact keys to coarse, deterministic boundaries so that many nearby keys
//! share one lock, which bounds the number of locks per update and lets a
//! lock acquired for one value still cover the slightly-different value an
//! update settles on.

use std::future::Future;
use std::sync::Arc;

use crate::error::LockError;
use crate::format::{FS_ZONE, INODE_INDEX_ZONE, INODE_TYPE, ItemKey, ORPHAN_ZONE, ORPHAN_TYPE};

/// Inode numbers covered by one inode-zone lock.
pub const INODE_GROUP_SHIFT: u32 = 10;
/// Inode-zone lock group size.
pub const INODE_GROUP_SIZE: u64 = 1 << INODE_GROUP_SHIFT;

/// Sequence values clamped into one index lock region.
pub const INDEX_MAJOR_REGION_SHIFT: u32 = 16;
/// Inode numbers clamped into one index lock region.
pub const INDEX_INO_GROUP_SHIFT: u32 = 32;

/// How a lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared: cached reads stay coherent while held.
    Read,
    /// Exclusive: reads and writes.
    Write,
    /// Exclusive writes with no cached readable content — used for index
    /// and orphan regions where only item existence matters.
    WriteOnly,
}

/// An inclusive range of item keys covered by one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockRange {
    /// First covered key.
    pub start: ItemKey,
    /// Last covered key.
    pub end: ItemKey,
}

impl LockRange {
    /// Whether `key` falls inside this range.
    #[must_use]
    pub fn contains(&self, key: &ItemKey) -> bool {
        *key >= self.start && *key <= self.end
    }
}

/// A granted cluster lock.
///
/// `refresh_gen` increases every time the service grants coverage this
/// node did not already hold; cached state stamped with an older
/// generation may be stale and must be reloaded under the new grant.
#[derive(Debug)]
pub struct Lock {
    /// The covered key range.
    pub range: LockRange,
    /// The granted mode.
    pub mode: LockMode,
    /// Monotonic staleness generation for the covered range.
    pub refresh_gen: u64,
}

/// Contract of the cluster lock service.
///
/// `acquire` may block on network round-trips and remote lock release.
/// Granted locks are typically cached by the service after `release`, so
/// `is_covered` can stay true for a range with no outstanding guard —
/// until a remote node's conflicting request invalidates the grant.
pub trait LockManager: Send + Sync + 'static {
    /// Acquire a lock over `range` in `mode`.
    fn acquire(
        &self,
        range: LockRange,
        mode: LockMode,
    ) -> impl Future<Output = Result<Arc<Lock>, LockError>> + Send;

    /// Release a previously acquired lock.
    fn release(&self, lock: &Arc<Lock>);

    /// Whether this node currently holds (possibly cached) coverage for
    /// the inode's record range. Uncovered inodes must not linger in the
    /// local cache — they would block other nodes' final deletions.
    fn is_covered(&self, ino: u64) -> bool;
}

/// The inode-zone lock range covering `ino`.
#[must_use]
pub fn inode_lock_range(ino: u64) -> LockRange {
    let first = ino & !(INODE_GROUP_SIZE - 1);
    let last = first | (INODE_GROUP_SIZE - 1);
    LockRange {
        start: ItemKey {
            zone: FS_ZONE,
            item_type: 0,
            major: 0,
            minor: 0,
            ino: first,
        },
        end: ItemKey {
            zone: FS_ZONE,
            item_type: INODE_TYPE,
            major: u64::MAX,
            minor: u32::MAX,
            ino: last,
        },
    }
}

/// The orphan-zone lock range covering `ino`.
#[must_use]
pub fn orphan_lock_range(ino: u64) -> LockRange {
    let first = ino & !(INODE_GROUP_SIZE - 1);
    let last = first | (INODE_GROUP_SIZE - 1);
    LockRange {
        start: ItemKey {
            zone: ORPHAN_ZONE,
            item_type: 0,
            major: 0,
            minor: 0,
            ino: first,
        },
        end: ItemKey {
            zone: ORPHAN_ZONE,
            item_type: ORPHAN_TYPE,
            major: u64::MAX,
            minor: u32::MAX,
            ino: last,
        },
    }
}

/// Clamp an exact index value to its lock-region origin.
///
/// Index reconciliation clamps both the value it predicts and the value
/// it later settles on; as long as both land in the same region the one
/// acquired lock covers them.
#[must_use]
pub fn index_region_start(major: u64, minor: u32, ino: u64) -> (u64, u32, u64) {
    let _ = minor;
    (
        major & !((1u64 << INDEX_MAJOR_REGION_SHIFT) - 1),
        0,
        ino & !((1u64 << INDEX_INO_GROUP_SHIFT) - 1),
    )
}

/// The index-zone lock range for the region containing the given item.
#[must_use]
pub fn index_lock_range(item_type: u8, major: u64, minor: u32, ino: u64) -> LockRange {
    let (major_start, _, ino_start) = index_region_start(major, minor, ino);
    let major_end = major_start | ((1u64 << INDEX_MAJOR_REGION_SHIFT) - 1);
    let ino_end = ino_start | ((1u64 << INDEX_INO_GROUP_SHIFT) - 1);
    LockRange {
        start: ItemKey {
            zone: INODE_INDEX_ZONE,
            item_type,
            major: major_start,
            minor: 0,
            ino: ino_start,
        },
        end: ItemKey {
            zone: INODE_INDEX_ZONE,
            item_type,
            major: major_end,
            minor: u32::MAX,
            ino: ino_end,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::META_SEQ_TYPE;

    #[test]
    fn inode_range_covers_its_group() {
        let range = inode_lock_range(1500);
        assert!(range.contains(&ItemKey::inode(1024)));
        assert!(range.contains(&ItemKey::inode(2047)));
        assert!(!range.contains(&ItemKey::inode(2048)));
        assert!(!range.contains(&ItemKey::orphan(1500)));
    }

    #[test]
    fn nearby_index_values_share_a_region() {
        let a = index_lock_range(META_SEQ_TYPE, 5, 0, 100);
        let b = index_lock_range(META_SEQ_TYPE, 6, 0, 101);
        assert_eq!(a, b);

        let far = index_lock_range(META_SEQ_TYPE, 5 + (1 << INDEX_MAJOR_REGION_SHIFT), 0, 100);
        assert_ne!(a, far);
    }

    #[test]
    fn index_region_covers_clamped_and_exact_keys() {
        let range = index_lock_range(META_SEQ_TYPE, 70_000, 0, 3);
        assert!(range.contains(&ItemKey::index(META_SEQ_TYPE, 70_001, 0, 9)));
        assert!(!range.contains(&ItemKey::index(META_SEQ_TYPE, 5, 0, 9)));
    }
}
