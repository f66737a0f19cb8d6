//! Secondary index maintenance.
//!
//! Two valueless indexes mirror inode sequence fields: meta-seq over all
//! inodes and data-seq over regular files. For every live inode and every
//! applicable index exactly one item exists, keyed by the inode's current
//! sequence value. Updates create the new item before deleting the old
//! one and roll the creation back if the deletion fails; both items'
//! lock regions are acquired, in a strict total order, before the
//! transaction is entered.

use std::sync::Arc;

use crate::cluster::Services;
use crate::counters::Counters;
use crate::error::{EngineError, StoreError};
use crate::format::{DATA_SEQ_TYPE, InodeKind, InodeRecord, ItemKey, META_SEQ_TYPE};
use crate::inode::{InodeHandle, ItemState};
use crate::lock::{Lock, LockManager, LockMode, index_lock_range, index_region_start};
use crate::store::{ItemStore, TransHold, Transactions};

/// Number of index types.
pub const INDEX_NR: usize = 2;

/// The inode index types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    /// Ordered by the last metadata-changing transaction; all inodes.
    MetaSeq,
    /// Ordered by the last content-changing transaction; regular files.
    DataSeq,
}

impl IndexType {
    /// All index types, in item-type order.
    pub const ALL: [IndexType; INDEX_NR] = [IndexType::MetaSeq, IndexType::DataSeq];

    /// The on-disk item type byte.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::MetaSeq => META_SEQ_TYPE,
            Self::DataSeq => DATA_SEQ_TYPE,
        }
    }

    /// Position in [`ItemState`] arrays.
    #[must_use]
    pub fn idx(self) -> usize {
        match self {
            Self::MetaSeq => 0,
            Self::DataSeq => 1,
        }
    }

    /// Whether inodes of `kind` carry this index.
    #[must_use]
    pub fn applies_to(self, kind: InodeKind) -> bool {
        match self {
            Self::MetaSeq => true,
            Self::DataSeq => kind == InodeKind::File,
        }
    }

    fn major_of(self, record: &InodeRecord) -> u64 {
        match self {
            Self::MetaSeq => record.meta_seq.get(),
            Self::DataSeq => record.data_seq.get(),
        }
    }
}

/// The `(type, major, minor)` index values an inode's current in-memory
/// state maps to, one entry per index applicable to its kind.
///
/// Index queries elsewhere in the filesystem use this to locate an
/// inode's items; reconciliation keeps exactly one persistent item per
/// returned entry.
#[must_use]
pub fn index_values(handle: &InodeHandle) -> Vec<(IndexType, u64, u32)> {
    let kind = handle.kind();
    IndexType::ALL
        .into_iter()
        .filter(|ty| ty.applies_to(kind))
        .map(|ty| {
            let major = match ty {
                IndexType::MetaSeq => handle.meta_seq(),
                IndexType::DataSeq => handle.data_seq(),
            };
            (ty, major, 0)
        })
        .collect()
}

/// One lock region an upcoming index change needs, in clamped
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Region {
    item_type: u8,
    major: u64,
    minor: u32,
    ino: u64,
}

impl Region {
    fn clamped(item_type: u8, major: u64, minor: u32, ino: u64) -> Self {
        let (major, minor, ino) = index_region_start(major, minor, ino);
        Self {
            item_type,
            major,
            minor,
            ino,
        }
    }
}

/// The set of lock regions a single inode update will touch.
///
/// Regions are stored clamped and deduplicated, so an update whose old
/// and new values fall in the same region needs just one lock.
#[derive(Debug, Default)]
pub struct IndexLockSet {
    regions: Vec<Region>,
}

impl IndexLockSet {
    fn add(&mut self, item_type: u8, major: u64, minor: u32, ino: u64) {
        let region = Region::clamped(item_type, major, minor, ino);
        if !self.regions.contains(&region) {
            self.regions.push(region);
        }
    }

    fn prepare_one(
        &mut self,
        item: Option<&ItemState>,
        ino: u64,
        ty: IndexType,
        major: u64,
        minor: u32,
    ) {
        if will_insert(item, ty, major, minor) {
            self.add(ty.as_u8(), major, minor, ino);
        }
        if let Some(item) = item
            && will_delete(item, ty, major, minor)
        {
            self.add(ty.as_u8(), item.majors[ty.idx()], item.minors[ty.idx()], ino);
        }
    }

    /// Number of distinct lock regions in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

fn will_insert(item: Option<&ItemState>, ty: IndexType, major: u64, minor: u32) -> bool {
    match item {
        None => true,
        Some(item) => {
            !item.have_item || item.majors[ty.idx()] != major || item.minors[ty.idx()] != minor
        }
    }
}

fn will_delete(item: &ItemState, ty: IndexType, major: u64, minor: u32) -> bool {
    item.have_item && (item.majors[ty.idx()] != major || item.minors[ty.idx()] != minor)
}

/// The data-seq major an update is expected to settle on.
///
/// New inodes and updates that declare a content change get the current
/// transaction sequence; everything else keeps its persisted value.
fn predicted_data_seq(item: &ItemState, seq: u64, set_data_seq: bool) -> u64 {
    if !item.have_item || set_data_seq {
        seq
    } else {
        item.majors[IndexType::DataSeq.idx()]
    }
}

/// Index-region locks held for one transaction, plus the transaction
/// hold itself. Dropping releases everything.
pub struct HeldIndexLocks<'t, L: LockManager> {
    locks: &'t L,
    entries: Vec<(Region, Arc<Lock>)>,
    _hold: TransHold<'t>,
}

impl<L: LockManager> HeldIndexLocks<'_, L> {
    /// The lock covering the given exact index item.
    ///
    /// The caller prepared this set for exactly the values it is now
    /// modifying; a miss is a logic bug that would let an index change
    /// escape its lock, so it halts loudly instead of limping on.
    fn find(&self, item_type: u8, major: u64, minor: u32, ino: u64) -> &Arc<Lock> {
        let region = Region::clamped(item_type, major, minor, ino);
        self.entries
            .iter()
            .find(|(r, _)| *r == region)
            .map(|(_, lock)| lock)
            .unwrap_or_else(|| {
                panic!(
                    "no prepared index lock covers type {item_type} major {major} ino {ino}"
                )
            })
    }

    /// Number of held region locks.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.entries.len()
    }
}

impl<L: LockManager> Drop for HeldIndexLocks<'_, L> {
    fn drop(&mut self) {
        for (_, lock) in &self.entries {
            self.locks.release(lock);
        }
    }
}

/// Acquire the prepared regions in sorted order and enter the
/// transaction.
///
/// Returns `None` if the global sequence advanced between the caller's
/// snapshot and transaction entry — the predicted index values may be
/// stale and the caller must re-prepare against the newer sequence. The
/// retry is bounded by forward progress of the sequence itself: each
/// round re-samples a strictly newer value, so the loop cannot livelock
/// against its own stale snapshot.
async fn try_lock_hold<'t, L: LockManager>(
    locks: &'t L,
    trans: &'t Transactions,
    mut set: IndexLockSet,
    seq: u64,
) -> Result<Option<HeldIndexLocks<'t, L>>, EngineError> {
    // The sole deadlock-avoidance mechanism: every caller acquires index
    // regions in (type, major, minor, ino) order.
    set.regions.sort_unstable();

    let mut entries: Vec<(Region, Arc<Lock>)> = Vec::with_capacity(set.regions.len());
    for region in set.regions {
        let range = index_lock_range(region.item_type, region.major, region.minor, region.ino);
        match locks.acquire(range, LockMode::WriteOnly).await {
            Ok(lock) => entries.push((region, lock)),
            Err(err) => {
                for (_, lock) in &entries {
                    locks.release(lock);
                }
                return Err(err.into());
            }
        }
    }

    let hold = trans.hold().await;
    if trans.current_seq() != seq {
        drop(hold);
        for (_, lock) in &entries {
            locks.release(lock);
        }
        return Ok(None);
    }

    Ok(Some(HeldIndexLocks {
        locks,
        entries,
        _hold: hold,
    }))
}

/// Lock-and-hold for an anticipated update of `handle`.
///
/// `set_data_seq` declares whether the update will stamp the data
/// sequence (content changes); the meta sequence is always assumed to
/// move to the current transaction.
pub(crate) async fn lock_hold_for_update<'t, S: Services>(
    svc: &'t S,
    trans: &'t Transactions,
    counters: &Counters,
    handle: &InodeHandle,
    set_data_seq: bool,
) -> Result<HeldIndexLocks<'t, S::Locks>, EngineError> {
    let ino = handle.ino();
    let kind = handle.kind();
    loop {
        let seq = trans.current_seq();
        let mut set = IndexLockSet::default();
        {
            let item = handle.item.lock().await;
            for ty in IndexType::ALL {
                if !ty.applies_to(kind) {
                    continue;
                }
                let major = match ty {
                    IndexType::MetaSeq => seq,
                    IndexType::DataSeq => predicted_data_seq(&item, seq, set_data_seq),
                };
                set.prepare_one(Some(&*item), ino, ty, major, 0);
            }
        }
        match try_lock_hold(svc.locks(), trans, set, seq).await? {
            Some(held) => return Ok(held),
            None => Counters::inc(&counters.index_lock_retry),
        }
    }
}

/// Lock-and-hold for the initial index items of a newly allocated inode.
///
/// There is no previous item, so every applicable index will be created
/// at the current transaction sequence.
pub(crate) async fn lock_hold_for_new<'t, S: Services>(
    svc: &'t S,
    trans: &'t Transactions,
    counters: &Counters,
    ino: u64,
    kind: InodeKind,
) -> Result<HeldIndexLocks<'t, S::Locks>, EngineError> {
    loop {
        let seq = trans.current_seq();
        let mut set = IndexLockSet::default();
        for ty in IndexType::ALL {
            if ty.applies_to(kind) {
                set.prepare_one(None, ino, ty, seq, 0);
            }
        }
        match try_lock_hold(svc.locks(), trans, set, seq).await? {
            Some(held) => return Ok(held),
            None => Counters::inc(&counters.index_lock_retry),
        }
    }
}

/// Lock-and-hold for deleting all index items of an inode.
///
/// The values are already known from the just-read record, so no
/// prediction is involved; the sequence re-check still applies because
/// the locks must be acquired before the transaction is entered.
pub(crate) async fn lock_hold_for_deletion<'t, S: Services>(
    svc: &'t S,
    trans: &'t Transactions,
    counters: &Counters,
    ino: u64,
    record: &InodeRecord,
) -> Result<HeldIndexLocks<'t, S::Locks>, EngineError> {
    let kind = record.kind();
    loop {
        let seq = trans.current_seq();
        let mut set = IndexLockSet::default();
        for ty in IndexType::ALL {
            if ty.applies_to(kind) {
                set.add(ty.as_u8(), ty.major_of(record), 0, ino);
            }
        }
        match try_lock_hold(svc.locks(), trans, set, seq).await? {
            Some(held) => return Ok(held),
            None => Counters::inc(&counters.index_lock_retry),
        }
    }
}

/// Bring the index items in line with `record`.
///
/// For each applicable type whose persisted value differs: create the new
/// item, then delete the old one. Creation is ordered strictly first so a
/// failure leaves the inode indexed under its old value; a deletion
/// failure rolls the creation back. A rollback failure would leave two
/// index items for one inode, so it halts the process rather than
/// continuing with a corrupt index.
pub(crate) fn update_index_items<St: ItemStore, L: LockManager>(
    store: &St,
    counters: &Counters,
    held: &HeldIndexLocks<'_, L>,
    item: &ItemState,
    ino: u64,
    kind: InodeKind,
    record: &InodeRecord,
) -> Result<(), EngineError> {
    for ty in IndexType::ALL {
        if !ty.applies_to(kind) {
            continue;
        }
        let major = ty.major_of(record);

        if !will_insert(Some(item), ty, major, 0) {
            continue;
        }

        let ins_key = ItemKey::index(ty.as_u8(), major, 0, ino);
        let ins_lock = held.find(ty.as_u8(), major, 0, ino);
        tracing::trace!(ino, ty = ty.as_u8(), major, "creating index item");
        let created = store.create_force(&ins_key, &[], ins_lock)?;
        if !created {
            // Idempotent for us, but an item should never pre-exist under
            // a value we are only now moving to.
            Counters::inc(&counters.index_create_collision);
            tracing::error!(ino, ty = ty.as_u8(), major, "index item already existed");
        }

        if !will_delete(item, ty, major, 0) {
            continue;
        }

        let old_major = item.majors[ty.idx()];
        let old_minor = item.minors[ty.idx()];
        let del_key = ItemKey::index(ty.as_u8(), old_major, old_minor, ino);
        let del_lock = held.find(ty.as_u8(), old_major, old_minor, ino);
        tracing::trace!(ino, ty = ty.as_u8(), major = old_major, "deleting index item");
        if let Err(err) = store.delete_force(&del_key, del_lock) {
            if let Err(rollback) = store.delete_force(&ins_key, ins_lock) {
                tracing::error!(
                    ino,
                    ty = ty.as_u8(),
                    major,
                    error = %rollback,
                    "index rollback failed after old-item deletion error"
                );
                panic!("cannot roll back index item for inode {ino}; index would split");
            }
            return Err(err.into());
        }
    }

    Ok(())
}

/// Remove every index item of an inode during final deletion.
///
/// Racing index readers already tolerate inodes disappearing between a
/// query and their use of the result, and resumed deletions may find
/// items half-gone, so missing items are fine here.
pub(crate) fn remove_index_items<St: ItemStore, L: LockManager>(
    store: &St,
    held: &HeldIndexLocks<'_, L>,
    ino: u64,
    record: &InodeRecord,
) -> Result<(), EngineError> {
    let kind = record.kind();
    for ty in IndexType::ALL {
        if !ty.applies_to(kind) {
            continue;
        }
        let major = ty.major_of(record);
        let key = ItemKey::index(ty.as_u8(), major, 0, ino);
        let lock = held.find(ty.as_u8(), major, 0, ino);
        match store.delete_force(&key, lock) {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
