//! The in-memory inode handle.
//!
//! A handle is owned by the cache slot it occupies and shared by every
//! caller currently operating on its inode number. Attribute state lives
//! behind a single `RwLock`; the *item guard* (an async mutex) serializes
//! refresh against update so the handle's snapshot of its persisted index
//! values always matches what is actually on disk.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use tokio::sync::Mutex;

use crate::counters::Counters;
use crate::datawait::DataWait;
use crate::error::EngineError;
use crate::format::{InodeKind, InodeRecord, RecordTime};
use crate::index::INDEX_NR;

bitflags! {
    /// Persistent status flags of an inode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodeFlags: u32 {
        /// A truncate committed its new size but has not yet finished
        /// removing extents past it; completion must run before the next
        /// size change.
        const PENDING_TRUNCATE = 1 << 0;
    }
}

/// A second/nanosecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Seconds since the unix epoch.
    pub sec: u64,
    /// Nanoseconds within the second.
    pub nsec: u32,
}

impl Timestamp {
    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs(),
            nsec: elapsed.subsec_nanos(),
        }
    }
}

impl From<RecordTime> for Timestamp {
    fn from(t: RecordTime) -> Self {
        Self {
            sec: t.sec.get(),
            nsec: t.nsec.get(),
        }
    }
}

impl From<Timestamp> for RecordTime {
    fn from(t: Timestamp) -> Self {
        RecordTime::new(t.sec, t.nsec)
    }
}

/// The mutable attribute block of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeFields {
    /// File size in bytes.
    pub size: u64,
    /// Link count.
    pub nlink: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// File type and permission bits.
    pub mode: u32,
    /// Device number for special files.
    pub rdev: u32,
    /// Access time.
    pub atime: Timestamp,
    /// Modification time.
    pub mtime: Timestamp,
    /// Attribute-change time.
    pub ctime: Timestamp,
    /// Creation time.
    pub crtime: Timestamp,
    /// Transaction sequence of the last metadata change.
    pub meta_seq: u64,
    /// Transaction sequence of the last content change.
    pub data_seq: u64,
    /// Counter bumped whenever file content is replaced.
    pub data_version: u64,
    /// Content blocks resident locally.
    pub online_blocks: u64,
    /// Content blocks evicted to archive.
    pub offline_blocks: u64,
    /// Status flags.
    pub flags: InodeFlags,
    /// Directory-entry cursor, round-tripped for the directory subsystem.
    pub next_readdir_pos: u64,
    /// Xattr id cursor, round-tripped for the xattr subsystem.
    pub next_xattr_id: u64,
}

impl InodeFields {
    fn from_record(record: &InodeRecord) -> Self {
        Self {
            size: record.size.get(),
            nlink: record.nlink.get(),
            uid: record.uid.get(),
            gid: record.gid.get(),
            mode: record.mode.get(),
            rdev: record.rdev.get(),
            atime: record.atime.into(),
            mtime: record.mtime.into(),
            ctime: record.ctime.into(),
            crtime: record.crtime.into(),
            meta_seq: record.meta_seq.get(),
            data_seq: record.data_seq.get(),
            data_version: record.data_version.get(),
            online_blocks: record.online_blocks.get(),
            offline_blocks: record.offline_blocks.get(),
            flags: InodeFlags::from_bits_truncate(record.flags.get()),
            next_readdir_pos: record.next_readdir_pos.get(),
            next_xattr_id: record.next_xattr_id.get(),
        }
    }

    fn to_record(&self) -> InodeRecord {
        InodeRecord {
            size: self.size.into(),
            meta_seq: self.meta_seq.into(),
            data_seq: self.data_seq.into(),
            data_version: self.data_version.into(),
            online_blocks: self.online_blocks.into(),
            offline_blocks: self.offline_blocks.into(),
            next_readdir_pos: self.next_readdir_pos.into(),
            next_xattr_id: self.next_xattr_id.into(),
            nlink: self.nlink.into(),
            uid: self.uid.into(),
            gid: self.gid.into(),
            mode: self.mode.into(),
            rdev: self.rdev.into(),
            flags: self.flags.bits().into(),
            atime: self.atime.into(),
            mtime: self.mtime.into(),
            ctime: self.ctime.into(),
            crtime: self.crtime.into(),
        }
    }
}

/// The handle's snapshot of the index items currently on disk for it.
///
/// Guarded by the item mutex. `have_item` is false until the first
/// refresh or update lands; reconciliation uses the majors/minors to
/// compute which index items must be created and deleted.
#[derive(Debug, Clone, Default)]
pub struct ItemState {
    /// Whether a persistent record (and thus index items) exists.
    pub have_item: bool,
    /// Persisted major value per index type.
    pub majors: [u64; INDEX_NR],
    /// Persisted minor value per index type.
    pub minors: [u32; INDEX_NR],
}

impl ItemState {
    /// Record that `record` is now what is persisted.
    pub fn set_from(&mut self, record: &InodeRecord) {
        self.have_item = true;
        self.majors = [record.meta_seq.get(), record.data_seq.get()];
        self.minors = [0, 0];
    }
}

/// An in-memory inode.
#[derive(Debug)]
pub struct InodeHandle {
    ino: u64,
    fields: RwLock<InodeFields>,
    /// The lock refresh generation the cached fields reflect.
    last_refreshed: AtomicU64,
    /// Forced-eviction mark, set by the orphan scanner and by lock
    /// invalidation. Cleared on refresh.
    must_drop: AtomicBool,
    /// Local reference count, managed by the cache.
    pub(crate) refs: AtomicU64,
    /// Coalesced deferred releases not yet drained by the worker.
    pub(crate) pending_releases: AtomicU64,
    /// Whether the handle sits on the writeback set.
    pub(crate) writeback_linked: AtomicBool,
    /// Serializes refresh and update for this handle, and guards
    /// [`ItemState`].
    pub(crate) item: Mutex<ItemState>,
    /// Waits for offline extents to be staged back in.
    pub data_wait: DataWait,
}

impl InodeHandle {
    /// Build an unrefreshed handle for `ino`.
    #[must_use]
    pub fn new(ino: u64) -> Self {
        Self {
            ino,
            fields: RwLock::new(InodeFields {
                size: 0,
                nlink: 0,
                uid: 0,
                gid: 0,
                mode: 0,
                rdev: 0,
                atime: Timestamp::default(),
                mtime: Timestamp::default(),
                ctime: Timestamp::default(),
                crtime: Timestamp::default(),
                meta_seq: 0,
                data_seq: 0,
                data_version: 0,
                online_blocks: 0,
                offline_blocks: 0,
                flags: InodeFlags::empty(),
                next_readdir_pos: 0,
                next_xattr_id: 0,
            }),
            last_refreshed: AtomicU64::new(0),
            must_drop: AtomicBool::new(false),
            refs: AtomicU64::new(0),
            pending_releases: AtomicU64::new(0),
            writeback_linked: AtomicBool::new(false),
            item: Mutex::new(ItemState::default()),
            data_wait: DataWait::default(),
        }
    }

    /// The inode number. Immutable for the life of the handle.
    #[must_use]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Read access to the attribute block.
    pub fn fields(&self) -> RwLockReadGuard<'_, InodeFields> {
        self.fields
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Mutate the attribute block. The caller must hold the inode's
    /// cluster write lock; every mutation must be pushed to the item
    /// store via `update_and_persist` before that lock is released.
    pub fn update_fields<T>(&self, f: impl FnOnce(&mut InodeFields) -> T) -> T {
        let mut fields = self
            .fields
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut fields)
    }

    /// The inode kind derived from the cached mode.
    #[must_use]
    pub fn kind(&self) -> InodeKind {
        InodeKind::from_mode(self.fields().mode)
    }

    /// Cached file size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.fields().size
    }

    /// Cached link count.
    #[must_use]
    pub fn nlink(&self) -> u32 {
        self.fields().nlink
    }

    /// Sequence of the last metadata-changing transaction.
    #[must_use]
    pub fn meta_seq(&self) -> u64 {
        self.fields().meta_seq
    }

    /// Sequence of the last content-changing transaction.
    #[must_use]
    pub fn data_seq(&self) -> u64 {
        self.fields().data_seq
    }

    /// Current content version.
    #[must_use]
    pub fn data_version(&self) -> u64 {
        self.fields().data_version
    }

    /// `(online, offline)` block counts.
    #[must_use]
    pub fn onoff(&self) -> (u64, u64) {
        let fields = self.fields();
        (fields.online_blocks, fields.offline_blocks)
    }

    /// The refresh generation the cached fields reflect.
    #[must_use]
    pub fn last_refreshed(&self) -> u64 {
        self.last_refreshed.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_refreshed(&self, generation: u64) {
        self.last_refreshed.store(generation, Ordering::Release);
    }

    /// Whether the handle is marked for forced eviction.
    #[must_use]
    pub fn must_drop(&self) -> bool {
        self.must_drop.load(Ordering::Acquire)
    }

    /// Mark the handle for eviction once its last reference drops.
    pub fn set_must_drop(&self) {
        self.must_drop.store(true, Ordering::Release);
    }

    pub(crate) fn clear_must_drop(&self) {
        self.must_drop.store(false, Ordering::Release);
    }

    /// Current local reference count.
    #[must_use]
    pub fn ref_count(&self) -> u64 {
        self.refs.load(Ordering::Acquire)
    }

    /// Load a freshly read record into the handle. The caller holds the
    /// item guard.
    pub(crate) fn load_record(&self, record: &InodeRecord, item: &mut ItemState) {
        let mut fields = self
            .fields
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *fields = InodeFields::from_record(record);
        item.set_from(record);
    }

    /// Snapshot the handle into its record form.
    #[must_use]
    pub fn to_record(&self) -> InodeRecord {
        self.fields().to_record()
    }

    /// Stamp the metadata sequence to `seq` if it differs. The caller
    /// holds locks and a transaction hold, so the stamped value cannot be
    /// committed out from under it.
    pub fn set_meta_seq(&self, seq: u64) {
        self.update_fields(|fields| {
            if fields.meta_seq != seq {
                fields.meta_seq = seq;
            }
        });
    }

    /// Stamp the data sequence to `seq` if it differs.
    pub fn set_data_seq(&self, seq: u64) {
        self.update_fields(|fields| {
            if fields.data_seq != seq {
                fields.data_seq = seq;
            }
        });
    }

    /// Bump the content version.
    pub fn inc_data_version(&self) {
        self.update_fields(|fields| fields.data_version += 1);
    }

    /// Apply block-count deltas from the data subsystem.
    ///
    /// A delta that would drive either count negative means the inode and
    /// its extents went out of sync; it is reported as corruption, with
    /// the counts left saturated at zero rather than wrapped.
    pub fn add_onoff(
        &self,
        counters: &Counters,
        online: i64,
        offline: i64,
    ) -> Result<(), EngineError> {
        let mut result = Ok(());
        if online != 0 || offline != 0 {
            self.update_fields(|fields| {
                let new_online = fields.online_blocks as i64 + online;
                let new_offline = fields.offline_blocks as i64 + offline;
                if new_online < 0 || new_offline < 0 {
                    Counters::inc(&counters.corruption);
                    tracing::error!(
                        ino = self.ino,
                        size = fields.size,
                        online = fields.online_blocks,
                        online_delta = online,
                        offline = fields.offline_blocks,
                        offline_delta = offline,
                        "inode block counts out of sync with extents"
                    );
                    result = Err(EngineError::Corruption(format!(
                        "inode {} block counts would go negative",
                        self.ino
                    )));
                }
                fields.online_blocks = new_online.max(0) as u64;
                fields.offline_blocks = new_offline.max(0) as u64;
            });
        }

        // Any shrink of offline coverage may unblock staged-in waiters.
        if offline < 0 {
            self.data_wait.wake();
        }
        result
    }
}
