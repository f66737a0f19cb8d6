//! Inode lifecycle: cache, allocation, creation, refresh, update,
//! unlink, and the multi-phase deletion pipeline.
//!
//! An inode number moves `unallocated → allocated → live → orphaned →
//! deleting → gone`. The cache maps inode numbers to tagged slots; slots
//! mid-eviction are hidden from lookup so a fresh instantiation never
//! waits on an eviction that may itself be waiting on a cluster lock the
//! instantiation holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{DataOps, InoAuthority, OpenTracker, Services};
use crate::config::EngineConfig;
use crate::counters::Counters;
use crate::error::{EngineError, StoreError};
use crate::format::{BLOCK_SIZE, InodeKind, InodeRecord, ItemKey};
use crate::index::{self, HeldIndexLocks};
use crate::inode::{InodeFlags, InodeHandle, Timestamp};
use crate::lock::{Lock, LockManager, LockMode, inode_lock_range, orphan_lock_range};
use crate::store::{ItemStore, Transactions};
use crate::writeback::WritebackSet;

/// A cache slot for one inode number.
///
/// `Loading` carries a watch receiver other lookups await; the sender is
/// dropped when loading resolves either way. `Freeing` keeps an in-flight
/// eviction's claim on the slot while staying invisible to lookups — a
/// new instantiation may displace it, and the eviction's final removal is
/// conditional on the slot still holding its own handle.
enum Slot {
    Loading(watch::Receiver<()>),
    Live(Arc<InodeHandle>),
    Freeing(Arc<InodeHandle>),
}

/// Locally reserved inode numbers for one category.
#[derive(Debug, Default)]
struct InoPool {
    next: u64,
    remaining: u64,
}

/// Requested attributes of a new inode.
#[derive(Debug, Clone, Copy)]
pub struct NewInode {
    /// File type and permission bits.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Device number for special files.
    pub rdev: u32,
}

/// Membership in the currently-deleting set; insertion is the atomic
/// test-and-set that deduplicates concurrent deletion attempts.
struct DeletingGuard<'a> {
    set: &'a scc::HashSet<u64>,
    ino: u64,
}

impl<'a> DeletingGuard<'a> {
    fn try_claim(set: &'a scc::HashSet<u64>, ino: u64) -> Option<Self> {
        set.insert_sync(ino).ok().map(|()| Self { set, ino })
    }
}

impl Drop for DeletingGuard<'_> {
    fn drop(&mut self) {
        drop(self.set.remove_sync(&self.ino));
    }
}

/// Removes a `Loading` slot if instantiation bails out or is cancelled,
/// so waiters retry instead of hanging on a dead sender.
struct LoadGuard<'a> {
    cache: &'a scc::HashMap<u64, Slot>,
    ino: u64,
    armed: bool,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            drop(
                self.cache
                    .remove_if_sync(&self.ino, |slot| matches!(slot, Slot::Loading(_))),
            );
        }
    }
}

/// The inode metadata engine of one mounted node.
pub struct MetaEngine<S: Services> {
    pub(crate) svc: Arc<S>,
    pub(crate) trans: Arc<Transactions>,
    pub(crate) config: EngineConfig,
    pub(crate) counters: Arc<Counters>,
    pub(crate) writeback: WritebackSet,

    cache: scc::HashMap<u64, Slot>,
    deleting: scc::HashSet<u64>,

    /// Non-directory and directory number pools, in that order.
    pools: [Mutex<InoPool>; 2],
    last_ino: AtomicU64,

    release_tx: mpsc::UnboundedSender<Arc<InodeHandle>>,
    release_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<InodeHandle>>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Services> MetaEngine<S> {
    /// Build an engine over the given services and transaction context.
    ///
    /// Background workers don't run until [`start`](Self::start).
    #[must_use]
    pub fn new(svc: Arc<S>, trans: Arc<Transactions>, config: EngineConfig) -> Arc<Self> {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            svc,
            trans,
            config,
            counters: Arc::new(Counters::default()),
            writeback: WritebackSet::default(),
            cache: scc::HashMap::new(),
            deleting: scc::HashSet::new(),
            pools: [Mutex::new(InoPool::default()), Mutex::new(InoPool::default())],
            last_ino: AtomicU64::new(0),
            release_tx,
            release_rx: Mutex::new(Some(release_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the deferred-release worker and the orphan scanner.
    ///
    /// Call once the collaborating services are ready; the scanner
    /// instantiates inodes and must not run before they are.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = lock_poisonless(&self.tasks);
        if let Some(rx) = lock_poisonless(&self.release_rx).take() {
            tasks.push(tokio::spawn(release_worker(
                Arc::clone(self),
                rx,
                self.shutdown.clone(),
            )));
        }
        tasks.push(crate::orphan::spawn_scanner(
            Arc::clone(self),
            self.shutdown.clone(),
        ));
    }

    /// Stop background work, synchronously awaiting in-flight iterations.
    ///
    /// Must complete before dependent subsystems tear down — the scanner
    /// instantiates inodes and would otherwise race teardown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = lock_poisonless(&self.tasks).drain(..).collect();
        for task in tasks {
            drop(task.await);
        }
    }

    /// The engine's diagnostic counters.
    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The transaction sequence context this engine runs against.
    #[must_use]
    pub fn transactions(&self) -> &Arc<Transactions> {
        &self.trans
    }

    /// The writeback set, for committer bookkeeping.
    #[must_use]
    pub fn writeback(&self) -> &WritebackSet {
        &self.writeback
    }

    // ---- inode number allocation ----

    /// Return a fresh, never-used inode number.
    ///
    /// Directories draw from their own pool so that files created
    /// together in one directory cluster in the item space. When a pool
    /// runs dry a whole batch is requested from the cluster authority;
    /// numbers left over at unmount are simply abandoned.
    pub async fn alloc_ino(&self, is_dir: bool) -> Result<u64, EngineError> {
        let pool_nr = usize::from(is_dir);
        loop {
            {
                let mut pool = lock_poisonless(&self.pools[pool_nr]);
                if pool.remaining > 0 {
                    let ino = pool.next;
                    pool.next += 1;
                    pool.remaining -= 1;
                    self.last_ino.fetch_max(ino, Ordering::AcqRel);
                    return Ok(ino);
                }
            }

            let want = self.config.ino_batch_size();
            let (first, granted) = self.svc.authority().alloc_inodes(want).await?;
            if granted == 0 {
                return Err(EngineError::NoSpace);
            }
            let mut pool = lock_poisonless(&self.pools[pool_nr]);
            if pool.remaining == 0 {
                pool.next = first;
                pool.remaining = granted;
            }
            // A lost refill race abandons our batch; numbers are never
            // reused so the gap is harmless.
        }
    }

    /// The highest inode number this node has handed out.
    #[must_use]
    pub fn last_ino(&self) -> u64 {
        self.last_ino.load(Ordering::Acquire)
    }

    // ---- cache and instantiation ----

    /// Whether `ino` has a cache presence (live or still loading).
    #[must_use]
    pub fn cached(&self, ino: u64) -> bool {
        self.cache
            .read_sync(&ino, |_, slot| !matches!(slot, Slot::Freeing(_)))
            .unwrap_or(false)
    }

    /// Resolve `ino` to a referenced handle, instantiating and refreshing
    /// it from the item store if needed.
    ///
    /// The returned reference must be balanced with [`release`](Self::release)
    /// or [`queue_release`](Self::queue_release).
    pub async fn get_or_create_handle(&self, ino: u64) -> Result<Arc<InodeHandle>, EngineError> {
        let lock = self
            .svc
            .locks()
            .acquire(inode_lock_range(ino), LockMode::Read)
            .await?;
        let result = self.get_or_create_locked(ino, &lock).await;
        self.svc.locks().release(&lock);
        result
    }

    async fn get_or_create_locked(
        &self,
        ino: u64,
        lock: &Arc<Lock>,
    ) -> Result<Arc<InodeHandle>, EngineError> {
        use scc::hash_map::Entry;

        loop {
            enum Step {
                Hit(Arc<InodeHandle>),
                Wait(watch::Receiver<()>),
                Build(watch::Sender<()>),
            }

            let step = match self.cache.entry_async(ino).await {
                Entry::Occupied(mut occ) => {
                    let found = match occ.get() {
                        Slot::Live(cached) => {
                            cached.refs.fetch_add(1, Ordering::AcqRel);
                            Some(Step::Hit(Arc::clone(cached)))
                        }
                        Slot::Loading(rx) => Some(Step::Wait(rx.clone())),
                        // Mid-eviction slots are treated as absent; take
                        // over the slot and build a fresh instance.
                        Slot::Freeing(_) => None,
                    };
                    match found {
                        Some(step) => step,
                        None => {
                            let (tx, rx) = watch::channel(());
                            *occ.get_mut() = Slot::Loading(rx);
                            Step::Build(tx)
                        }
                    }
                }
                Entry::Vacant(vac) => {
                    let (tx, rx) = watch::channel(());
                    drop(vac.insert_entry(Slot::Loading(rx)));
                    Step::Build(tx)
                }
            };

            match step {
                Step::Hit(handle) => {
                    if let Err(err) = self.refresh(&handle, lock).await {
                        self.release(handle).await;
                        return Err(err);
                    }
                    return Ok(handle);
                }
                Step::Wait(mut rx) => {
                    // Either outcome (resolved or builder bailed) drops
                    // the sender; re-check the slot.
                    drop(rx.changed().await);
                }
                Step::Build(tx) => {
                    let mut guard = LoadGuard {
                        cache: &self.cache,
                        ino,
                        armed: true,
                    };
                    let handle = Arc::new(InodeHandle::new(ino));
                    handle.refs.store(1, Ordering::Release);

                    let loaded: Result<(), EngineError> = async {
                        self.refresh(&handle, lock).await?;
                        self.svc.opens().increment(ino)?;
                        Ok(())
                    }
                    .await;

                    return match loaded {
                        Ok(()) => {
                            drop(
                                self.cache
                                    .update_async(&ino, |_, slot| {
                                        *slot = Slot::Live(Arc::clone(&handle));
                                    })
                                    .await,
                            );
                            guard.armed = false;
                            drop(tx);
                            Ok(handle)
                        }
                        Err(err) => {
                            drop(guard);
                            drop(tx);
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    /// Make the handle's cached fields coherent with the persistent
    /// record as of the lock's refresh generation.
    ///
    /// Many holders of the same lock can race through here; refreshers
    /// serialize on the item guard and later arrivals see the already
    /// stamped generation.
    pub async fn refresh(&self, handle: &InodeHandle, lock: &Arc<Lock>) -> Result<(), EngineError> {
        let refresh_gen = lock.refresh_gen;
        let last = handle.last_refreshed();

        // Generations strictly increase. A handle ahead of its lock means
        // memory corruption or a lifetime bug that would pin stale data
        // forever; there is no recovering from it.
        assert!(
            last <= refresh_gen,
            "inode {} refreshed at gen {last}, lock is at gen {refresh_gen}",
            handle.ino()
        );
        if last == refresh_gen {
            return Ok(());
        }

        let mut item = handle.item.lock().await;
        if handle.last_refreshed() < refresh_gen {
            let bytes = self
                .svc
                .store()
                .lookup_exact(&ItemKey::inode(handle.ino()), lock)?;
            let record = InodeRecord::decode(&bytes)?;
            handle.load_record(&record, &mut item);
            handle.set_last_refreshed(refresh_gen);
            handle.clear_must_drop();
        }
        Ok(())
    }

    // ---- mutation and persistence ----

    /// Acquire the index-region locks an update of `handle` will need and
    /// enter the transaction. `set_data_seq` declares a content change.
    pub async fn hold_index_locks(
        &self,
        handle: &InodeHandle,
        set_data_seq: bool,
    ) -> Result<HeldIndexLocks<'_, S::Locks>, EngineError> {
        index::lock_hold_for_update(
            self.svc.as_ref(),
            &self.trans,
            &self.counters,
            handle,
            set_data_seq,
        )
        .await
    }

    /// Like [`hold_index_locks`](Self::hold_index_locks) for an inode
    /// that does not exist yet.
    pub async fn hold_index_locks_for_new(
        &self,
        ino: u64,
        kind: InodeKind,
    ) -> Result<HeldIndexLocks<'_, S::Locks>, EngineError> {
        index::lock_hold_for_new(self.svc.as_ref(), &self.trans, &self.counters, ino, kind).await
    }

    /// Pin a dirty inode record so the update after an in-memory
    /// mutation cannot fail for lack of space.
    ///
    /// The interim dirty record is observable by lookups, so it carries
    /// the handle's current contents. Callers must hold the transaction
    /// (via index locks) between dirtying and updating, and don't undo
    /// the dirty record on error — it is still valid.
    pub fn dirty_record(&self, handle: &InodeHandle, lock: &Arc<Lock>) -> Result<(), EngineError> {
        let record = handle.to_record();
        self.svc
            .store()
            .update(&ItemKey::inode(handle.ino()), &record.encode(), lock)?;
        Ok(())
    }

    /// Push the handle's state to its record item, bringing the index
    /// items along.
    ///
    /// Runs entirely under the item guard: the meta sequence is stamped,
    /// one record snapshot is taken, indexes are reconciled against the
    /// snapshot, and the record is written. The caller holds the inode's
    /// write lock and `held` must cover every index item that can change,
    /// acquired for this exact mutation.
    pub async fn update_and_persist(
        &self,
        handle: &InodeHandle,
        lock: &Arc<Lock>,
        held: &HeldIndexLocks<'_, S::Locks>,
    ) -> Result<(), EngineError> {
        let ino = handle.ino();
        let mut item = handle.item.lock().await;

        handle.set_meta_seq(self.trans.current_seq());

        // One snapshot: indexes and the record item must agree even if
        // another field store races the encoding.
        let record = handle.to_record();

        index::update_index_items(
            self.svc.store(),
            &self.counters,
            held,
            &item,
            ino,
            record.kind(),
            &record,
        )?;

        if let Err(err) = self
            .svc
            .store()
            .update(&ItemKey::inode(ino), &record.encode(), lock)
        {
            // Callers pre-dirty the record precisely so this write cannot
            // fail; the vfs-visible mutation cannot be unwound from here.
            tracing::error!(ino, error = %err, "inode record update failed");
            panic!("inode {ino} record update failed after index reconcile");
        }

        item.set_from(&record);
        Ok(())
    }

    /// Allocate and persist a brand-new inode under the caller's write
    /// lock and transaction hold.
    ///
    /// Either the record and the cluster-wide open reference both land or
    /// the operation unwinds completely. The caller establishes the index
    /// items with [`update_and_persist`](Self::update_and_persist) in the
    /// same transaction, under locks from
    /// [`hold_index_locks_for_new`](Self::hold_index_locks_for_new).
    pub async fn create_inode(
        &self,
        ino: u64,
        new: &NewInode,
        lock: &Arc<Lock>,
    ) -> Result<Arc<InodeHandle>, EngineError> {
        use scc::hash_map::Entry;

        let handle = Arc::new(InodeHandle::new(ino));
        let now = Timestamp::now();
        let seq = self.trans.current_seq();
        handle.update_fields(|fields| {
            fields.mode = new.mode;
            fields.uid = new.uid;
            fields.gid = new.gid;
            fields.rdev = new.rdev;
            fields.nlink = 1;
            fields.atime = now;
            fields.mtime = now;
            fields.ctime = now;
            fields.crtime = now;
            fields.meta_seq = seq;
            fields.data_seq = seq;
        });
        handle.refs.store(1, Ordering::Release);
        handle.set_last_refreshed(lock.refresh_gen);

        self.svc.opens().increment(ino)?;

        let record = handle.to_record();
        if let Err(err) = self
            .svc
            .store()
            .create(&ItemKey::inode(ino), &record.encode(), lock)
        {
            self.svc.opens().decrement(ino);
            return Err(err.into());
        }

        match self.cache.entry_async(ino).await {
            Entry::Vacant(vac) => drop(vac.insert_entry(Slot::Live(Arc::clone(&handle)))),
            Entry::Occupied(_) => {
                // Fresh numbers are never reused; a pre-existing slot
                // means the allocator or the authority double-issued.
                Counters::inc(&self.counters.corruption);
                tracing::error!(ino, "newly allocated inode number already cached");
                drop(self.svc.store().delete(&ItemKey::inode(ino), lock));
                self.svc.opens().decrement(ino);
                return Err(EngineError::Corruption(format!(
                    "inode number {ino} issued twice"
                )));
            }
        }

        Ok(handle)
    }

    /// Change a regular file's size.
    ///
    /// Replacing content bumps the data version, which forbids offline
    /// extents inside the new size: they are staged back in first. The
    /// wait runs with no locks held — the lock is released, the caller
    /// sleeps, and the whole operation retries from the top, so a slow
    /// archive recall cannot wedge cluster-wide access to the inode.
    pub async fn set_size(
        &self,
        handle: &Arc<InodeHandle>,
        new_size: u64,
    ) -> Result<(), EngineError> {
        let ino = handle.ino();
        loop {
            let lock = self
                .svc
                .locks()
                .acquire(inode_lock_range(ino), LockMode::Write)
                .await?;
            let attempt = self.try_set_size(handle, new_size, &lock).await;
            self.svc.locks().release(&lock);
            match attempt? {
                None => return Ok(()),
                Some(wait_from) => handle.data_wait.wait_from(wait_from).await?,
            }
        }
    }

    /// Like [`set_size`](Self::set_size), but only if the content is
    /// still at `expected_data_version`.
    ///
    /// Used by administrative interfaces (archive release/recall) whose
    /// decision was made against a possibly stale snapshot. A mismatch
    /// is reported as [`EngineError::Stale`] so the caller can re-decide
    /// with fresh state instead of treating it as a hard failure.
    pub async fn set_size_if_version(
        &self,
        handle: &Arc<InodeHandle>,
        new_size: u64,
        expected_data_version: u64,
    ) -> Result<(), EngineError> {
        let ino = handle.ino();
        loop {
            let lock = self
                .svc
                .locks()
                .acquire(inode_lock_range(ino), LockMode::Write)
                .await?;
            let attempt: Result<Option<u64>, EngineError> = async {
                self.refresh(handle, &lock).await?;
                let found = handle.data_version();
                if found != expected_data_version {
                    return Err(EngineError::Stale {
                        what: "data version",
                        expected: expected_data_version,
                        found,
                    });
                }
                self.try_set_size(handle, new_size, &lock).await
            }
            .await;
            self.svc.locks().release(&lock);
            match attempt? {
                None => return Ok(()),
                Some(wait_from) => handle.data_wait.wait_from(wait_from).await?,
            }
        }
    }

    /// One locked attempt; `Some(snapshot)` means offline extents block
    /// the change and the caller must wait and retry.
    async fn try_set_size(
        &self,
        handle: &Arc<InodeHandle>,
        new_size: u64,
        lock: &Arc<Lock>,
    ) -> Result<Option<u64>, EngineError> {
        let ino = handle.ino();

        self.refresh(handle, lock).await?;
        if handle.kind() != InodeKind::File {
            return Ok(None);
        }

        // Finish a truncate that failed mid-flight before moving the size
        // again.
        self.complete_truncate(handle, lock).await?;

        if new_size > 0 && new_size != handle.size() {
            let wait_from = handle.data_wait.snapshot();
            if self.svc.data().offline_in_range(ino, 0, new_size) {
                return Ok(Some(wait_from));
            }
        }

        // Truncating to the current size still trims extents past it.
        let truncating = handle.size() >= new_size;

        let held = self.hold_index_locks(handle, true).await?;
        self.dirty_record(handle, lock)?;

        if handle.size() != new_size {
            handle.inc_data_version();
        }
        let now = Timestamp::now();
        handle.update_fields(|fields| {
            fields.size = new_size;
            fields.mtime = now;
            fields.ctime = now;
            if truncating {
                fields.flags |= InodeFlags::PENDING_TRUNCATE;
            }
        });
        handle.set_data_seq(self.trans.current_seq());
        self.update_and_persist(handle, lock, &held).await?;
        drop(held);

        if truncating {
            self.complete_truncate(handle, lock).await?;
        }
        Ok(None)
    }

    /// Finish an interrupted truncate: remove extents past the persisted
    /// size, then clear the pending flag.
    pub async fn complete_truncate(
        &self,
        handle: &Arc<InodeHandle>,
        lock: &Arc<Lock>,
    ) -> Result<(), EngineError> {
        if !handle
            .fields()
            .flags
            .contains(InodeFlags::PENDING_TRUNCATE)
        {
            return Ok(());
        }

        let first_block = handle.size().div_ceil(BLOCK_SIZE);
        self.svc
            .data()
            .truncate_extents(handle.ino(), first_block, u64::MAX, lock)
            .await?;

        // Extents are gone; persist the cleared flag. A crash in between
        // re-runs the (now empty) truncate.
        let held = self.hold_index_locks(handle, false).await?;
        self.dirty_record(handle, lock)?;
        handle.update_fields(|fields| fields.flags.remove(InodeFlags::PENDING_TRUNCATE));
        self.update_and_persist(handle, lock, &held).await
    }

    // ---- unlink and deletion ----

    /// Commit the filesystem to eventually deleting `handle`.
    ///
    /// Called as the last directory entry goes away, with the caller
    /// holding the inode's write lock. The orphan marker is created in
    /// its own lock domain atomically with persisting the zero link
    /// count; from this moment the marker survives until every item of
    /// the inode is gone.
    pub async fn begin_unlink(
        &self,
        handle: &Arc<InodeHandle>,
        lock: &Arc<Lock>,
    ) -> Result<(), EngineError> {
        let ino = handle.ino();
        let orph_lock = self
            .svc
            .locks()
            .acquire(orphan_lock_range(ino), LockMode::WriteOnly)
            .await?;

        let result: Result<(), EngineError> = async {
            let held = self.hold_index_locks(handle, false).await?;
            self.dirty_record(handle, lock)?;
            self.svc
                .store()
                .create_force(&ItemKey::orphan(ino), &[], &orph_lock)?;
            handle.update_fields(|fields| {
                fields.nlink = 0;
                fields.ctime = Timestamp::now();
            });
            self.update_and_persist(handle, lock, &held).await
        }
        .await;

        self.svc.locks().release(&orph_lock);
        result
    }

    /// Remove every item belonging to `ino`: content, xattrs, index
    /// items, the record, and finally the orphan marker.
    ///
    /// Only called once the link count is zero and nothing in the cluster
    /// holds the inode open. Each phase is its own transaction, so a
    /// crash leaves resumable state behind the still-present orphan
    /// marker; the background scanner re-drives the pipeline until the
    /// marker goes away. Concurrent attempts for one inode number
    /// deduplicate through the deleting set — losers report success
    /// without doing work.
    pub async fn delete_inode_items(
        &self,
        ino: u64,
        lock: &Arc<Lock>,
        orph_lock: &Arc<Lock>,
    ) -> Result<(), EngineError> {
        let Some(_deleting) = DeletingGuard::try_claim(&self.deleting, ino) else {
            Counters::inc(&self.counters.delete_dedup);
            return Ok(());
        };

        let key = ItemKey::inode(ino);
        let bytes = match self.svc.store().lookup_exact(&key, lock) {
            Ok(bytes) => bytes,
            // Someone else finished the job.
            Err(StoreError::NotFound) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let record = InodeRecord::decode(&bytes)?;

        if record.nlink.get() != 0 {
            // The inode won't be freed without repair; refuse to touch it.
            Counters::inc(&self.counters.corruption);
            tracing::warn!(ino, nlink = record.nlink.get(), "dangling orphan item");
            return Err(EngineError::Corruption(format!(
                "orphan marker for inode {ino} with nonzero link count"
            )));
        }

        let kind = record.kind();
        let size = record.size.get();
        tracing::debug!(ino, mode = record.mode.get(), size, "deleting inode items");

        // Content extents can span many transactions for large files;
        // xattrs likewise run in their own transactions.
        if kind == InodeKind::File {
            self.svc
                .data()
                .truncate_extents(ino, 0, u64::MAX, lock)
                .await?;
        }
        self.svc.data().drop_xattrs(ino, lock).await?;

        // The small known set of remaining items goes in one transaction.
        // The index values come straight from the record just read.
        let held = index::lock_hold_for_deletion(
            self.svc.as_ref(),
            &self.trans,
            &self.counters,
            ino,
            &record,
        )
        .await?;

        index::remove_index_items(self.svc.store(), &held, ino, &record)?;

        if kind == InodeKind::Symlink {
            self.svc
                .data()
                .drop_symlink_target(ino, size, lock)
                .await?;
        }

        self.svc.store().delete(&key, lock)?;
        self.svc.store().delete_force(&ItemKey::orphan(ino), orph_lock)?;
        drop(held);

        Counters::inc(&self.counters.inode_deleted);
        Ok(())
    }

    // ---- reference release and eviction ----

    /// Drop one reference to `handle`, evicting it if this was the last
    /// and the cache policy says so.
    ///
    /// This can turn into final deletion — a heavy, multi-transaction
    /// operation. Contexts that cannot afford that (lock invalidation
    /// callbacks, writeback during commit) use
    /// [`queue_release`](Self::queue_release) instead.
    pub async fn release(&self, handle: Arc<InodeHandle>) {
        let previous = handle.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unbalanced inode release");
        if previous == 1 {
            self.maybe_evict(handle).await;
        }
    }

    /// Mark `handle` for forced eviction and drop the caller's
    /// reference.
    ///
    /// Once the remaining references drain, the handle leaves the cache
    /// regardless of lock coverage; an unlinked inode then enters the
    /// deletion pipeline.
    pub async fn evict(&self, handle: Arc<InodeHandle>) {
        handle.set_must_drop();
        self.release(handle).await;
    }

    /// Hand a reference drop to the dedicated release worker.
    ///
    /// Multiple pending releases of one handle coalesce into a single
    /// queued unit plus a count.
    pub fn queue_release(&self, handle: Arc<InodeHandle>) {
        if handle.pending_releases.fetch_add(1, Ordering::AcqRel) == 0 {
            // Worker gone means shutdown; the balance is dropped with it.
            drop(self.release_tx.send(handle));
        }
    }

    /// Take one engine reference on a cached live handle, if it still
    /// occupies its slot. Used by writeback draining.
    pub(crate) fn try_grab(&self, handle: &Arc<InodeHandle>) -> bool {
        self.cache
            .read_sync(&handle.ino(), |_, slot| match slot {
                Slot::Live(cached) if Arc::ptr_eq(cached, handle) => {
                    cached.refs.fetch_add(1, Ordering::AcqRel);
                    true
                }
                _ => false,
            })
            .unwrap_or(false)
    }

    /// Apply the cache retention policy to an unreferenced handle.
    ///
    /// Stale-but-covered handles are kept — refreshing them later is much
    /// cheaper than re-instantiating. Uncovered, marked, or unlinked
    /// handles must go: an inode cached here past its lock coverage would
    /// block another node's final deletion indefinitely, and eviction is
    /// what drives an unlinked inode into the deletion pipeline.
    async fn maybe_evict(&self, handle: Arc<InodeHandle>) {
        let ino = handle.ino();
        if !handle.must_drop() && handle.nlink() != 0 && self.svc.locks().is_covered(ino) {
            return;
        }

        // Claim the slot. The flip to Freeing and lookup's refcount
        // increment both run under the map entry, so a handle revived by
        // a concurrent lookup stays live.
        let claimed = self
            .cache
            .update_async(&ino, |_, slot| {
                let ours = matches!(slot, Slot::Live(cached)
                    if Arc::ptr_eq(cached, &handle) && handle.ref_count() == 0);
                if ours {
                    *slot = Slot::Freeing(Arc::clone(&handle));
                }
                ours
            })
            .await
            .unwrap_or(false);
        if !claimed {
            return;
        }

        self.evict_inode(&handle).await;

        // A fresh instantiation may have displaced the freeing slot;
        // remove it only if it is still ours.
        drop(
            self.cache
                .remove_if_async(&ino, |slot| {
                    matches!(slot, Slot::Freeing(cached) if Arc::ptr_eq(cached, &handle))
                })
                .await,
        );
    }

    /// Tear down an evicting handle, running final deletion when this
    /// node holds the last cluster-wide reference to an unlinked inode.
    async fn evict_inode(&self, handle: &Arc<InodeHandle>) {
        let ino = handle.ino();
        self.writeback.unlink(handle);

        if let Err(err) = self.try_delete_on_evict(handle).await {
            tracing::error!(
                ino,
                error = %err,
                "checking inode for deletion during eviction failed, it might linger"
            );
        }

        self.svc.opens().decrement(ino);
    }

    async fn try_delete_on_evict(&self, handle: &Arc<InodeHandle>) -> Result<(), EngineError> {
        let ino = handle.ino();
        let lock = self
            .svc
            .locks()
            .acquire(inode_lock_range(ino), LockMode::Write)
            .await?;

        let result: Result<(), EngineError> = async {
            match self.refresh(handle, &lock).await {
                // Already fully deleted elsewhere.
                Err(EngineError::NotFound) => return Ok(()),
                other => other?,
            }

            if handle.nlink() != 0
                || !self.svc.opens().should_delete(ino, handle.nlink()).await?
            {
                return Ok(());
            }

            let orph_lock = self
                .svc
                .locks()
                .acquire(orphan_lock_range(ino), LockMode::WriteOnly)
                .await?;
            let deleted = self.delete_inode_items(ino, &lock, &orph_lock).await;
            self.svc.locks().release(&orph_lock);
            deleted
        }
        .await;

        self.svc.locks().release(&lock);
        result
    }
}

/// Drain queued reference releases, coalesced per handle.
async fn release_worker<S: Services>(
    engine: Arc<MetaEngine<S>>,
    mut rx: mpsc::UnboundedReceiver<Arc<InodeHandle>>,
    shutdown: CancellationToken,
) {
    loop {
        let handle = tokio::select! {
            () = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Some(handle) => handle,
                None => break,
            },
        };
        drain_queued(&engine, handle).await;
    }

    // Don't strand balances queued just before shutdown.
    while let Ok(handle) = rx.try_recv() {
        drain_queued(&engine, handle).await;
    }
}

async fn drain_queued<S: Services>(engine: &MetaEngine<S>, handle: Arc<InodeHandle>) {
    let pending = handle.pending_releases.swap(0, Ordering::AcqRel);
    for _ in 0..pending {
        engine.release(Arc::clone(&handle)).await;
    }
}

fn lock_poisonless<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
