#![allow(dead_code, missing_docs, clippy::unwrap_used)]

//! In-process mocks of the engine's collaborators.
//!
//! The mock store asserts, on every access, that the supplied lock
//! actually covers the key and that the lock mode permits the operation —
//! so every test doubles as a check of the engine's locking discipline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::{FxHashMap, FxHashSet};

use corral_fs::cluster::{
    DataOps, InoAuthority, OPEN_GROUP_MASK, OPEN_GROUP_SHIFT, OpenBitmap, OpenTracker, Services,
};
use corral_fs::config::EngineConfig;
use corral_fs::error::{EngineError, LockError, StoreError};
use corral_fs::format::{INODE_INDEX_ZONE, ItemKey, MODE_REG};
use corral_fs::inode::InodeHandle;
use corral_fs::lifecycle::{MetaEngine, NewInode};
use corral_fs::lock::{Lock, LockManager, LockMode, LockRange, inode_lock_range, orphan_lock_range};
use corral_fs::store::{ItemStore, Transactions};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---- item store ----

/// Ordered in-memory item store with a separately published "merged"
/// view standing in for the shared persistent roots.
#[derive(Debug, Default)]
pub struct MemStore {
    items: Mutex<BTreeMap<ItemKey, Vec<u8>>>,
    committed: Mutex<BTreeMap<ItemKey, Vec<u8>>>,
    fail_next_create: Mutex<Option<StoreError>>,
    fail_next_update: Mutex<Option<StoreError>>,
    /// Failure for the next N `delete_force` calls in the given zone.
    fail_next_delete_force: Mutex<Option<(u8, StoreError, u32)>>,
}

impl MemStore {
    /// Copy the working set into the merged view, as a log merge would.
    pub fn publish(&self) {
        let items = locked(&self.items).clone();
        *locked(&self.committed) = items;
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        locked(&self.items).contains_key(key)
    }

    /// Every live item keyed by `ino`, across all zones.
    pub fn items_for_ino(&self, ino: u64) -> usize {
        locked(&self.items).keys().filter(|k| k.ino == ino).count()
    }

    /// Majors of the index items of `item_type` for `ino`.
    pub fn index_majors(&self, item_type: u8, ino: u64) -> Vec<u64> {
        locked(&self.items)
            .keys()
            .filter(|k| k.zone == INODE_INDEX_ZONE && k.item_type == item_type && k.ino == ino)
            .map(|k| k.major)
            .collect()
    }

    pub fn fail_next_create(&self, err: StoreError) {
        *locked(&self.fail_next_create) = Some(err);
    }

    pub fn fail_next_update(&self, err: StoreError) {
        *locked(&self.fail_next_update) = Some(err);
    }

    pub fn fail_next_delete_force_in_zone(&self, zone: u8, err: StoreError) {
        self.fail_delete_force_in_zone(zone, err, 1);
    }

    pub fn fail_delete_force_in_zone(&self, zone: u8, err: StoreError, times: u32) {
        *locked(&self.fail_next_delete_force) = Some((zone, err, times));
    }

    fn check_read(lock: &Lock, key: &ItemKey) {
        assert!(
            lock.range.contains(key),
            "read of {key:?} outside lock range {:?}",
            lock.range
        );
        assert_ne!(
            lock.mode,
            LockMode::WriteOnly,
            "consistent read of {key:?} under a write-only lock"
        );
    }

    fn check_write(lock: &Lock, key: &ItemKey, force: bool) {
        assert!(
            lock.range.contains(key),
            "write of {key:?} outside lock range {:?}",
            lock.range
        );
        match lock.mode {
            LockMode::Read => panic!("write of {key:?} under a read lock"),
            LockMode::Write => {}
            LockMode::WriteOnly => {
                assert!(force, "non-force write of {key:?} under a write-only lock");
            }
        }
    }
}

impl ItemStore for MemStore {
    fn lookup_exact(&self, key: &ItemKey, lock: &Arc<Lock>) -> Result<Vec<u8>, StoreError> {
        Self::check_read(lock, key);
        locked(&self.items).get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn create(&self, key: &ItemKey, value: &[u8], lock: &Arc<Lock>) -> Result<(), StoreError> {
        Self::check_write(lock, key, false);
        if let Some(err) = locked(&self.fail_next_create).take() {
            return Err(err);
        }
        let mut items = locked(&self.items);
        if items.contains_key(key) {
            return Err(StoreError::Exists);
        }
        items.insert(*key, value.to_vec());
        Ok(())
    }

    fn create_force(
        &self,
        key: &ItemKey,
        value: &[u8],
        lock: &Arc<Lock>,
    ) -> Result<bool, StoreError> {
        Self::check_write(lock, key, true);
        if let Some(err) = locked(&self.fail_next_create).take() {
            return Err(err);
        }
        Ok(locked(&self.items).insert(*key, value.to_vec()).is_none())
    }

    fn update(&self, key: &ItemKey, value: &[u8], lock: &Arc<Lock>) -> Result<(), StoreError> {
        Self::check_write(lock, key, false);
        if let Some(err) = locked(&self.fail_next_update).take() {
            return Err(err);
        }
        let mut items = locked(&self.items);
        if !items.contains_key(key) {
            return Err(StoreError::NotFound);
        }
        items.insert(*key, value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &ItemKey, lock: &Arc<Lock>) -> Result<(), StoreError> {
        Self::check_write(lock, key, false);
        locked(&self.items)
            .remove(key)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn delete_force(&self, key: &ItemKey, lock: &Arc<Lock>) -> Result<(), StoreError> {
        Self::check_write(lock, key, true);
        {
            let mut fail = locked(&self.fail_next_delete_force);
            if let Some((zone, err, remaining)) = fail.take() {
                if zone == key.zone {
                    if remaining > 1 {
                        *fail = Some((zone, err.clone(), remaining - 1));
                    }
                    return Err(err);
                }
                *fail = Some((zone, err, remaining));
            }
        }
        locked(&self.items)
            .remove(key)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn next(
        &self,
        key: &ItemKey,
        bound: &ItemKey,
        lock: &Arc<Lock>,
    ) -> Result<(ItemKey, Vec<u8>), StoreError> {
        Self::check_read(lock, key);
        locked(&self.items)
            .range(*key..=*bound)
            .next()
            .map(|(k, v)| (*k, v.clone()))
            .ok_or(StoreError::NotFound)
    }

    fn next_committed(
        &self,
        key: &ItemKey,
        bound: &ItemKey,
    ) -> Result<(ItemKey, Vec<u8>), StoreError> {
        locked(&self.committed)
            .range(*key..=*bound)
            .next()
            .map(|(k, v)| (*k, v.clone()))
            .ok_or(StoreError::NotFound)
    }
}

// ---- lock manager ----

#[derive(Debug)]
struct Grant {
    refresh_gen: u64,
    holders: u64,
    invalidated: bool,
}

/// Grants every request immediately and caches grants until invalidated,
/// handing out a fresh refresh generation per re-grant.
///
/// Invalidation while a grant is held is deferred until the last holder
/// releases, as the real service's callback protocol guarantees — so a
/// lock a caller is actively holding always carries the current
/// generation.
#[derive(Debug, Default)]
pub struct TestLockManager {
    grants: Mutex<FxHashMap<ItemKey, Grant>>,
    next_gen: AtomicU64,
    /// Total acquire calls, for lock-count assertions.
    pub acquires: AtomicU64,
    /// When set, the next acquire commits the transaction once before
    /// granting — simulating a committer racing lock preparation.
    advance_on_acquire: Mutex<Option<Arc<Transactions>>>,
}

impl TestLockManager {
    pub fn acquire_count(&self) -> u64 {
        self.acquires.load(Ordering::Relaxed)
    }

    /// Drop the cached grant covering `ino`'s record range, as a remote
    /// node's conflicting request would.
    pub fn invalidate_ino(&self, ino: u64) {
        let mut grants = locked(&self.grants);
        let start = inode_lock_range(ino).start;
        if let Some(grant) = grants.get_mut(&start) {
            if grant.holders == 0 {
                grants.remove(&start);
            } else {
                grant.invalidated = true;
            }
        }
    }

    pub fn advance_seq_on_next_acquire(&self, trans: Arc<Transactions>) {
        *locked(&self.advance_on_acquire) = Some(trans);
    }
}

impl LockManager for TestLockManager {
    async fn acquire(&self, range: LockRange, mode: LockMode) -> Result<Arc<Lock>, LockError> {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        let advance = locked(&self.advance_on_acquire).take();
        if let Some(trans) = advance {
            trans.commit().await;
        }
        let mut grants = locked(&self.grants);
        let grant = grants.entry(range.start).or_insert_with(|| Grant {
            refresh_gen: self.next_gen.fetch_add(1, Ordering::AcqRel) + 1,
            holders: 0,
            invalidated: false,
        });
        grant.holders += 1;
        Ok(Arc::new(Lock {
            range,
            mode,
            refresh_gen: grant.refresh_gen,
        }))
    }

    fn release(&self, lock: &Arc<Lock>) {
        let mut grants = locked(&self.grants);
        if let Some(grant) = grants.get_mut(&lock.range.start) {
            grant.holders = grant.holders.saturating_sub(1);
            if grant.holders == 0 && grant.invalidated {
                grants.remove(&lock.range.start);
            }
            // Released grants otherwise stay cached until invalidated.
        }
    }

    fn is_covered(&self, ino: u64) -> bool {
        locked(&self.grants)
            .get(&inode_lock_range(ino).start)
            .is_some_and(|grant| !grant.invalidated)
    }
}

// ---- authority and open tracker ----

#[derive(Debug)]
pub struct TestAuthority {
    next: AtomicU64,
    grant_limit: AtomicU64,
}

impl Default for TestAuthority {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(100),
            grant_limit: AtomicU64::new(u64::MAX),
        }
    }
}

impl TestAuthority {
    /// Cap how many numbers each request is granted.
    pub fn limit_grants(&self, limit: u64) {
        self.grant_limit.store(limit, Ordering::Relaxed);
    }
}

impl InoAuthority for TestAuthority {
    async fn alloc_inodes(&self, count: u64) -> Result<(u64, u64), EngineError> {
        let granted = count.min(self.grant_limit.load(Ordering::Relaxed));
        let first = self.next.fetch_add(granted, Ordering::AcqRel);
        Ok((first, granted))
    }
}

#[derive(Debug, Default)]
pub struct TestOpenTracker {
    counts: Mutex<FxHashMap<u64, u64>>,
    /// Inode numbers some other node holds open.
    remote_open: Mutex<FxHashSet<u64>>,
}

impl TestOpenTracker {
    pub fn local_count(&self, ino: u64) -> u64 {
        locked(&self.counts).get(&ino).copied().unwrap_or(0)
    }

    pub fn set_remote_open(&self, ino: u64) {
        locked(&self.remote_open).insert(ino);
    }

    pub fn clear_remote_open(&self, ino: u64) {
        locked(&self.remote_open).remove(&ino);
    }
}

impl OpenTracker for TestOpenTracker {
    fn increment(&self, ino: u64) -> Result<(), EngineError> {
        *locked(&self.counts).entry(ino).or_insert(0) += 1;
        Ok(())
    }

    fn decrement(&self, ino: u64) {
        let mut counts = locked(&self.counts);
        if let Some(count) = counts.get_mut(&ino) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&ino);
            }
        }
    }

    async fn should_delete(&self, ino: u64, nlink: u32) -> Result<bool, EngineError> {
        Ok(nlink == 0
            && self.local_count(ino) <= 1
            && !locked(&self.remote_open).contains(&ino))
    }

    async fn open_bitmap(&self, group: u64) -> Result<OpenBitmap, EngineError> {
        let mut bitmap = OpenBitmap::empty(group);
        for ino in locked(&self.counts).keys() {
            if *ino >> OPEN_GROUP_SHIFT == group {
                bitmap.set(*ino & OPEN_GROUP_MASK);
            }
        }
        for ino in locked(&self.remote_open).iter() {
            if *ino >> OPEN_GROUP_SHIFT == group {
                bitmap.set(*ino & OPEN_GROUP_MASK);
            }
        }
        Ok(bitmap)
    }
}

// ---- data plane ----

#[derive(Debug, Default)]
pub struct TestDataOps {
    /// Recorded `(ino, from_block, until_block)` truncate calls.
    pub truncates: Mutex<Vec<(u64, u64, u64)>>,
    pub xattr_drops: Mutex<Vec<u64>>,
    pub symlink_drops: Mutex<Vec<u64>>,
    pub flushes: Mutex<Vec<u64>>,
    pub waits: Mutex<Vec<u64>>,
    offline: Mutex<FxHashMap<u64, Vec<(u64, u64)>>>,
    fail_truncate: Mutex<Option<EngineError>>,
    fail_xattrs: Mutex<Option<EngineError>>,
    fail_flush: Mutex<FxHashMap<u64, EngineError>>,
}

impl TestDataOps {
    pub fn truncates_for(&self, ino: u64) -> usize {
        locked(&self.truncates).iter().filter(|t| t.0 == ino).count()
    }

    pub fn set_offline(&self, ino: u64, start: u64, end: u64) {
        locked(&self.offline).entry(ino).or_default().push((start, end));
    }

    pub fn clear_offline(&self, ino: u64) {
        locked(&self.offline).remove(&ino);
    }

    /// Persistent until cleared: every truncate fails with `err`.
    pub fn fail_truncates(&self, err: EngineError) {
        *locked(&self.fail_truncate) = Some(err);
    }

    pub fn clear_truncate_failure(&self) {
        *locked(&self.fail_truncate) = None;
    }

    pub fn fail_xattr_drops(&self, err: EngineError) {
        *locked(&self.fail_xattrs) = Some(err);
    }

    pub fn clear_xattr_failure(&self) {
        *locked(&self.fail_xattrs) = None;
    }

    pub fn fail_flush(&self, ino: u64, err: EngineError) {
        locked(&self.fail_flush).insert(ino, err);
    }
}

impl DataOps for TestDataOps {
    async fn truncate_extents(
        &self,
        ino: u64,
        from_block: u64,
        until_block: u64,
        _lock: &Arc<Lock>,
    ) -> Result<(), EngineError> {
        if let Some(err) = locked(&self.fail_truncate).clone() {
            return Err(err);
        }
        locked(&self.truncates).push((ino, from_block, until_block));
        Ok(())
    }

    async fn drop_xattrs(&self, ino: u64, _lock: &Arc<Lock>) -> Result<(), EngineError> {
        if let Some(err) = locked(&self.fail_xattrs).clone() {
            return Err(err);
        }
        locked(&self.xattr_drops).push(ino);
        Ok(())
    }

    async fn drop_symlink_target(
        &self,
        ino: u64,
        _size: u64,
        _lock: &Arc<Lock>,
    ) -> Result<(), EngineError> {
        locked(&self.symlink_drops).push(ino);
        Ok(())
    }

    fn offline_in_range(&self, ino: u64, start: u64, end: u64) -> bool {
        locked(&self.offline)
            .get(&ino)
            .is_some_and(|ranges| ranges.iter().any(|(s, e)| *s < end && start < *e))
    }

    async fn flush(&self, ino: u64) -> Result<(), EngineError> {
        if let Some(err) = locked(&self.fail_flush).get(&ino) {
            return Err(err.clone());
        }
        locked(&self.flushes).push(ino);
        Ok(())
    }

    async fn wait_flushed(&self, ino: u64) -> Result<(), EngineError> {
        if let Some(err) = locked(&self.fail_flush).get(&ino) {
            return Err(err.clone());
        }
        locked(&self.waits).push(ino);
        Ok(())
    }
}

// ---- service bundle ----

#[derive(Debug, Default)]
pub struct TestCluster {
    pub store: MemStore,
    pub locks: TestLockManager,
    pub authority: TestAuthority,
    pub opens: TestOpenTracker,
    pub data: TestDataOps,
}

impl Services for TestCluster {
    type Store = MemStore;
    type Locks = TestLockManager;
    type Authority = TestAuthority;
    type Opens = TestOpenTracker;
    type Data = TestDataOps;

    fn store(&self) -> &MemStore {
        &self.store
    }

    fn locks(&self) -> &TestLockManager {
        &self.locks
    }

    fn authority(&self) -> &TestAuthority {
        &self.authority
    }

    fn opens(&self) -> &TestOpenTracker {
        &self.opens
    }

    fn data(&self) -> &TestDataOps {
        &self.data
    }
}

pub fn new_engine() -> (Arc<MetaEngine<TestCluster>>, Arc<TestCluster>, Arc<Transactions>) {
    new_engine_with(EngineConfig::default(), 1)
}

pub fn new_engine_with(
    config: EngineConfig,
    initial_seq: u64,
) -> (Arc<MetaEngine<TestCluster>>, Arc<TestCluster>, Arc<Transactions>) {
    init_test_logging();
    let svc = Arc::new(TestCluster::default());
    let trans = Arc::new(Transactions::new(initial_seq));
    let engine = MetaEngine::new(Arc::clone(&svc), Arc::clone(&trans), config);
    (engine, svc, trans)
}

/// Opt-in engine tracing for test debugging, e.g. `CORRAL_LOG=trace`.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let filter =
        EnvFilter::try_from_env("CORRAL_LOG").unwrap_or_else(|_| EnvFilter::new("off"));
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init(),
    );
}

/// A second engine (node) over the same store, opens, and authority —
/// used for restart-after-crash tests.
pub fn reopen_engine(svc: &Arc<TestCluster>, trans: &Arc<Transactions>) -> Arc<MetaEngine<TestCluster>> {
    MetaEngine::new(Arc::clone(svc), Arc::clone(trans), EngineConfig::default())
}

// ---- operation helpers ----

/// Run the full create flow: allocate a number, create the record and
/// open reference, and establish the index items, all in one
/// transaction hold.
pub async fn create_inode_with_mode(
    engine: &MetaEngine<TestCluster>,
    svc: &TestCluster,
    mode: u32,
) -> Arc<InodeHandle> {
    let kind = corral_fs::format::InodeKind::from_mode(mode);
    let is_dir = kind == corral_fs::format::InodeKind::Directory;
    let ino = engine.alloc_ino(is_dir).await.unwrap();

    let lock = svc
        .locks
        .acquire(inode_lock_range(ino), LockMode::Write)
        .await
        .unwrap();
    let held = engine.hold_index_locks_for_new(ino, kind).await.unwrap();
    let new = NewInode {
        mode,
        uid: 1000,
        gid: 1000,
        rdev: 0,
    };
    let handle = engine.create_inode(ino, &new, &lock).await.unwrap();
    engine.update_and_persist(&handle, &lock, &held).await.unwrap();
    drop(held);
    svc.locks.release(&lock);
    handle
}

pub async fn create_file(engine: &MetaEngine<TestCluster>, svc: &TestCluster) -> Arc<InodeHandle> {
    create_inode_with_mode(engine, svc, MODE_REG | 0o644).await
}

/// Drop the last link: persist nlink = 0 and create the orphan marker.
pub async fn unlink_handle(
    engine: &MetaEngine<TestCluster>,
    svc: &TestCluster,
    handle: &Arc<InodeHandle>,
) {
    let lock = svc
        .locks
        .acquire(inode_lock_range(handle.ino()), LockMode::Write)
        .await
        .unwrap();
    engine.refresh(handle, &lock).await.unwrap();
    engine.begin_unlink(handle, &lock).await.unwrap();
    svc.locks.release(&lock);
}

/// Drive `delete_inode_items` directly under fresh locks.
pub async fn delete_now(
    engine: &MetaEngine<TestCluster>,
    svc: &TestCluster,
    ino: u64,
) -> Result<(), EngineError> {
    let lock = svc
        .locks
        .acquire(inode_lock_range(ino), LockMode::Write)
        .await
        .unwrap();
    let orph_lock = svc
        .locks
        .acquire(orphan_lock_range(ino), LockMode::WriteOnly)
        .await
        .unwrap();
    let result = engine.delete_inode_items(ino, &lock, &orph_lock).await;
    svc.locks.release(&orph_lock);
    svc.locks.release(&lock);
    result
}

/// Persist an in-memory metadata mutation through the full update path.
pub async fn persist_mutation(
    engine: &MetaEngine<TestCluster>,
    svc: &TestCluster,
    handle: &Arc<InodeHandle>,
    mutate: impl FnOnce(&mut corral_fs::inode::InodeFields),
) -> Result<(), EngineError> {
    let lock = svc
        .locks
        .acquire(inode_lock_range(handle.ino()), LockMode::Write)
        .await?;
    let result: Result<(), EngineError> = async {
        engine.refresh(handle, &lock).await?;
        let held = engine.hold_index_locks(handle, false).await?;
        engine.dirty_record(handle, &lock)?;
        handle.update_fields(mutate);
        engine.update_and_persist(handle, &lock, &held).await
    }
    .await;
    svc.locks.release(&lock);
    result
}
