//! Background orphan scanning.
//!
//! Orphan markers are created as the last link to an inode goes away and
//! deleted only after every item of the inode is gone. Markers linger
//! when the deleting node crashes or hits errors; every node runs this
//! scan to find them and funnel the inodes back through ordinary
//! eviction-driven deletion. The scanner itself never deletes anything.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{OPEN_GROUP_MASK, OPEN_GROUP_SHIFT, OpenBitmap, OpenTracker, Services};
use crate::counters::Counters;
use crate::error::{EngineError, StoreError};
use crate::format::{ItemKey, ROOT_INO};
use crate::lifecycle::MetaEngine;
use crate::store::ItemStore;

/// Run the scan on a jittered interval until cancelled.
///
/// All cluster nodes scan concurrently; the large random jitter keeps
/// them from bunching up on the same markers.
pub(crate) fn spawn_scanner<S: Services>(
    engine: Arc<MetaEngine<S>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let jitter = rand::rng().random_range(Duration::ZERO..=engine.config.orphan_scan_jitter());
            let delay = engine.config.orphan_scan_min() + jitter;
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            if let Err(err) = engine.scan_orphans_once(&shutdown).await {
                Counters::inc(&engine.counters.orphan_scan_error);
                tracing::warn!(error = %err, "orphan scan pass failed");
            }
        }
    })
}

impl<S: Services> MetaEngine<S> {
    /// One pass over the orphan markers in the authoritative merged view.
    ///
    /// Scanning the merged view naturally skips markers whose unlinks
    /// have not been merged yet — including inodes that are unlinked but
    /// legitimately still open and cached. For each marker found: skip
    /// inodes cached locally (they are already headed through normal
    /// deletion), skip inodes open elsewhere per the open bitmap, and
    /// otherwise instantiate the inode, mark it for forced eviction, and
    /// let go — eviction runs the deletion pipeline.
    pub async fn scan_orphans_once(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<(), EngineError> {
        Counters::inc(&self.counters.orphan_scan);

        let bound = ItemKey::orphan(u64::MAX);
        let mut next = ItemKey::orphan(ROOT_INO + 1);
        let mut bitmap: Option<OpenBitmap> = None;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let (found, _) = match self.svc.store().next_committed(&next, &bound) {
                Ok(item) => item,
                Err(StoreError::NotFound) => break,
                Err(err) => return Err(err.into()),
            };
            let ino = found.ino;
            Counters::inc(&self.counters.orphan_scan_item);
            if ino == u64::MAX {
                break;
            }
            next = ItemKey::orphan(ino + 1);

            // Locally cached inodes will be deleted on their own way out.
            if self.cached(ino) {
                Counters::inc(&self.counters.orphan_scan_cached);
                continue;
            }

            // No need to evict when someone else holds it open.
            let group = ino >> OPEN_GROUP_SHIFT;
            if bitmap.as_ref().map(|b| b.group) != Some(group) {
                bitmap = Some(self.svc.opens().open_bitmap(group).await?);
            }
            if bitmap
                .as_ref()
                .is_some_and(|b| b.is_set(ino & OPEN_GROUP_MASK))
            {
                Counters::inc(&self.counters.orphan_scan_open);
                continue;
            }

            // Cache the unused inode and let eviction delete it. This can
            // race other nodes doing the same; deletion dedups.
            match self.get_or_create_handle(ino).await {
                Ok(handle) => {
                    Counters::inc(&self.counters.orphan_scan_read);
                    self.evict(handle).await;
                }
                Err(EngineError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}
