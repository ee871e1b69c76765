//! Local scan and filesystem event handling
//!
//! The [`LocalWatcher`] turns what it sees under the sync root into store
//! transitions. It never talks to the server: processors pick up the pairs
//! the store queues.
//!
//! A full [`scan`](LocalWatcher::scan) runs at startup. Rows whose entry is
//! missing on disk are only collected during the walk and marked deleted
//! once the walk is over, so that a folder moved within the tree is found
//! at its new place before its old place is judged.
//!
//! ## Flow
//!
//! ```text
//! FileWatcher ──→ mpsc::Receiver ──→ LocalWatcher::run ──→ store ──→ queue
//!                                        │
//!                                  DebouncedChangeQueue
//! ```
//!
//! Moves are recognised by the `remote-ref` attribute the entry carries:
//! a new entry whose reference belongs to a pair with a vanished path is
//! that pair, moved. When the old path still exists the new entry is a
//! copy and loses the inherited reference.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pairsync_core::domain::{DocPair, DomainError, LocalInfo, LocalState, UNACCESSIBLE_HASH};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::backoff::locked_delay;
use crate::context::SyncContext;
use crate::digest::{algorithm_for, compute_digest_async};
use crate::local::{is_temp_file, names, LocalError};
use crate::watcher::{is_file_stable, ChangeEvent, DebouncedChangeQueue};
use crate::{ErrorKind, LocalFailure, SyncError};

/// How often settled events and deferred paths are looked at
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Interval between the two size reads of the stability check
const STABILITY_CHECK: Duration = Duration::from_millis(200);

/// Delay before looking again at a file still being written
const WRITING_DELAY: Duration = Duration::from_secs(1);

/// Delay given once to office temporary files before they are tracked
const TEMP_FILE_DELAY: Duration = Duration::from_secs(2);

/// Counters of one scan
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub created: usize,
    pub modified: usize,
    pub moved: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeferReason {
    TempFile,
    Writing,
    Locked,
}

#[derive(Debug)]
struct Deferred {
    next_try: Instant,
    attempts: u32,
    reason: DeferReason,
}

/// Feeds the store from the local filesystem
pub struct LocalWatcher {
    ctx: SyncContext,
    /// Paths to look at again later, keyed by absolute path
    deferred: Mutex<HashMap<PathBuf, Deferred>>,
    /// Temporary files already delayed once
    delayed_once: Mutex<HashSet<PathBuf>>,
}

impl LocalWatcher {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            deferred: Mutex::new(HashMap::new()),
            delayed_once: Mutex::new(HashSet::new()),
        }
    }

    // ========================================================================
    // Scan
    // ========================================================================

    /// Walks the whole sync root and reconciles it with the store
    #[instrument(skip(self))]
    pub async fn scan(&self) -> Result<ScanReport, SyncError> {
        let report = self.scan_tree(Path::new("/")).await?;
        info!(
            scanned = report.scanned,
            created = report.created,
            modified = report.modified,
            moved = report.moved,
            deleted = report.deleted,
            "Local scan done"
        );
        Ok(report)
    }

    /// Walks the subtree below `top`
    async fn scan_tree(&self, top: &Path) -> Result<ScanReport, SyncError> {
        let mut report = ScanReport::default();
        let mut candidates = Vec::new();
        let mut stack = vec![top.to_path_buf()];

        while let Some(dir) = stack.pop() {
            if self.ctx.cancel.is_cancelled() {
                return Err(SyncError::Stopped);
            }
            let rel = dir.clone();
            let children = match self.ctx.local_call(move |l| l.get_children_info(&rel)).await {
                Ok(children) => children,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e),
            };

            let mut known: HashMap<String, DocPair> = self
                .ctx
                .store
                .get_local_children(&dir)
                .await?
                .into_iter()
                .map(|pair| (pair.local_name.clone(), pair))
                .collect();

            for info in children {
                report.scanned += 1;
                let info = self.normalized(info).await?;
                let folderish = info.folderish;
                let path = info.path.clone();
                match known.remove(&info.name()) {
                    Some(pair) => {
                        if self.refresh(&pair, &info, false).await? {
                            report.modified += 1;
                        }
                    }
                    None => self.track_new(info, &mut report).await?,
                }
                if folderish {
                    stack.push(path);
                }
            }
            candidates.extend(known.into_values());
        }

        // Second phase: confirm the vanished entries
        for pair in candidates {
            let Some(current) = self.ctx.store.get_state_from_id(pair.id).await? else {
                continue;
            };
            let skip = current.local_path != pair.local_path
                || current.processor != 0
                || matches!(
                    current.local_state,
                    LocalState::Unknown | LocalState::Deleted | LocalState::Unsynchronized
                )
                || self.ctx.local.exists(&current.local_path);
            if skip {
                continue;
            }
            self.mark_deleted(&current).await?;
            report.deleted += 1;
        }
        Ok(report)
    }

    /// Records an entry with no row at its path
    ///
    /// The entry is either moved (its reference belongs to a pair whose
    /// path vanished), copied (the pair's path still exists) or new.
    async fn track_new(&self, info: LocalInfo, report: &mut ScanReport) -> Result<(), SyncError> {
        if let Some(remote_ref) = info.remote_ref.clone() {
            match self.ctx.store.get_state_from_remote(&remote_ref).await? {
                Some(pair) if pair.local_path == info.path => {
                    self.refresh(&pair, &info, false).await?;
                    return Ok(());
                }
                Some(pair) if !self.ctx.local.exists(&pair.local_path) => {
                    self.record_move(&pair, &info).await?;
                    report.moved += 1;
                    return Ok(());
                }
                Some(pair) => {
                    debug!(
                        path = %info.path.display(),
                        source = %pair.local_path.display(),
                        "Copy detected, dropping inherited reference"
                    );
                }
                None => {
                    debug!(path = %info.path.display(), remote_ref, "Dropping stale reference");
                }
            }
            let path = info.path.clone();
            self.ctx.local_call(move |l| l.clean_xattrs(&path)).await?;
        }

        let id = self.ctx.store.insert_local(&info, &info.parent_path()).await?;
        debug!(id = %id, path = %info.path.display(), "Local entry tracked");
        report.created += 1;
        Ok(())
    }

    /// Compares a known entry with its row; returns true if content changed
    async fn refresh(
        &self,
        pair: &DocPair,
        info: &LocalInfo,
        force_digest: bool,
    ) -> Result<bool, SyncError> {
        if pair.processor != 0
            || pair.local_state == LocalState::Unsynchronized
            || self.ctx.path_locks.is_locked(&pair.local_path)
        {
            return Ok(false);
        }
        if info.folderish {
            return Ok(false);
        }

        let same_metadata = pair.size == info.size
            && pair.last_local_updated.map(|t| t.timestamp())
                == Some(info.last_modification_time.timestamp());
        if same_metadata && !force_digest && pair.local_state != LocalState::Unknown {
            return Ok(false);
        }

        let digest = compute_digest_async(info.filepath(), algorithm_for(pair)).await;
        if digest == UNACCESSIBLE_HASH {
            return Err(LocalError::Locked(info.filepath()).into());
        }

        let reference = pair.local_digest.as_deref().or(pair.remote_digest.as_deref());
        let mut row = pair.clone();
        row.local_digest = Some(digest.clone());
        if pair.local_state != LocalState::Unknown
            && reference.is_some_and(|known| known.eq_ignore_ascii_case(&digest))
        {
            // Metadata only: remember the new size and time
            self.ctx.store.update_local_state(&row, info, false, false).await?;
            return Ok(false);
        }

        row.local_state = match pair.local_state {
            LocalState::Created | LocalState::Unknown => LocalState::Created,
            LocalState::Moved => LocalState::Moved,
            _ => LocalState::Modified,
        };
        self.ctx.store.update_local_state(&row, info, true, true).await?;
        debug!(id = %pair.id, path = %info.path.display(), digest, "Local content changed");
        Ok(true)
    }

    /// Applies a local move to the pair and its subtree
    async fn record_move(&self, pair: &DocPair, info: &LocalInfo) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        let was_deleted = pair.local_state == LocalState::Deleted;
        store
            .update_local_parent_path(pair, &info.name(), &info.parent_path())
            .await?;
        let mut row = store
            .get_state_from_id(pair.id)
            .await?
            .ok_or(DomainError::PairNotFound(pair.id.get()))?;
        row.local_state = match row.local_state {
            LocalState::Created | LocalState::Unknown => row.local_state,
            _ => LocalState::Moved,
        };
        store.update_local_state(&row, info, true, true).await?;

        if was_deleted && pair.folderish {
            // The folder was first seen as deleted: its subtree is back
            for child in store.get_states_from_partial_local(&info.path).await? {
                if child.id == pair.id || child.local_state != LocalState::Deleted {
                    continue;
                }
                let path = child.local_path.clone();
                let Some(child_info) = self.ctx.local_call(move |l| l.try_get_info(&path)).await?
                else {
                    continue;
                };
                let mut restored = child.clone();
                restored.local_state = LocalState::Synchronized;
                store.update_local_state(&restored, &child_info, false, true).await?;
            }
        }

        info!(
            id = %pair.id,
            from = %pair.local_path.display(),
            to = %info.path.display(),
            "Local move detected"
        );
        Ok(())
    }

    /// Records the deletion of a known entry
    async fn mark_deleted(&self, pair: &DocPair) -> Result<(), SyncError> {
        if pair.is_root() {
            warn!("Sync root reported deleted, ignoring");
            return Ok(());
        }
        if pair.remote_ref.is_none() && pair.processor == 0 {
            // Never reached the server: forget it
            self.ctx.store.remove_state(pair, false).await?;
        } else {
            self.ctx.store.delete_local_state(pair).await?;
        }
        debug!(id = %pair.id, path = %pair.local_path.display(), "Local deletion recorded");
        Ok(())
    }

    /// Renames a non-canonical name and returns the entry at its new path
    async fn normalized(&self, info: LocalInfo) -> Result<LocalInfo, SyncError> {
        if names::is_normalized(&info.name()) {
            return Ok(info);
        }
        let path = info.path.clone();
        match self.ctx.local_call(move |l| l.normalize(&path)).await? {
            Some(new_path) => self.ctx.local_call(move |l| l.get_info(&new_path)).await,
            None => Ok(info),
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Applies one settled filesystem event (absolute paths)
    pub async fn handle_event(&self, event: ChangeEvent) -> Result<(), SyncError> {
        match event {
            ChangeEvent::Created(abs) => match self.relative(&abs) {
                Some(rel) => self.on_created(&rel).await,
                None => Ok(()),
            },
            ChangeEvent::Modified(abs) => match self.relative(&abs) {
                Some(rel) => self.on_modified(&rel).await,
                None => Ok(()),
            },
            ChangeEvent::Deleted(abs) => match self.relative(&abs) {
                Some(rel) => self.on_deleted(&rel).await,
                None => Ok(()),
            },
            ChangeEvent::Renamed { old, new } => {
                let old_rel = self.ctx.local.get_path(&old).filter(|p| p != Path::new("/"));
                let new_rel = self.ctx.local.get_path(&new).filter(|p| p != Path::new("/"));
                match (old_rel, new_rel) {
                    (Some(old), Some(new)) => self.on_renamed(&old, &new).await,
                    (Some(old), None) => self.on_deleted(&old).await,
                    (None, Some(new)) => self.on_created(&new).await,
                    (None, None) => Ok(()),
                }
            }
        }
    }

    /// Pair path of an absolute path; `None` outside the root or for the root
    fn relative(&self, abs: &Path) -> Option<PathBuf> {
        self.ctx.local.get_path(abs).filter(|p| p != Path::new("/"))
    }

    async fn on_created(&self, rel: &Path) -> Result<(), SyncError> {
        if self.ctx.local.is_ignored(rel) {
            return Ok(());
        }
        if self.ctx.store.get_state_from_local(rel).await?.is_some() {
            return Box::pin(self.on_modified(rel)).await;
        }
        let path = rel.to_path_buf();
        let Some(info) = self.ctx.local_call(move |l| l.try_get_info(&path)).await? else {
            return Ok(());
        };

        if !info.folderish {
            let abs = info.filepath();
            if is_temp_file(&info.name()) && self.lock_delayed().insert(abs.clone()) {
                debug!(path = %rel.display(), "Temporary file, delaying");
                self.defer(&abs, DeferReason::TempFile, 0);
                return Ok(());
            }
            if !is_file_stable(&abs, STABILITY_CHECK).await {
                return self.still_writing(rel, &abs).await;
            }
            self.lock_delayed().remove(&abs);
        }

        let info = self.normalized(info).await?;
        let folderish = info.folderish;
        let path = info.path.clone();
        let mut report = ScanReport::default();
        self.track_new(info, &mut report).await?;

        if folderish && report.moved == 0 {
            // Nothing is reported for the content of a folder moved in
            self.scan_tree(&path).await?;
        }
        Ok(())
    }

    async fn on_modified(&self, rel: &Path) -> Result<(), SyncError> {
        if self.ctx.local.is_ignored(rel) {
            return Ok(());
        }
        let path = rel.to_path_buf();
        let Some(info) = self.ctx.local_call(move |l| l.try_get_info(&path)).await? else {
            return Box::pin(self.on_deleted(rel)).await;
        };
        let Some(pair) = self.ctx.store.get_state_from_local(rel).await? else {
            return Box::pin(self.on_created(rel)).await;
        };
        if !info.folderish && !is_file_stable(&info.filepath(), STABILITY_CHECK).await {
            return self.still_writing(rel, &info.filepath()).await;
        }
        if pair.processor != 0 || self.ctx.path_locks.is_locked(rel) {
            // Looked at again once the processor is done with it
            self.defer(&info.filepath(), DeferReason::Writing, 0);
            return Ok(());
        }
        self.refresh(&pair, &info, true).await?;
        Ok(())
    }

    async fn on_deleted(&self, rel: &Path) -> Result<(), SyncError> {
        let Some(pair) = self.ctx.store.get_state_from_local(rel).await? else {
            return Ok(());
        };
        if self.ctx.local.exists(rel) {
            return Box::pin(self.on_modified(rel)).await;
        }
        if matches!(pair.local_state, LocalState::Deleted | LocalState::Unknown) {
            return Ok(());
        }
        self.mark_deleted(&pair).await
    }

    async fn on_renamed(&self, old: &Path, new: &Path) -> Result<(), SyncError> {
        let local = &self.ctx.local;
        if local.is_ignored(new) {
            return if local.is_ignored(old) { Ok(()) } else { Box::pin(self.on_deleted(old)).await };
        }
        if local.is_ignored(old) {
            return Box::pin(self.on_created(new)).await;
        }
        let Some(pair) = self.ctx.store.get_state_from_local(old).await? else {
            return Box::pin(self.on_created(new)).await;
        };
        let path = new.to_path_buf();
        let Some(info) = self.ctx.local_call(move |l| l.try_get_info(&path)).await? else {
            return Box::pin(self.on_deleted(old)).await;
        };

        if let Some(target) = self.ctx.store.get_state_from_local(new).await? {
            if target.id != pair.id {
                // Renamed over a tracked entry: the source is gone, the target changed
                self.mark_deleted(&pair).await?;
                return Box::pin(self.on_modified(new)).await;
            }
        }

        let info = self.normalized(info).await?;
        self.record_move(&pair, &info).await
    }

    /// Defers a file that is still growing, or handles its disappearance
    async fn still_writing(&self, rel: &Path, abs: &Path) -> Result<(), SyncError> {
        if !self.ctx.local.exists(rel) {
            return Box::pin(self.on_deleted(rel)).await;
        }
        debug!(path = %rel.display(), "File still being written");
        self.defer(abs, DeferReason::Writing, 0);
        Ok(())
    }

    // ========================================================================
    // Deferred paths
    // ========================================================================

    fn lock_deferred(&self) -> MutexGuard<'_, HashMap<PathBuf, Deferred>> {
        match self.deferred.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_delayed(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        match self.delayed_once.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn defer(&self, abs: &Path, reason: DeferReason, attempts: u32) {
        let delay = match reason {
            DeferReason::TempFile => TEMP_FILE_DELAY,
            DeferReason::Writing => WRITING_DELAY,
            DeferReason::Locked => locked_delay(attempts),
        };
        if reason == DeferReason::Locked {
            info!(
                path = %abs.display(),
                attempts,
                delay_secs = delay.as_secs(),
                "File locked by another process, retrying later"
            );
        }
        self.lock_deferred().insert(
            abs.to_path_buf(),
            Deferred {
                next_try: Instant::now() + delay,
                attempts,
                reason,
            },
        );
    }

    /// Number of paths waiting for another look
    pub fn deferred_count(&self) -> usize {
        self.lock_deferred().len()
    }

    /// Looks again at the deferred paths whose delay elapsed
    pub async fn retry_deferred(&self) {
        let now = Instant::now();
        let due: Vec<(PathBuf, u32)> = {
            let mut deferred = self.lock_deferred();
            let keys: Vec<PathBuf> = deferred
                .iter()
                .filter(|(_, entry)| entry.next_try <= now)
                .map(|(path, _)| path.clone())
                .collect();
            keys.into_iter()
                .filter_map(|path| {
                    let entry = deferred.remove(&path)?;
                    let attempts = if entry.reason == DeferReason::Locked { entry.attempts } else { 0 };
                    Some((path, attempts))
                })
                .collect()
        };
        for (abs, attempts) in due {
            self.dispatch(ChangeEvent::Modified(abs), attempts).await;
        }
    }

    /// Handles an event, deferring it when the file is locked
    async fn dispatch(&self, event: ChangeEvent, attempts: u32) {
        let path = event.path().to_path_buf();
        match self.handle_event(event).await {
            Ok(()) => {}
            Err(e) if is_locked(&e) => self.defer(&path, DeferReason::Locked, attempts + 1),
            Err(SyncError::Stopped) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot handle local event"),
        }
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Consumes watcher events until the engine is cancelled
    ///
    /// Events are debounced, then applied in order. On shutdown the
    /// backlog, settled or not, is applied before returning.
    pub async fn run(self: Arc<Self>, mut change_rx: mpsc::Receiver<ChangeEvent>) {
        let debounce = Duration::from_secs(self.ctx.config.sync.debounce_secs);
        let mut queue = DebouncedChangeQueue::new(debounce);
        let mut poll_timer = tokio::time::interval(POLL_INTERVAL);
        let cancel = self.ctx.cancel.clone();

        info!(
            root = %self.ctx.local.root().display(),
            debounce_ms = debounce.as_millis() as u64,
            "Local watcher starting"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = change_rx.recv() => match event {
                    Some(change) => queue.push(change),
                    None => {
                        info!("Change channel closed, local watcher shutting down");
                        break;
                    }
                },

                _ = poll_timer.tick() => {
                    for event in queue.poll() {
                        self.dispatch(event, 0).await;
                    }
                    self.retry_deferred().await;
                }
            }
        }

        while let Ok(change) = change_rx.try_recv() {
            queue.push(change);
        }
        let backlog = queue.drain();
        if !backlog.is_empty() {
            info!(count = backlog.len(), "Flushing local events before shutdown");
            for event in backlog {
                if let Err(e) = self.handle_event(event).await {
                    debug!(error = %e, "Dropped local event during shutdown");
                }
            }
        }
        info!("Local watcher stopped");
    }
}

fn is_locked(err: &SyncError) -> bool {
    err.kind() == ErrorKind::LocalFilesystem(LocalFailure::Locked)
}

fn is_not_found(err: &SyncError) -> bool {
    err.kind() == ErrorKind::LocalFilesystem(LocalFailure::NotFound)
}
