//! Per-pair reconciliation
//!
//! A [`Processor`] takes items from the queue, acquires the pair in the
//! store and runs the handler of its pair state. Handlers move data
//! between the two sides, then write the new side states; whatever is
//! left to do is derived and requeued by the store.
//!
//! Outcomes always go back to the queue: `done` on success, `park` for a
//! later retry, `give_up` once the pair reached `unsynchronized`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pairsync_core::config::DeletionBehavior;
use pairsync_core::domain::{
    DigestAlgorithm, DocPair, DomainError, LocalInfo, LocalState, PairId, PairState, RemoteInfo,
    RemoteState, UNACCESSIBLE_HASH,
};
use pairsync_core::ports::{QueueItem, RemoteError};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::{locked_delay, with_retry, Backoff};
use crate::context::SyncContext;
use crate::digest::{algorithm_for, compute_digest_async};
use crate::engine::EngineEvent;
use crate::local::{safe_filename, LocalError};
use crate::queue::WorkerRole;
use crate::transfer::UploadTarget;
use crate::{ErrorKind, LocalFailure, SyncError};

/// Delay before retrying a pair that could not be worked on right now
pub const POSTPONE_DELAY: Duration = Duration::from_secs(3);

/// Seconds added to the retry delay per recorded failure
const ERROR_RETRY_STEP: u64 = 60;

const READONLY: &str = "READONLY";
const PARENT_UNSYNC: &str = "PARENT_UNSYNC";

/// One worker of the processor pool
pub struct Processor {
    ctx: SyncContext,
    worker_id: u64,
    role: WorkerRole,
    backoff: Backoff,
}

impl Processor {
    pub fn new(ctx: SyncContext, worker_id: u64, role: WorkerRole) -> Self {
        Self {
            ctx,
            worker_id,
            role,
            backoff: Backoff::default(),
        }
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Processes items until the engine is cancelled
    pub async fn run(self) {
        info!(worker_id = self.worker_id, role = ?self.role, "Processor started");
        while let Some(item) = self.ctx.queue.next(self.role, &self.ctx.cancel).await {
            self.process(item).await;
        }
        if let Err(e) = self.ctx.store.release_state(self.worker_id).await {
            warn!(worker_id = self.worker_id, error = %e, "Cannot release pairs");
        }
        info!(worker_id = self.worker_id, "Processor stopped");
    }

    /// Processes one item; the outcome is reported to the queue
    pub async fn process(&self, item: QueueItem) {
        let span = info_span!("process", pair_id = %item.id, worker_id = self.worker_id);
        self.process_item(item).instrument(span).await
    }

    async fn process_item(&self, item: QueueItem) {
        let store = &self.ctx.store;
        let pair = match store.acquire_state(self.worker_id, item.id).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                match store.get_state_from_id(item.id).await {
                    Ok(Some(_)) => {
                        debug!("Pair owned by another processor, postponing");
                        self.ctx.queue.park(item, POSTPONE_DELAY);
                    }
                    Ok(None) => {
                        debug!("Pair removed before processing");
                        self.ctx.queue.done(item.id);
                    }
                    Err(e) => {
                        warn!(error = %e, "Cannot read pair, postponing");
                        self.ctx.queue.park(item, POSTPONE_DELAY);
                    }
                }
                return;
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Cannot acquire pair");
                self.ctx.queue.park(item, POSTPONE_DELAY);
                return;
            }
        };

        let result = self.handle(&pair).await;
        if let Err(e) = store.release_state(self.worker_id).await {
            warn!(error = %e, "Cannot release pair");
        }
        match result {
            Ok(()) => self.ctx.queue.done(item.id),
            Err(err) => self.handle_error(item, &pair, err).await,
        }
    }

    async fn handle(&self, pair: &DocPair) -> Result<(), SyncError> {
        if pair.is_root() || !pair.pair_state.is_processable() {
            debug!(state = %pair.pair_state, "Nothing to do");
            return Ok(());
        }
        if self.ctx.transfers.is_paused(pair).await? {
            debug!("Transfer paused by the user, skipping");
            return Ok(());
        }
        let _guard = self
            .ctx
            .path_locks
            .try_lock(&pair.local_path)
            .ok_or_else(|| SyncError::Interrupted(pair.local_path.display().to_string()))?;

        debug!(state = %pair.pair_state, path = %pair.local_path.display(), "Processing pair");
        match pair.pair_state {
            PairState::LocallyCreated => self.locally_created(pair).await,
            PairState::RemotelyCreated => self.remotely_created(pair).await,
            PairState::LocallyModified => self.locally_modified(pair).await,
            PairState::RemotelyModified => self.remotely_modified(pair).await,
            PairState::LocallyMoved => self.locally_moved(pair).await,
            PairState::RemotelyMoved => self.remotely_moved(pair).await,
            PairState::LocallyMovedRemotelyModified => {
                self.locally_moved_remotely_modified(pair).await
            }
            PairState::RemotelyMovedLocallyModified => {
                self.remotely_moved_locally_modified(pair).await
            }
            PairState::LocallyDeleted => self.locally_deleted(pair).await,
            PairState::RemotelyDeleted => self.remotely_deleted(pair).await,
            PairState::Deleted | PairState::UnknownDeleted | PairState::DeletedUnknown => {
                // Gone on one side, never known or already gone on the other
                self.ctx.store.remove_state(pair, false).await?;
                debug!("Pair forgotten");
                Ok(())
            }
            PairState::LocallyResolved => self.locally_resolved(pair).await,
            PairState::RemotelyResolved => self.remotely_resolved(pair).await,
            PairState::Unknown
            | PairState::Synchronized
            | PairState::Conflicted
            | PairState::Unsynchronized => Ok(()),
        }
    }

    // ========================================================================
    // Creations
    // ========================================================================

    async fn locally_created(&self, pair: &DocPair) -> Result<(), SyncError> {
        let Some(parent) = self.uploadable_parent(pair).await? else {
            return Ok(());
        };
        let parent_ref = parent.remote_ref.clone().unwrap_or_default();
        if !parent.remote_can_create_child {
            return self.unsynchronize(pair, READONLY).await;
        }
        if let Some(other) = self
            .ctx
            .store
            .get_dedupe_pair(&pair.local_name, &parent_ref, pair.id)
            .await?
        {
            if other.pair_state == PairState::RemotelyCreated && other.folderish == pair.folderish {
                // The remote twin adopts this entry when it is processed
                return Err(SyncError::Interrupted(pair.local_path.display().to_string()));
            }
        }

        let (info, digest) = if pair.folderish {
            let name = pair.local_name.clone();
            let info = self
                .remote_call("make_folder", || self.ctx.remote.make_folder(&parent_ref, &name))
                .await?;
            (info, None)
        } else {
            let digest = self.local_digest(pair, algorithm_for(pair)).await?;
            let source = self.ctx.local.abspath(&pair.local_path);
            let target = UploadTarget::Create {
                parent_ref: parent_ref.clone(),
                name: pair.local_name.clone(),
            };
            let info = self.ctx.transfers.upload(pair, &source, &digest, target).await?;
            (info, Some(digest))
        };
        info!(remote_ref = %info.uid, name = %info.name, "Created on the server");

        let path = pair.local_path.clone();
        let uid = info.uid.clone();
        self.ctx.local_call(move |l| l.set_remote_ref(&path, &uid)).await?;
        self.finish_upload(pair, &info, parent.remote_path().as_deref(), digest)
            .await
    }

    async fn remotely_created(&self, pair: &DocPair) -> Result<(), SyncError> {
        let Some(parent) = self.downloadable_parent(pair).await? else {
            return Ok(());
        };
        let Some(info) = self.fetch_info(pair).await? else {
            return Ok(());
        };
        let parent_path = parent.local_path.clone();
        let target = parent_path.join(safe_filename(&info.name));
        if self.ctx.local.exists(&target) {
            return self.adopt_local(pair, &info, &target).await;
        }
        let (dir, name) = (parent_path.clone(), info.name.clone());
        if let Some(twin) = self.ctx.local_call(move |l| l.case_twin(&dir, &name)).await? {
            info!(name = %info.name, existing = %twin, "Name differs only by case from a local entry");
            if info.folderish {
                let abs = self.ctx.local.abspath(&parent_path.join(&twin));
                return Err(LocalError::DuplicationDisabled(abs).into());
            }
            return self.report_conflict(pair).await;
        }

        let (rel, digest) = if info.folderish {
            let name = info.name.clone();
            let rel = self
                .ctx
                .local_call(move |l| l.make_folder(&parent_path, &name))
                .await?;
            (rel, None)
        } else {
            let name = info.name.clone();
            let (rel, abs) = self
                .ctx
                .local_call(move |l| l.get_new_file(&parent_path, &name))
                .await?;
            let downloaded = self.download_next_to(pair, &info, &abs).await?;
            let tmp = downloaded.tmp_path.clone();
            let dest = rel.clone();
            self.ctx.local_call(move |l| l.rename_into(&tmp, &dest)).await?;
            (rel, Some(downloaded.digest))
        };
        info!(path = %rel.display(), remote_ref = %info.uid, "Created locally");
        self.finish_download(pair, &info, &rel, digest).await
    }

    /// Takes over an entry already present at the place of a remote item
    async fn adopt_local(
        &self,
        pair: &DocPair,
        info: &RemoteInfo,
        target: &Path,
    ) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        let abs = self.ctx.local.abspath(target);
        if let Some(other) = store.get_state_from_local(target).await? {
            if other.id != pair.id {
                if other.processor != 0 {
                    return Err(SyncError::Interrupted(target.display().to_string()));
                }
                if other.remote_ref.is_some() || other.local_state != LocalState::Created {
                    return Err(LocalError::DuplicationDisabled(abs).into());
                }
                debug!(other = %other.id, "Merging with the locally created twin");
                store.remove_state(&other, false).await?;
            }
        }

        let path = target.to_path_buf();
        let (local_info, xattr) = self
            .ctx
            .local_call(move |l| Ok((l.get_info(&path)?, l.lookup_remote_ref(&path)?)))
            .await?;
        if local_info.folderish != info.folderish
            || xattr.as_deref().is_some_and(|uid| uid != info.uid)
        {
            return Err(LocalError::DuplicationDisabled(abs).into());
        }
        if info.folderish {
            info!(path = %target.display(), "Existing folder adopted");
            return self.finish_download(pair, info, target, None).await;
        }

        let algorithm = remote_algorithm(info);
        let digest = self.digest_of(target, algorithm).await?;
        if digests_equal(Some(&digest), info.digest.as_deref()) {
            info!(path = %target.display(), "Existing file adopted");
            return self.finish_download(pair, info, target, Some(digest)).await;
        }

        // Same name, different content on both sides
        let path = target.to_path_buf();
        let uid = info.uid.clone();
        self.ctx.local_call(move |l| l.set_remote_ref(&path, &uid)).await?;
        let mut row = pair.clone();
        row.local_state = LocalState::Created;
        row.local_digest = Some(digest);
        store.update_local_state(&row, &local_info, true, false).await?;
        self.report_conflict(pair).await
    }

    // ========================================================================
    // Modifications
    // ========================================================================

    async fn locally_modified(&self, pair: &DocPair) -> Result<(), SyncError> {
        let Some(remote_ref) = pair.remote_ref.clone() else {
            return self.locally_created(pair).await;
        };
        if pair.folderish {
            self.close_pair(pair.id, pair.version, None).await?;
            return Ok(());
        }
        if pair.is_remote_readonly() {
            return self.unsynchronize(pair, READONLY).await;
        }

        let digest = self.local_digest(pair, algorithm_for(pair)).await?;
        let Some(info) = self.fetch_info(pair).await? else {
            return Ok(());
        };
        if digests_equal(Some(&digest), info.digest.as_deref()) {
            debug!("Server already has this content");
            return self.finish_upload(pair, &info, None, Some(digest)).await;
        }
        if pair.remote_digest.is_some()
            && !digests_equal(pair.remote_digest.as_deref(), info.digest.as_deref())
        {
            // Edited on the server since it was last seen
            self.ctx.store.update_local_digest(pair.id, &digest).await?;
            let mut row = pair.clone();
            row.local_digest = Some(digest);
            row.remote_state = RemoteState::Modified;
            self.ctx
                .store
                .update_remote_state(&row, &info, None, true, true)
                .await?;
            return self.report_conflict(pair).await;
        }

        let source = self.ctx.local.abspath(&pair.local_path);
        let info = self
            .ctx
            .transfers
            .upload(pair, &source, &digest, UploadTarget::Update { remote_ref })
            .await?;
        info!(remote_ref = %info.uid, "Content pushed to the server");
        self.finish_upload(pair, &info, None, Some(digest)).await
    }

    async fn remotely_modified(&self, pair: &DocPair) -> Result<(), SyncError> {
        let Some(info) = self.fetch_info(pair).await? else {
            return Ok(());
        };
        if pair.folderish || info.folderish {
            self.close_pair(pair.id, pair.version, None).await?;
            return Ok(());
        }
        self.require_local(&pair.local_path)?;

        let current = self.digest_of(&pair.local_path, remote_algorithm(&info)).await?;
        if digests_equal(Some(&current), info.digest.as_deref()) {
            debug!("Local file already has this content");
            return self
                .finish_download(pair, &info, &pair.local_path, Some(current))
                .await;
        }
        if pair.local_digest.is_some()
            && !digests_equal(pair.local_digest.as_deref(), Some(&current))
        {
            // Edited locally since the last synchronization
            self.ctx.store.update_local_digest(pair.id, &current).await?;
            return self.report_conflict(pair).await;
        }
        self.pull_content(pair, &info).await
    }

    // ========================================================================
    // Moves
    // ========================================================================

    async fn locally_moved(&self, pair: &DocPair) -> Result<(), SyncError> {
        let Some((info, parent_path)) = self.push_move(pair).await? else {
            return Ok(());
        };
        if pair.folderish {
            return self.finish_upload(pair, &info, Some(&parent_path), None).await;
        }

        let digest = self.local_digest(pair, remote_algorithm(&info)).await?;
        if digests_equal(Some(&digest), info.digest.as_deref()) {
            return self
                .finish_upload(pair, &info, Some(&parent_path), Some(digest))
                .await;
        }

        // Edited after the move: the content goes up on the next round
        let store = &self.ctx.store;
        let mut row = self.reload(pair.id).await?;
        row.remote_state = RemoteState::Synchronized;
        store
            .update_remote_state(&row, &info, Some(&parent_path), false, true)
            .await?;
        let local_info = self.local_info(&pair.local_path).await?;
        let mut row = self.reload(pair.id).await?;
        row.local_state = LocalState::Modified;
        row.local_digest = Some(digest);
        store.update_local_state(&row, &local_info, true, true).await?;
        Ok(())
    }

    async fn remotely_moved(&self, pair: &DocPair) -> Result<(), SyncError> {
        let Some(moved) = self.pull_move(pair).await? else {
            return Ok(());
        };
        let store = &self.ctx.store;
        let mut row = self.reload(pair.id).await?;
        row.local_state = LocalState::Synchronized;
        store.update_local_state(&row, &moved.local, false, false).await?;

        let changed = !moved.remote.folderish
            && !digests_equal(pair.local_digest.as_deref(), moved.remote.digest.as_deref());
        row.remote_state = if changed {
            RemoteState::Modified
        } else {
            RemoteState::Synchronized
        };
        store
            .update_remote_state(&row, &moved.remote, Some(&moved.parent_path), false, true)
            .await?;
        if changed {
            debug!("Content changed with the move, downloading next");
            return Ok(());
        }
        self.close_pair(pair.id, moved.expected_version, None).await?;
        Ok(())
    }

    async fn locally_moved_remotely_modified(&self, pair: &DocPair) -> Result<(), SyncError> {
        let Some((info, parent_path)) = self.push_move(pair).await? else {
            return Ok(());
        };
        let store = &self.ctx.store;
        let local_info = self.local_info(&pair.local_path).await?;
        let mut row = self.reload(pair.id).await?;
        row.local_state = LocalState::Synchronized;
        store.update_local_state(&row, &local_info, false, false).await?;
        row.remote_state = RemoteState::Modified;
        store
            .update_remote_state(&row, &info, Some(&parent_path), true, true)
            .await?;
        Ok(())
    }

    async fn remotely_moved_locally_modified(&self, pair: &DocPair) -> Result<(), SyncError> {
        let Some(moved) = self.pull_move(pair).await? else {
            return Ok(());
        };
        let store = &self.ctx.store;
        let mut row = self.reload(pair.id).await?;
        row.remote_state = RemoteState::Synchronized;
        store
            .update_remote_state(&row, &moved.remote, Some(&moved.parent_path), false, true)
            .await?;
        let mut row = self.reload(pair.id).await?;
        row.local_state = LocalState::Modified;
        store.update_local_state(&row, &moved.local, true, true).await?;
        Ok(())
    }

    /// Applies a local move or rename on the server
    ///
    /// Returns the new remote snapshot and the remote path of the new
    /// parent, or `None` when the pair was handled another way.
    async fn push_move(&self, pair: &DocPair) -> Result<Option<(RemoteInfo, String)>, SyncError> {
        let Some(remote_ref) = pair.remote_ref.clone() else {
            self.locally_created(pair).await?;
            return Ok(None);
        };
        let Some(parent) = self.uploadable_parent(pair).await? else {
            return Ok(None);
        };
        let parent_ref = parent.remote_ref.clone().unwrap_or_default();
        let parent_path = parent.remote_path().unwrap_or_default();
        let moved = pair.remote_parent_ref.as_deref() != Some(parent_ref.as_str());
        let renamed = pair.remote_name.as_deref() != Some(pair.local_name.as_str());
        if (moved && !parent.remote_can_create_child) || (renamed && !pair.remote_can_rename) {
            self.unsynchronize(pair, READONLY).await?;
            return Ok(None);
        }

        let mut info = None;
        if moved {
            let moved_info = self
                .remote_call("move", || self.ctx.remote.move_to(&remote_ref, &parent_ref))
                .await?;
            info!(remote_ref = %remote_ref, parent = %parent_ref, "Moved on the server");
            info = Some(moved_info);
        }
        if renamed {
            let name = pair.local_name.clone();
            let renamed_info = self
                .remote_call("rename", || self.ctx.remote.rename(&remote_ref, &name))
                .await?;
            info!(remote_ref = %remote_ref, name = %name, "Renamed on the server");
            info = Some(renamed_info);
        }
        let info = match info {
            Some(info) => info,
            None => match self.fetch_info(pair).await? {
                Some(info) => info,
                None => return Ok(None),
            },
        };

        if moved && pair.folderish {
            self.ctx.store.update_remote_parent_path(pair, &parent_path).await?;
        }
        Ok(Some((info, parent_path)))
    }

    /// Applies a remote move or rename on the local filesystem
    async fn pull_move(&self, pair: &DocPair) -> Result<Option<PulledMove>, SyncError> {
        let Some(info) = self.fetch_info(pair).await? else {
            return Ok(None);
        };
        let store = &self.ctx.store;
        let parent_uid = info.parent_uid.clone().unwrap_or_default();
        let Some(parent) = store.get_state_from_remote(&parent_uid).await? else {
            return Err(parent_not_synced(pair));
        };
        if parent.pair_state == PairState::Unsynchronized {
            self.unsynchronize(pair, PARENT_UNSYNC).await?;
            return Ok(None);
        }
        if !self.ctx.local.exists(&parent.local_path) {
            return Err(parent_not_synced(pair));
        }
        self.require_local(&pair.local_path)?;

        let name = safe_filename(&info.name);
        let moved = pair.local_parent_path != parent.local_path;
        let renamed = pair.local_name != name;
        let source = pair.local_path.clone();
        let new_parent = parent.local_path.clone();
        let local = self
            .ctx
            .local_call(move |l| {
                if moved {
                    l.move_to(&source, &new_parent, Some(&name))
                } else if renamed {
                    l.rename(&source, &name)
                } else {
                    l.get_info(&source)
                }
            })
            .await?;

        let mut expected_version = pair.version;
        if moved || renamed {
            info!(from = %pair.local_path.display(), to = %local.path.display(), "Moved locally");
            store
                .update_local_parent_path(pair, &local.name(), &local.parent_path())
                .await?;
            expected_version += 1;
        }
        Ok(Some(PulledMove {
            remote: info,
            local,
            parent_path: parent.remote_path().unwrap_or_default(),
            expected_version,
        }))
    }

    // ========================================================================
    // Deletions
    // ========================================================================

    async fn locally_deleted(&self, pair: &DocPair) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        let Some(remote_ref) = pair.remote_ref.clone() else {
            store.remove_state(pair, false).await?;
            return Ok(());
        };

        let behavior = self.ctx.config.sync.deletion_behavior;
        if behavior == DeletionBehavior::DeleteServer && pair.remote_can_delete {
            match self
                .remote_call("delete", || self.ctx.remote.delete(&remote_ref))
                .await
            {
                Ok(()) => info!(remote_ref = %remote_ref, "Deleted on the server"),
                Err(SyncError::Remote(RemoteError::NotFound(_))) => {
                    debug!(remote_ref = %remote_ref, "Already gone from the server")
                }
                Err(e) => return Err(e),
            }
        } else if let Some(path) = pair.remote_path() {
            store.add_filter(&path).await?;
            info!(remote_ref = %remote_ref, "Remote document kept and filtered out");
        }
        store.remove_state(pair, true).await?;
        Ok(())
    }

    async fn remotely_deleted(&self, pair: &DocPair) -> Result<(), SyncError> {
        if pair.local_state != LocalState::Unknown {
            let path = pair.local_path.clone();
            self.ctx.local_call(move |l| l.delete(&path)).await?;
        }
        self.ctx.store.remove_state(pair, true).await?;
        Ok(())
    }

    // ========================================================================
    // Resolutions
    // ========================================================================

    /// The user kept the local version of a conflict
    async fn locally_resolved(&self, pair: &DocPair) -> Result<(), SyncError> {
        let Some(remote_ref) = pair.remote_ref.clone() else {
            return self.locally_created(pair).await;
        };
        if pair.folderish {
            self.close_pair(pair.id, pair.version, None).await?;
            return Ok(());
        }
        let digest = self.local_digest(pair, algorithm_for(pair)).await?;
        let source = self.ctx.local.abspath(&pair.local_path);
        let info = self
            .ctx
            .transfers
            .upload(pair, &source, &digest, UploadTarget::Update { remote_ref })
            .await?;
        info!(remote_ref = %info.uid, "Conflict resolved with the local version");
        self.finish_upload(pair, &info, None, Some(digest)).await
    }

    /// The user kept the server version of a conflict
    async fn remotely_resolved(&self, pair: &DocPair) -> Result<(), SyncError> {
        let Some(info) = self.fetch_info(pair).await? else {
            return Ok(());
        };
        if info.folderish {
            self.close_pair(pair.id, pair.version, None).await?;
            return Ok(());
        }
        self.pull_content(pair, &info).await?;
        info!(remote_ref = %info.uid, "Conflict resolved with the server version");
        Ok(())
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    /// Replaces the local file of `pair` with the server content
    async fn pull_content(&self, pair: &DocPair, info: &RemoteInfo) -> Result<(), SyncError> {
        let abs = self.ctx.local.abspath(&pair.local_path);
        let downloaded = self.download_next_to(pair, info, &abs).await?;
        let tmp = downloaded.tmp_path.clone();
        let dest = pair.local_path.clone();
        self.ctx.local_call(move |l| l.rename_into(&tmp, &dest)).await?;
        info!(path = %pair.local_path.display(), "Content pulled from the server");
        self.finish_download(pair, info, &pair.local_path, Some(downloaded.digest))
            .await
    }

    async fn download_next_to(
        &self,
        pair: &DocPair,
        info: &RemoteInfo,
        abs: &Path,
    ) -> Result<crate::transfer::Downloaded, SyncError> {
        let dir = abs
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.ctx.local.root().to_path_buf());
        self.ctx.transfers.download(pair, info, &dir).await
    }

    /// Records the server answer of a local-origin operation, then closes the pair
    async fn finish_upload(
        &self,
        pair: &DocPair,
        info: &RemoteInfo,
        remote_parent_path: Option<&str>,
        digest: Option<String>,
    ) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        if let Some(digest) = &digest {
            store.update_local_digest(pair.id, digest).await?;
        }
        let mut row = self.reload(pair.id).await?;
        row.remote_state = RemoteState::Synchronized;
        store
            .update_remote_state(&row, info, remote_parent_path, false, true)
            .await?;
        self.close_pair(pair.id, pair.version, digest).await?;
        Ok(())
    }

    /// Stamps a freshly written local entry, then closes the pair
    async fn finish_download(
        &self,
        pair: &DocPair,
        info: &RemoteInfo,
        rel: &Path,
        digest: Option<String>,
    ) -> Result<(), SyncError> {
        let path = rel.to_path_buf();
        let uid = info.uid.clone();
        let (mtime, ctime) = (info.last_modification_time, info.creation_time);
        let readonly = if info.folderish {
            !info.can_create_child
        } else {
            !info.can_update
        };
        let folderish = info.folderish;
        let local_info = self
            .ctx
            .local_call(move |l| {
                if !folderish {
                    l.change_file_date(&path, mtime, ctime)?;
                }
                l.set_remote_ref(&path, &uid)?;
                if readonly {
                    l.set_readonly(&path)?;
                }
                l.get_info(&path)
            })
            .await?;

        let store = &self.ctx.store;
        let mut expected_version = pair.version;
        let current = self.reload(pair.id).await?;
        if local_info.path != current.local_path {
            store
                .update_local_parent_path(&current, &local_info.name(), &local_info.parent_path())
                .await?;
            expected_version += 1;
        }
        let mut row = self.reload(pair.id).await?;
        if digest.is_some() {
            row.local_digest = digest.clone();
        }
        store.update_local_state(&row, &local_info, false, false).await?;
        self.close_pair(pair.id, expected_version, digest).await?;
        Ok(())
    }

    /// Marks both sides synchronized unless the pair changed meanwhile
    async fn close_pair(
        &self,
        id: PairId,
        expected_version: i64,
        local_digest: Option<String>,
    ) -> Result<bool, SyncError> {
        let mut row = self.reload(id).await?;
        if local_digest.is_some() {
            row.local_digest = local_digest;
        }
        let closed = self
            .ctx
            .store
            .synchronize_state(&row, Some(expected_version), false)
            .await?;
        if closed {
            debug!("Pair synchronized");
        } else {
            debug!("Pair changed while processing, left for the next round");
        }
        Ok(closed)
    }

    async fn report_conflict(&self, pair: &DocPair) -> Result<(), SyncError> {
        let row = self.reload(pair.id).await?;
        self.ctx.store.set_conflict_state(&row).await?;
        warn!(path = %pair.local_path.display(), "Conflict detected");
        self.ctx.emit(EngineEvent::Conflicted {
            id: pair.id,
            name: pair.display_name().to_string(),
        });
        Ok(())
    }

    async fn unsynchronize(&self, pair: &DocPair, reason: &str) -> Result<(), SyncError> {
        self.ctx.store.unsynchronize_state(pair, reason).await?;
        warn!(path = %pair.local_path.display(), reason, "Pair unsynchronized");
        self.ctx.emit(EngineEvent::Unsynchronized {
            id: pair.id,
            name: pair.display_name().to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Parent a local-origin operation can attach to on the server
    async fn uploadable_parent(&self, pair: &DocPair) -> Result<Option<DocPair>, SyncError> {
        let parent = self
            .ctx
            .store
            .get_state_from_local(&pair.local_parent_path)
            .await?
            .ok_or_else(|| parent_not_synced(pair))?;
        if parent.pair_state == PairState::Unsynchronized {
            self.unsynchronize(pair, PARENT_UNSYNC).await?;
            return Ok(None);
        }
        if parent.remote_ref.is_none() {
            return Err(parent_not_synced(pair));
        }
        Ok(Some(parent))
    }

    /// Parent a remote-origin operation can write into locally
    async fn downloadable_parent(&self, pair: &DocPair) -> Result<Option<DocPair>, SyncError> {
        let parent = self
            .ctx
            .store
            .get_state_from_local(&pair.local_parent_path)
            .await?
            .ok_or_else(|| parent_not_synced(pair))?;
        if parent.pair_state == PairState::Unsynchronized {
            self.unsynchronize(pair, PARENT_UNSYNC).await?;
            return Ok(None);
        }
        if !self.ctx.local.exists(&parent.local_path) {
            return Err(parent_not_synced(pair));
        }
        Ok(Some(parent))
    }

    /// Current server snapshot; a vanished document is recorded as deleted
    async fn fetch_info(&self, pair: &DocPair) -> Result<Option<RemoteInfo>, SyncError> {
        let remote_ref = pair.remote_ref.clone().ok_or_else(|| {
            DomainError::ValidationFailed(format!("{pair} has no remote reference"))
        })?;
        match self
            .remote_call("get_info", || self.ctx.remote.get_info(&remote_ref))
            .await?
        {
            Some(info) => Ok(Some(info)),
            None => {
                info!(remote_ref = %remote_ref, "Remote document gone, recording deletion");
                self.ctx.store.delete_remote_state(pair).await?;
                Ok(None)
            }
        }
    }

    async fn remote_call<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        Ok(with_retry(operation, self.backoff, f).await?)
    }

    async fn reload(&self, id: PairId) -> Result<DocPair, SyncError> {
        self.ctx
            .store
            .get_state_from_id(id)
            .await?
            .ok_or_else(|| DomainError::PairNotFound(id.get()).into())
    }

    async fn local_info(&self, rel: &Path) -> Result<LocalInfo, SyncError> {
        let path = rel.to_path_buf();
        self.ctx.local_call(move |l| l.get_info(&path)).await
    }

    fn require_local(&self, rel: &Path) -> Result<(), SyncError> {
        if self.ctx.local.exists(rel) {
            Ok(())
        } else {
            Err(LocalError::NotFound(self.ctx.local.abspath(rel)).into())
        }
    }

    async fn local_digest(
        &self,
        pair: &DocPair,
        algorithm: DigestAlgorithm,
    ) -> Result<String, SyncError> {
        self.require_local(&pair.local_path)?;
        self.digest_of(&pair.local_path, algorithm).await
    }

    async fn digest_of(&self, rel: &Path, algorithm: DigestAlgorithm) -> Result<String, SyncError> {
        let abs: PathBuf = self.ctx.local.abspath(rel);
        let digest = compute_digest_async(abs.clone(), algorithm).await;
        if digest == UNACCESSIBLE_HASH {
            return Err(LocalError::Locked(abs).into());
        }
        Ok(digest)
    }

    // ========================================================================
    // Failures
    // ========================================================================

    async fn handle_error(&self, item: QueueItem, pair: &DocPair, err: SyncError) {
        let queue = &self.ctx.queue;
        match err.kind() {
            ErrorKind::Paused => {
                debug!(error = %err, "Transfer halted");
                queue.done(item.id);
            }
            ErrorKind::Interrupted => {
                debug!(error = %err, "Postponing");
                queue.park(item, POSTPONE_DELAY);
            }
            ErrorKind::Authentication => {
                error!("Credentials rejected by the server, stopping the engine");
                self.ctx.emit(EngineEvent::InvalidCredentials);
                queue.done(item.id);
                self.ctx.cancel.cancel();
            }
            ErrorKind::Gone => {
                if matches!(err, SyncError::Remote(_)) {
                    info!("Remote document gone, recording deletion");
                    if let Err(e) = self.ctx.store.delete_remote_state(pair).await {
                        warn!(error = %e, "Cannot record remote deletion");
                    }
                }
                queue.done(item.id);
            }
            ErrorKind::Duplication | ErrorKind::LocalFilesystem(LocalFailure::PathTooLong) => {
                self.give_up(item, pair, err.code()).await
            }
            ErrorKind::Integrity if matches!(err, SyncError::UnknownDigest(_)) => {
                self.give_up(item, pair, err.code()).await
            }
            ErrorKind::LocalFilesystem(LocalFailure::NoSpace) => {
                error!(path = %pair.local_path.display(), "No space left on device, suspending");
                self.ctx.emit(EngineEvent::NoSpaceLeft {
                    path: pair.local_path.clone(),
                });
                self.give_up(item, pair, err.code()).await;
                queue.suspend();
            }
            ErrorKind::LocalFilesystem(LocalFailure::Locked) => {
                let delay = locked_delay(pair.error_count + 1);
                let details = err.to_string();
                if let Err(e) = self
                    .ctx
                    .store
                    .increase_error(pair, err.code(), Some(&details), 1, delay.as_secs())
                    .await
                {
                    warn!(error = %e, "Cannot record error");
                }
                debug!(delay_secs = delay.as_secs(), "File locked, retrying later");
                queue.park(item, delay);
            }
            ErrorKind::LocalFilesystem(LocalFailure::NotFound) if pair.remote_ref.is_none() => {
                debug!("Local entry vanished before reaching the server");
                if let Err(e) = self.ctx.store.remove_state(pair, false).await {
                    warn!(error = %e, "Cannot forget pair");
                }
                queue.done(item.id);
            }
            ErrorKind::LocalFilesystem(LocalFailure::NotFound) => {
                debug!(error = %err, "Local entry missing, waiting for the watcher");
                queue.park(item, POSTPONE_DELAY);
            }
            ErrorKind::Invariant => {
                error!(pair = ?pair, error = %err, "Inconsistent pair");
                let details = format!("{err}\n{pair:?}");
                self.record_error(item, pair, &err, details).await
            }
            ErrorKind::TransientNetwork
            | ErrorKind::Authorization
            | ErrorKind::Conflict
            | ErrorKind::Integrity
            | ErrorKind::LocalFilesystem(_) => {
                let details = err.to_string();
                self.record_error(item, pair, &err, details).await
            }
        }
    }

    /// Counts a failure; past `max_errors` the pair is unsynchronized
    async fn record_error(&self, item: QueueItem, pair: &DocPair, err: &SyncError, details: String) {
        let code = err.code();
        let retry_in = ERROR_RETRY_STEP * u64::from(pair.error_count + 1);
        let row = match self
            .ctx
            .store
            .increase_error(pair, code, Some(&details), 1, retry_in)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Cannot record error");
                self.ctx.queue.park(item, Duration::from_secs(retry_in));
                return;
            }
        };

        if row.error_count >= self.ctx.config.sync.max_errors {
            warn!(code, count = row.error_count, error = %err, "Too many failures");
            self.give_up(item, &row, code).await;
        } else {
            warn!(code, count = row.error_count, retry_in, error = %err, "Processing failed, retrying later");
            self.ctx.queue.park(item, Duration::from_secs(retry_in));
        }
    }

    async fn give_up(&self, item: QueueItem, pair: &DocPair, code: &str) {
        if let Err(e) = self.unsynchronize(pair, code).await {
            error!(error = %e, "Cannot unsynchronize pair");
        }
        self.ctx.queue.give_up(item.id, code);
    }
}

/// Result of a remote move applied locally
struct PulledMove {
    remote: RemoteInfo,
    local: LocalInfo,
    parent_path: String,
    expected_version: i64,
}

fn parent_not_synced(pair: &DocPair) -> SyncError {
    SyncError::ParentNotSynced {
        name: pair.display_name().to_string(),
        remote_ref: pair.remote_ref.clone().unwrap_or_default(),
    }
}

fn remote_algorithm(info: &RemoteInfo) -> DigestAlgorithm {
    info.digest
        .as_deref()
        .and_then(DigestAlgorithm::guess)
        .unwrap_or(DigestAlgorithm::Md5)
}

fn digests_equal(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}
