//! Remote change-log polling
//!
//! The [`RemoteWatcher`] keeps the store in line with the server. Each
//! poll sends the last event log id and the active sync roots; the answer
//! is replayed in server order. Without a stored log id, or when the server
//! refuses to replay (`has_too_many_changes`), the registered roots are
//! scanned in full instead.
//!
//! Persistent variables, in the store `Config` table:
//!
//! | key | value |
//! |---|---|
//! | `remote_last_event_log_id` | high-water mark of the change log |
//! | `remote_last_sync_date` | server time of the last poll (ms) |
//! | `remote_last_full_scan` | local time of the last full scan (RFC 3339) |
//! | `remote_active_roots` | comma-separated sync root references |

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pairsync_core::domain::{
    is_filtered, DocPair, DomainError, Filter, PairState, RemoteInfo, RemoteState,
    NOT_IN_BINARY_STORE,
};
use pairsync_core::ports::{ChangeKind, RemoteChange};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{with_retry, Backoff};
use crate::context::SyncContext;
use crate::engine::EngineEvent;
use crate::local::safe_filename;
use crate::{ErrorKind, SyncError};

pub const LAST_EVENT_LOG_ID: &str = "remote_last_event_log_id";
pub const LAST_SYNC_DATE: &str = "remote_last_sync_date";
pub const LAST_FULL_SCAN: &str = "remote_last_full_scan";
pub const ACTIVE_ROOTS: &str = "remote_active_roots";

/// Page size of descendants scrolls
const SCROLL_BATCH_SIZE: u32 = 100;

/// Counters of one poll
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub full_scan: bool,
    pub changes: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Feeds the store from the server
pub struct RemoteWatcher {
    ctx: SyncContext,
    backoff: Backoff,
    wake: Notify,
}

impl RemoteWatcher {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            backoff: Backoff::default(),
            wake: Notify::new(),
        }
    }

    /// Makes the running loop poll now instead of at the next tick
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    async fn root_pair(&self) -> Result<DocPair, SyncError> {
        self.ctx
            .store
            .get_state_from_local(Path::new("/"))
            .await?
            .ok_or_else(|| DomainError::ValidationFailed("root pair missing".to_string()).into())
    }

    async fn active_roots(&self) -> Result<Vec<String>, SyncError> {
        Ok(self
            .ctx
            .store
            .get_config(ACTIVE_ROOTS)
            .await?
            .map(|value| {
                value
                    .split(',')
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// Fetches and applies the changes since the last poll
    #[instrument(skip(self))]
    pub async fn poll(&self) -> Result<PollReport, SyncError> {
        let store = &self.ctx.store;
        let remote = &self.ctx.remote;
        let last_id = store
            .get_config(LAST_EVENT_LOG_ID)
            .await?
            .and_then(|value| value.parse::<i64>().ok());
        let roots = self.active_roots().await?;

        let summary = with_retry("get_changes", self.backoff, || {
            remote.get_changes(last_id.unwrap_or(0), &roots)
        })
        .await?;

        let mut report = PollReport::default();
        if last_id.is_none() || summary.has_too_many_changes {
            if summary.has_too_many_changes {
                info!("Server refused to replay the change log, rescanning");
            }
            report = self.full_scan().await?;
        } else {
            report.changes = summary.file_system_changes.len();
            self.apply_root_changes(&roots, &summary.active_roots, &mut report)
                .await?;
            let mut deleted_trees = Vec::new();
            for change in &summary.file_system_changes {
                if self.ctx.cancel.is_cancelled() {
                    return Err(SyncError::Stopped);
                }
                self.apply_change(change, &mut deleted_trees, &mut report).await?;
            }
        }

        store
            .set_config(LAST_EVENT_LOG_ID, &summary.upper_bound.to_string())
            .await?;
        store
            .set_config(LAST_SYNC_DATE, &summary.sync_date.to_string())
            .await?;
        if !report.full_scan && roots != summary.active_roots {
            store
                .set_config(ACTIVE_ROOTS, &summary.active_roots.join(","))
                .await?;
        }

        if report.changes > 0 || report.full_scan {
            info!(
                full_scan = report.full_scan,
                changes = report.changes,
                created = report.created,
                updated = report.updated,
                deleted = report.deleted,
                upper_bound = summary.upper_bound,
                "Remote poll applied"
            );
        }
        Ok(report)
    }

    /// Scans every registered sync root
    #[instrument(skip(self))]
    pub async fn full_scan(&self) -> Result<PollReport, SyncError> {
        let remote = &self.ctx.remote;
        let store = &self.ctx.store;
        let root_pair = self.root_pair().await?;
        let top_ref = root_pair.remote_ref.clone().unwrap_or_default();
        let roots = with_retry("get_roots", self.backoff, || remote.get_roots()).await?;
        let filters = store.get_filters().await?;

        let mut report = PollReport {
            full_scan: true,
            ..Default::default()
        };
        let mut registered: HashMap<String, DocPair> = store
            .get_remote_children(&top_ref)
            .await?
            .into_iter()
            .filter_map(|pair| pair.remote_ref.clone().map(|r| (r, pair)))
            .collect();

        for root in &roots {
            registered.remove(&root.uid);
            self.scan_subtree(&root_pair, root, &filters, &mut report).await?;
        }
        for (_, stale) in registered {
            if stale.remote_state != RemoteState::Deleted {
                info!(remote_ref = ?stale.remote_ref, "Sync root no longer registered");
                store.delete_remote_state(&stale).await?;
                report.deleted += 1;
            }
        }

        store
            .set_config(
                ACTIVE_ROOTS,
                &roots.iter().map(|r| r.uid.as_str()).collect::<Vec<_>>().join(","),
            )
            .await?;
        store.set_config(LAST_FULL_SCAN, &Utc::now().to_rfc3339()).await?;
        self.ctx.emit(EngineEvent::RemoteScanDone {
            roots: roots.len(),
        });
        Ok(report)
    }

    /// Upserts `top` under `parent` and reconciles all its descendants
    ///
    /// Stored descendants the server no longer lists are marked remotely
    /// deleted; only the topmost one of a vanished subtree is touched.
    async fn scan_subtree(
        &self,
        parent: &DocPair,
        top: &RemoteInfo,
        filters: &[Filter],
        report: &mut PollReport,
    ) -> Result<(), SyncError> {
        let Some(top_pair) = self.upsert(parent, top, filters, report).await? else {
            return Ok(());
        };
        if !top.folderish {
            return Ok(());
        }

        let remote = &self.ctx.remote;
        let mut descendants = Vec::new();
        let mut scroll_id: Option<String> = None;
        loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(SyncError::Stopped);
            }
            let batch = with_retry("scroll_descendants", self.backoff, || {
                remote.scroll_descendants(&top.uid, scroll_id.as_deref(), SCROLL_BATCH_SIZE)
            })
            .await?;
            if batch.file_system_items.is_empty() {
                break;
            }
            descendants.extend(batch.file_system_items);
            match batch.scroll_id {
                Some(next) => scroll_id = Some(next),
                None => break,
            }
        }
        // Parents before children
        descendants.sort_by_key(|info| info.path.matches('/').count());

        let mut folders: HashMap<String, DocPair> = HashMap::new();
        folders.insert(top.uid.clone(), top_pair.clone());
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(top.uid.clone());

        for info in &descendants {
            seen.insert(info.uid.clone());
            let Some(parent_ref) = info.parent_uid.as_deref() else {
                continue;
            };
            let Some(parent_pair) = folders.get(parent_ref).cloned() else {
                debug!(uid = %info.uid, parent_ref, "Parent not tracked, skipping");
                continue;
            };
            if let Some(pair) = self.upsert(&parent_pair, info, filters, report).await? {
                if info.folderish {
                    folders.insert(info.uid.clone(), pair);
                }
            }
        }

        // Vanished descendants, walked parents first
        let mut stack = vec![top_pair];
        while let Some(folder) = stack.pop() {
            let Some(folder_ref) = folder.remote_ref.as_deref() else {
                continue;
            };
            for child in self.ctx.store.get_remote_children(folder_ref).await? {
                let Some(child_ref) = child.remote_ref.clone() else {
                    continue;
                };
                if child.processor != 0 {
                    continue;
                }
                if seen.contains(&child_ref) {
                    if child.folderish {
                        stack.push(child);
                    }
                } else if !matches!(child.remote_state, RemoteState::Deleted | RemoteState::Unknown)
                {
                    debug!(remote_ref = %child_ref, "Missing from remote scan");
                    self.ctx.store.delete_remote_state(&child).await?;
                    report.deleted += 1;
                }
            }
        }
        Ok(())
    }

    /// Records the current state of `info`, a child of `parent`
    ///
    /// Returns the pair, or `None` when the item is filtered, not yet in
    /// the binary store, or below an excluded parent.
    async fn upsert(
        &self,
        parent: &DocPair,
        info: &RemoteInfo,
        filters: &[Filter],
        report: &mut PollReport,
    ) -> Result<Option<DocPair>, SyncError> {
        let store = &self.ctx.store;
        let parent_path = parent.remote_path().unwrap_or_default();
        if is_filtered(filters, &format!("{}/{}", parent_path, info.uid)) {
            debug!(uid = %info.uid, "Filtered remote item");
            return Ok(None);
        }
        if info.digest.as_deref() == Some(NOT_IN_BINARY_STORE) {
            debug!(uid = %info.uid, "Blob not stored yet, skipping");
            return Ok(None);
        }

        if let Some(pair) = store.get_state_from_remote(&info.uid).await? {
            if self.update(&pair, info, &parent_path).await? {
                report.updated += 1;
            }
            return Ok(store.get_state_from_id(pair.id).await?);
        }

        if parent.pair_state == PairState::Unsynchronized
            || parent.local_path.as_os_str().is_empty()
        {
            return Ok(None);
        }
        let local_parent = parent.local_path.clone();
        let local_path = local_parent.join(safe_filename(&info.name));
        if self.ctx.path_locks.is_locked(&local_path) {
            // Most likely the document a processor is creating right now
            debug!(uid = %info.uid, path = %local_path.display(), "Path busy, skipping");
            return Ok(None);
        }
        let id = match store
            .insert_remote(info, &parent_path, &local_path, &local_parent)
            .await
        {
            Ok(id) => id,
            Err(e) if matches!(e.downcast_ref::<DomainError>(), Some(DomainError::DuplicateRemote { .. })) => {
                debug!(uid = %info.uid, "Remote pair inserted concurrently");
                return Ok(store.get_state_from_remote(&info.uid).await?);
            }
            Err(e) => return Err(e.into()),
        };
        report.created += 1;
        debug!(id = %id, uid = %info.uid, path = %local_path.display(), "Remote item tracked");
        Ok(store.get_state_from_id(id).await?)
    }

    /// Merges a new observation of a known item; true if the row changed
    async fn update(
        &self,
        pair: &DocPair,
        info: &RemoteInfo,
        parent_path: &str,
    ) -> Result<bool, SyncError> {
        let store = &self.ctx.store;
        let moved = pair.remote_parent_ref != info.parent_uid
            || pair.remote_name.as_deref() != Some(info.name.as_str());
        let modified = !info.folderish
            && !digests_match(pair.remote_digest.as_deref(), info.digest.as_deref());

        let remote_state = match pair.remote_state {
            RemoteState::Unknown | RemoteState::Created => pair.remote_state,
            RemoteState::Deleted if modified => RemoteState::Modified,
            RemoteState::Deleted => RemoteState::Synchronized,
            RemoteState::Moved => RemoteState::Moved,
            _ if moved => RemoteState::Moved,
            _ if modified => RemoteState::Modified,
            current => current,
        };

        if moved && pair.folderish && pair.remote_parent_path.as_deref() != Some(parent_path) {
            store.update_remote_parent_path(pair, parent_path).await?;
        }
        let mut row = pair.clone();
        row.remote_state = remote_state;
        let versioned = moved || modified;
        let changed = store
            .update_remote_state(&row, info, Some(parent_path), versioned, false)
            .await?;
        if changed {
            debug!(
                id = %pair.id,
                uid = %info.uid,
                moved,
                modified,
                remote_state = %remote_state,
                "Remote item updated"
            );
        }
        Ok(changed)
    }

    // ========================================================================
    // Change log
    // ========================================================================

    /// Scans newly registered roots and drops unregistered ones
    async fn apply_root_changes(
        &self,
        previous: &[String],
        current: &[String],
        report: &mut PollReport,
    ) -> Result<(), SyncError> {
        if previous == current {
            return Ok(());
        }
        let store = &self.ctx.store;
        let root_pair = self.root_pair().await?;
        let filters = store.get_filters().await?;

        for added in current.iter().filter(|r| !previous.contains(r)) {
            let remote = &self.ctx.remote;
            match with_retry("get_info", self.backoff, || remote.get_info(added)).await? {
                Some(info) => {
                    info!(remote_ref = %added, "Sync root registered");
                    self.scan_subtree(&root_pair, &info, &filters, report).await?;
                    self.ctx.emit(EngineEvent::RootBound {
                        remote_ref: added.clone(),
                    });
                }
                None => debug!(remote_ref = %added, "Registered root is not readable"),
            }
        }
        for removed in previous.iter().filter(|r| !current.contains(r)) {
            if let Some(pair) = store.get_state_from_remote(removed).await? {
                info!(remote_ref = %removed, "Sync root unregistered");
                store.delete_remote_state(&pair).await?;
                report.deleted += 1;
                self.ctx.emit(EngineEvent::RootUnbound {
                    remote_ref: removed.clone(),
                });
            }
        }
        Ok(())
    }

    /// Applies one change-log entry
    async fn apply_change(
        &self,
        change: &RemoteChange,
        deleted_trees: &mut Vec<String>,
        report: &mut PollReport,
    ) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        let uid = change.file_system_item_id.as_str();
        trace_change(change);

        let info = match &change.file_system_item {
            Some(info) if info.digest.as_deref() == Some(NOT_IN_BINARY_STORE) => {
                debug!(uid, "Blob not stored yet, skipping change");
                return Ok(());
            }
            Some(info) if change.event_id != ChangeKind::RootUnregistered => info,
            _ => return self.apply_removal(change, deleted_trees, report).await,
        };

        let filters = store.get_filters().await?;
        if change.event_id == ChangeKind::SecurityUpdated {
            if let Some(filter) = self.regranted_filter(info, &filters).await? {
                info!(uid, path = %filter.path, "Read access granted again");
                store.remove_filter(&filter.path).await?;
                let filters = store.get_filters().await?;
                return self.apply_present(info, &filters, report).await;
            }
        }
        self.apply_present(info, &filters, report).await
    }

    /// Handles an entry whose item is readable
    async fn apply_present(
        &self,
        info: &RemoteInfo,
        filters: &[Filter],
        report: &mut PollReport,
    ) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        let parent = match info.parent_uid.as_deref() {
            Some(parent_ref) => store.get_state_from_remote(parent_ref).await?,
            None => None,
        };

        match (store.get_state_from_remote(&info.uid).await?, parent) {
            (Some(pair), Some(parent)) => {
                let parent_path = parent.remote_path().unwrap_or_default();
                if is_filtered(filters, &format!("{}/{}", parent_path, info.uid)) {
                    return Ok(());
                }
                if self.update(&pair, info, &parent_path).await? {
                    report.updated += 1;
                }
            }
            (Some(pair), None) => {
                // Moved out of every synchronized root
                if pair.remote_state != RemoteState::Deleted {
                    info!(uid = %info.uid, "Item left the synchronized roots");
                    store.delete_remote_state(&pair).await?;
                    report.deleted += 1;
                }
            }
            (None, Some(parent)) if parent.folderish => {
                // New item, or a folder moved in with its content
                self.scan_subtree(&parent, info, filters, report).await?;
            }
            (None, _) => debug!(uid = %info.uid, "Item outside the synchronized roots"),
        }
        Ok(())
    }

    /// Handles an entry whose item is gone or unreadable
    async fn apply_removal(
        &self,
        change: &RemoteChange,
        deleted_trees: &mut Vec<String>,
        report: &mut PollReport,
    ) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        let uid = change.file_system_item_id.as_str();
        let Some(pair) = store.get_state_from_remote(uid).await? else {
            return Ok(());
        };
        let Some(tree) = pair.remote_path() else {
            return Ok(());
        };
        if deleted_trees
            .iter()
            .any(|done| tree == *done || tree.starts_with(&format!("{done}/")))
        {
            return Ok(());
        }

        match change.event_id {
            ChangeKind::RootUnregistered => {}
            ChangeKind::SecurityUpdated => {
                info!(uid, path = %tree, "Read access lost, filtering subtree");
                store.add_filter(&tree).await?;
            }
            _ => {
                let remote = &self.ctx.remote;
                if with_retry("exists", self.backoff, || remote.exists(uid)).await? {
                    debug!(uid, "Deleted item still exists, ignoring");
                    return Ok(());
                }
            }
        }

        if pair.remote_state != RemoteState::Deleted {
            store.delete_remote_state(&pair).await?;
            report.deleted += 1;
        }
        deleted_trees.push(tree);
        Ok(())
    }

    /// Filter hiding an item the user may read again, if any
    async fn regranted_filter(
        &self,
        info: &RemoteInfo,
        filters: &[Filter],
    ) -> Result<Option<Filter>, SyncError> {
        let Some(parent_ref) = info.parent_uid.as_deref() else {
            return Ok(None);
        };
        let Some(parent) = self.ctx.store.get_state_from_remote(parent_ref).await? else {
            return Ok(None);
        };
        let path = format!("{}/{}", parent.remote_path().unwrap_or_default(), info.uid);
        Ok(filters.iter().find(|f| f.path == path).cloned())
    }

    // ========================================================================
    // Poll loop
    // ========================================================================

    /// Polls every `sync.delay` seconds until the engine is cancelled
    pub async fn run(self: Arc<Self>) {
        let delay = Duration::from_secs(self.ctx.config.sync.delay.max(1));
        let mut timer = tokio::time::interval(delay);
        let cancel = self.ctx.cancel.clone();
        info!(delay_secs = delay.as_secs(), "Remote watcher starting");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
                _ = self.wake.notified() => {}
            }
            match self.poll().await {
                Ok(_) => {}
                Err(SyncError::Stopped) => break,
                Err(e) if e.kind() == ErrorKind::Authentication => {
                    warn!(error = %e, "Server rejected the credentials, stopping");
                    self.ctx.emit(EngineEvent::InvalidCredentials);
                    cancel.cancel();
                    break;
                }
                Err(e) => warn!(error = %e, "Remote poll failed, retrying at next tick"),
            }
        }
        info!("Remote watcher stopped");
    }
}

fn digests_match(known: Option<&str>, current: Option<&str>) -> bool {
    match (known, current) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

fn trace_change(change: &RemoteChange) {
    tracing::trace!(
        event = ?change.event_id,
        uid = %change.file_system_item_id,
        name = ?change.file_system_item_name,
        date = change.event_date,
        "Remote change"
    );
}
