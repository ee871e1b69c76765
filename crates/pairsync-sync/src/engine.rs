//! Synchronization engine of one bound account
//!
//! The [`Engine`] owns every component of the synchronization loop and
//! the tasks running them:
//!
//! ```text
//!   FileWatcher ─→ LocalWatcher ─┐
//!                                 ├─→ store ─→ QueueManager ─→ Processor × N
//!   IRemoteClient ─→ RemoteWatcher┘
//! ```
//!
//! Workers only get a [`SyncContext`]; what they want to tell the outside
//! world goes through the [`EngineEvent`] broadcast channel.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pairsync_core::config::Config;
use pairsync_core::domain::{
    DocPair, DomainError, PairId, PairState, RemoteInfo, RemoteState, Side,
};
use pairsync_core::features::{Feature, FeatureFlags};
use pairsync_core::ports::{IPairStateStore, IQueueSink, IRemoteClient, QueueItem};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backoff::{with_retry, Backoff};
use crate::context::{PathLocks, SyncContext};
use crate::local::{LocalClient, LocalError};
use crate::local_watcher::{LocalWatcher, ScanReport};
use crate::processor::Processor;
use crate::queue::{QueueEvent, QueueManager, QueueMetrics, WorkerRole};
use crate::remote_watcher::{PollReport, RemoteWatcher, LAST_SYNC_DATE};
use crate::transfer::{is_download_tmp, TransferEngine};
use crate::watcher::FileWatcher;
use crate::SyncError;

/// Reference of the server container holding every sync root
pub const TOP_LEVEL_REF: &str = "org.nuxeo.drive.service.impl.DefaultTopLevelFolderItemFactory#";

/// Worker id used by [`Engine::process_queue`]
const INLINE_WORKER_ID: u64 = 1000;

const ENGINE_EVENT_CAPACITY: usize = 256;

/// Something the engine wants the outside world to know
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Started,
    Stopped,
    Suspended,
    Resumed,
    /// The server rejected the stored credentials; the engine stopped
    InvalidCredentials,
    NoSpaceLeft { path: PathBuf },
    Conflicted { id: PairId, name: String },
    Unsynchronized { id: PairId, name: String, reason: String },
    RootBound { remote_ref: String },
    RootUnbound { remote_ref: String },
    LocalScanDone { scanned: usize },
    RemoteScanDone { roots: usize },
    /// The queue ran dry after the initial scans (`--sync-and-quit`)
    SyncCompleted,
}

/// Snapshot of an engine for `status` displays
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub uid: String,
    pub local_folder: PathBuf,
    pub running: bool,
    pub suspended: bool,
    pub synchronization: bool,
    pub pairs: u64,
    pub synchronized: u64,
    pub queue: QueueMetrics,
    pub conflicts: Vec<PairSummary>,
    pub errors: Vec<PairSummary>,
    pub unsynchronized: Vec<PairSummary>,
    pub last_sync_date: Option<String>,
}

/// Short view of a pair needing attention
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairSummary {
    pub id: PairId,
    pub path: PathBuf,
    pub state: String,
    pub error: Option<String>,
    pub error_count: u32,
}

impl From<&DocPair> for PairSummary {
    fn from(pair: &DocPair) -> Self {
        Self {
            id: pair.id,
            path: pair.local_path.clone(),
            state: pair.pair_state.to_string(),
            error: pair.last_error.clone(),
            error_count: pair.error_count,
        }
    }
}

/// What [`clean_folder`] removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub attributes: usize,
    pub tmp_files: usize,
}

/// Synchronization engine of one bound account
///
/// An engine runs once: after [`stop`](Engine::stop) a new one must be
/// built over the same store.
pub struct Engine {
    uid: String,
    ctx: SyncContext,
    local_watcher: Arc<LocalWatcher>,
    remote_watcher: Arc<RemoteWatcher>,
    watcher: Mutex<Option<FileWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    backoff: Backoff,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        features: Arc<FeatureFlags>,
        store: Arc<dyn IPairStateStore>,
        remote: Arc<dyn IRemoteClient>,
        local_folder: impl Into<PathBuf>,
        uid: impl Into<String>,
    ) -> Self {
        let uid = uid.into();
        let sidecar = config
            .general
            .nxdrive_home
            .join("engines")
            .join(format!("{uid}.xattrs.json"));
        let local = Arc::new(LocalClient::new(local_folder, &config, Some(sidecar)));
        let transfers = Arc::new(TransferEngine::new(
            store.clone(),
            remote.clone(),
            config.clone(),
        ));
        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        let ctx = SyncContext {
            store,
            remote,
            local,
            queue: Arc::new(QueueManager::new()),
            transfers,
            config,
            features,
            path_locks: PathLocks::new(),
            cancel: CancellationToken::new(),
            events,
        };
        Self {
            uid,
            local_watcher: Arc::new(LocalWatcher::new(ctx.clone())),
            remote_watcher: Arc::new(RemoteWatcher::new(ctx.clone())),
            ctx,
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            backoff: Backoff::default(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn local_folder(&self) -> &Path {
        self.ctx.local.root()
    }

    pub fn local(&self) -> &Arc<LocalClient> {
        &self.ctx.local
    }

    pub fn store(&self) -> &Arc<dyn IPairStateStore> {
        &self.ctx.store
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.ctx.queue
    }

    pub fn transfers(&self) -> &Arc<TransferEngine> {
        &self.ctx.transfers
    }

    pub fn local_watcher(&self) -> &Arc<LocalWatcher> {
        &self.local_watcher
    }

    pub fn remote_watcher(&self) -> &Arc<RemoteWatcher> {
        &self.remote_watcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    pub fn subscribe_queue(&self) -> broadcast::Receiver<QueueEvent> {
        self.ctx.queue.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.lock_tasks().is_empty() && !self.ctx.cancel.is_cancelled()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.lock_tasks().push(tokio::spawn(task));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Creates the root pair on first start and marks the root folder
    pub async fn init_root(&self) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        if store.get_state_from_local(Path::new("/")).await?.is_some() {
            return Ok(());
        }
        let root = self.ctx.local.root().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| LocalError::from_io(&root, e))?;

        let info = self
            .ctx
            .local_call(|l| l.get_info(Path::new("/")))
            .await?;
        let id = store.insert_local(&info, Path::new("")).await?;
        let mut row = self.reload(id).await?;
        row.remote_state = RemoteState::Synchronized;
        store
            .update_remote_state(&row, &top_level_info(), Some(""), false, true)
            .await?;
        let row = self.reload(id).await?;
        store.synchronize_state(&row, None, false).await?;

        let server_url = store.get_config("server_url").await?.unwrap_or_default();
        let user = store.get_config("remote_user").await?.unwrap_or_default();
        let marker = format!("{server_url}|{user}|{}|{TOP_LEVEL_REF}", self.uid);
        self.ctx.local_call(move |l| l.set_root_id(&marker)).await?;
        store
            .set_config("local_folder", &root.to_string_lossy())
            .await?;
        info!(uid = %self.uid, root = %root.display(), "Root pair created");
        Ok(())
    }

    /// Prepares the store and the queue without starting any task
    async fn prepare(&self) -> Result<usize, SyncError> {
        self.init_root().await?;
        let store = &self.ctx.store;
        store.reinit_processors().await?;

        let sink: Arc<dyn IQueueSink> = self.ctx.queue.clone();
        store.register_queue(Arc::downgrade(&sink));

        let resumed = self.ctx.transfers.resume_all().await?;
        if !resumed.is_empty() {
            debug!(count = resumed.len(), "Suspended transfers picked up again");
        }
        let queued = self.ctx.queue.init(store.as_ref()).await?;
        Ok(queued)
    }

    /// Starts the watchers, the requeue loop and the processors
    #[instrument(skip(self), fields(uid = %self.uid))]
    pub async fn start(&self) -> Result<(), SyncError> {
        let queued = self.prepare().await?;

        let (mut watcher, change_rx) = FileWatcher::new()?;
        watcher.watch(self.ctx.local.root())?;
        *self.lock_watcher() = Some(watcher);

        let local_watcher = self.local_watcher.clone();
        let events = self.ctx.events.clone();
        self.spawn(async move {
            match local_watcher.scan().await {
                Ok(report) => {
                    let _ = events.send(EngineEvent::LocalScanDone {
                        scanned: report.scanned,
                    });
                }
                Err(e) => error!(error = %e, "Initial local scan failed"),
            }
            local_watcher.run(change_rx).await;
        });

        self.spawn(self.remote_watcher.clone().run());

        let queue = self.ctx.queue.clone();
        let cancel = self.ctx.cancel.clone();
        self.spawn(async move { queue.run_requeue(cancel).await });

        let check_delay = self.ctx.config.network.update_check_delay;
        if check_delay > 0 {
            self.spawn(watch_server_options(
                self.ctx.clone(),
                Duration::from_secs(check_delay),
            ));
        }

        let workers = self.spawn_processors();
        info!(queued, workers, "Engine started");
        self.ctx.emit(EngineEvent::Started);
        Ok(())
    }

    fn spawn_processors(&self) -> usize {
        if !self.ctx.features.is_enabled(Feature::Synchronization) {
            info!("Synchronization disabled, processors not started");
            return 0;
        }
        let roles = WorkerRole::pool(self.ctx.config.sync.max_file_processors as usize);
        let count = roles.len();
        for (index, role) in roles.into_iter().enumerate() {
            let processor = Processor::new(self.ctx.clone(), index as u64 + 1, role);
            self.spawn(processor.run());
        }
        count
    }

    fn lock_watcher(&self) -> MutexGuard<'_, Option<FileWatcher>> {
        match self.watcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stops every task; running transfers are suspended for the next start
    #[instrument(skip(self), fields(uid = %self.uid))]
    pub async fn stop(&self) {
        self.ctx.transfers.request_suspend();
        self.ctx.cancel.cancel();
        self.lock_watcher().take();

        let tasks = std::mem::take(&mut *self.lock_tasks());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Engine task ended abnormally");
            }
        }
        if let Err(e) = self.ctx.store.reinit_processors().await {
            warn!(error = %e, "Cannot release pairs");
        }
        info!("Engine stopped");
        self.ctx.emit(EngineEvent::Stopped);
    }

    /// One local scan, one remote poll, then processing until the queue
    /// runs dry
    #[instrument(skip(self), fields(uid = %self.uid))]
    pub async fn sync_and_quit(&self) -> Result<(), SyncError> {
        self.prepare().await?;
        let mut queue_events = self.ctx.queue.subscribe();

        let report = self.local_watcher.scan().await?;
        self.ctx.emit(EngineEvent::LocalScanDone {
            scanned: report.scanned,
        });
        self.remote_watcher.poll().await?;

        let queue = self.ctx.queue.clone();
        let cancel = self.ctx.cancel.clone();
        self.spawn(async move { queue.run_requeue(cancel).await });
        if self.spawn_processors() > 0 {
            while !self.ctx.queue.is_idle() && !self.ctx.cancel.is_cancelled() {
                tokio::select! {
                    event = queue_events.recv() => {
                        if let Err(broadcast::error::RecvError::Closed) = event {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }

        info!("Queue empty, quitting");
        self.ctx.emit(EngineEvent::SyncCompleted);
        self.stop().await;
        Ok(())
    }

    // ========================================================================
    // Single steps, for callers driving the engine by hand
    // ========================================================================

    /// Prepares the engine for [`scan_local`](Self::scan_local),
    /// [`poll_remote`](Self::poll_remote) and
    /// [`process_queue`](Self::process_queue)
    pub async fn init(&self) -> Result<usize, SyncError> {
        self.prepare().await
    }

    pub async fn scan_local(&self) -> Result<ScanReport, SyncError> {
        self.local_watcher.scan().await
    }

    pub async fn poll_remote(&self) -> Result<PollReport, SyncError> {
        self.remote_watcher.poll().await
    }

    /// Processes queued items on the calling task until none is ready
    ///
    /// Parked items are left alone. Returns the number of items handled.
    pub async fn process_queue(&self) -> usize {
        let processor = Processor::new(self.ctx.clone(), INLINE_WORKER_ID, WorkerRole::Generic);
        let mut processed = 0;
        while let Some(item) = self.ctx.queue.try_next(WorkerRole::Generic) {
            processor.process(item).await;
            processed += 1;
        }
        processed
    }

    /// Applies the feature toggles the server publishes
    ///
    /// Returns the number of features that changed value.
    pub async fn refresh_server_options(&self) -> Result<usize, SyncError> {
        refresh_server_options(&self.ctx).await
    }

    // ========================================================================
    // User actions
    // ========================================================================

    pub async fn suspend(&self) -> Result<(), SyncError> {
        self.ctx.queue.suspend();
        self.ctx.transfers.suspend_all().await?;
        info!(uid = %self.uid, "Engine suspended");
        self.ctx.emit(EngineEvent::Suspended);
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SyncError> {
        let resumed = self.ctx.transfers.resume_all().await?;
        for transfer in resumed {
            self.requeue(transfer.pair_id).await?;
        }
        self.ctx.queue.resume();
        info!(uid = %self.uid, "Engine resumed");
        self.ctx.emit(EngineEvent::Resumed);
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.ctx.queue.is_suspended()
    }

    /// Keeps the local version of a conflicted pair
    pub async fn resolve_with_local(&self, id: PairId) -> Result<(), SyncError> {
        self.resolve(id, Side::Local).await
    }

    /// Keeps the server version of a conflicted pair
    pub async fn resolve_with_remote(&self, id: PairId) -> Result<(), SyncError> {
        self.resolve(id, Side::Remote).await
    }

    async fn resolve(&self, id: PairId, side: Side) -> Result<(), SyncError> {
        let pair = self.reload(id).await?;
        if pair.pair_state != PairState::Conflicted {
            return Err(DomainError::ValidationFailed(format!(
                "{} is {}, not conflicted",
                pair.local_path.display(),
                pair.pair_state
            ))
            .into());
        }
        if !self.ctx.store.mark_resolved(&pair, side).await? {
            return Err(DomainError::ValidationFailed(format!(
                "{} changed while resolving",
                pair.local_path.display()
            ))
            .into());
        }
        info!(pair_id = %id, side = ?side, "Conflict resolved");
        Ok(())
    }

    /// Registers a server folder as a sync root
    pub async fn bind_root(&self, remote_ref: &str) -> Result<(), SyncError> {
        let remote = &self.ctx.remote;
        with_retry("register_as_root", self.backoff, || remote.register_as_root(remote_ref))
            .await?;
        info!(remote_ref, "Sync root registered");
        self.remote_watcher.wake();
        Ok(())
    }

    pub async fn unbind_root(&self, remote_ref: &str) -> Result<(), SyncError> {
        let remote = &self.ctx.remote;
        with_retry("unregister_as_root", self.backoff, || {
            remote.unregister_as_root(remote_ref)
        })
        .await?;
        info!(remote_ref, "Sync root unregistered");
        self.remote_watcher.wake();
        Ok(())
    }

    /// Stops mirroring the remote subtree at `path`
    ///
    /// The subtree is removed locally, the server keeps it.
    pub async fn add_filter(&self, path: &str) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        store.add_filter(path).await?;
        let remote_ref = path.rsplit('/').next().unwrap_or_default();
        if let Some(pair) = store.get_state_from_remote(remote_ref).await? {
            store.delete_remote_state(&pair).await?;
        }
        info!(path, "Filter added");
        Ok(())
    }

    /// Mirrors the remote subtree at `path` again
    pub async fn remove_filter(&self, path: &str) -> Result<(), SyncError> {
        self.ctx.store.remove_filter(path).await?;
        info!(path, "Filter removed, rescanning");
        self.remote_watcher.full_scan().await?;
        Ok(())
    }

    pub async fn pause_transfer(&self, uid: Uuid) -> Result<(), SyncError> {
        self.ctx.transfers.pause(uid).await?;
        Ok(())
    }

    pub async fn resume_transfer(&self, uid: Uuid) -> Result<(), SyncError> {
        if let Some(transfer) = self.ctx.transfers.resume(uid).await? {
            self.requeue(transfer.pair_id).await?;
        }
        Ok(())
    }

    pub async fn cancel_transfer(&self, uid: Uuid) -> Result<(), SyncError> {
        self.ctx.transfers.cancel(uid).await?;
        Ok(())
    }

    /// Gives a failed or unsynchronized pair another chance
    pub async fn retry_pair(&self, id: PairId) -> Result<(), SyncError> {
        let pair = self.reload(id).await?;
        if pair.pair_state == PairState::Unsynchronized {
            self.ctx.store.unset_unsynchronized(&pair).await?;
        } else {
            self.ctx.store.reset_error(&pair, None).await?;
        }
        info!(pair_id = %id, "Pair retried");
        Ok(())
    }

    async fn requeue(&self, id: PairId) -> Result<(), SyncError> {
        if let Some(pair) = self.ctx.store.get_state_from_id(id).await? {
            if pair.pair_state.is_processable() {
                self.ctx
                    .queue
                    .push_user(QueueItem::new(pair.id, pair.folderish, pair.pair_state));
            }
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<EngineStatus, SyncError> {
        let store = &self.ctx.store;
        let summaries =
            |pairs: Vec<DocPair>| -> Vec<PairSummary> { pairs.iter().map(PairSummary::from).collect() };
        Ok(EngineStatus {
            uid: self.uid.clone(),
            local_folder: self.ctx.local.root().to_path_buf(),
            running: self.is_running(),
            suspended: self.is_suspended(),
            synchronization: self.ctx.features.is_enabled(Feature::Synchronization),
            pairs: store.get_count(None).await?,
            synchronized: store.get_count(Some(PairState::Synchronized)).await?,
            queue: self.ctx.queue.metrics(),
            conflicts: summaries(store.get_conflicts().await?),
            errors: summaries(store.get_errors(1).await?),
            unsynchronized: summaries(store.get_unsynchronizeds().await?),
            last_sync_date: store.get_config(LAST_SYNC_DATE).await?,
        })
    }

    /// Forgets the account: store purged, local attributes removed
    pub async fn unbind(&self) -> Result<CleanReport, SyncError> {
        if self.is_running() {
            self.stop().await;
        }
        self.ctx.store.purge().await?;
        let root = self.ctx.local.root().to_path_buf();
        let report = self.ctx.local_call(move |l| clean_with(l, &root)).await?;
        info!(uid = %self.uid, "Engine unbound");
        Ok(report)
    }

    async fn reload(&self, id: PairId) -> Result<DocPair, SyncError> {
        self.ctx
            .store
            .get_state_from_id(id)
            .await?
            .ok_or_else(|| DomainError::PairNotFound(id.get()).into())
    }
}

/// Strips client attributes and leftover download files below `local_folder`
async fn refresh_server_options(ctx: &SyncContext) -> Result<usize, SyncError> {
    let values = ctx.remote.server_features().await?;
    let changed = ctx.features.apply_server(&values);
    if changed > 0 {
        info!(changed, "Server options applied");
    }
    Ok(changed)
}

/// Refreshes the server options every `delay` until the engine stops
async fn watch_server_options(ctx: SyncContext, delay: Duration) {
    let mut timer = tokio::time::interval(delay);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = timer.tick() => {}
        }
        if let Err(e) = refresh_server_options(&ctx).await {
            debug!(error = %e, "Server options unavailable, keeping current values");
        }
    }
}

pub fn clean_folder(local_folder: &Path, config: &Config) -> Result<CleanReport, LocalError> {
    let client = LocalClient::new(local_folder, config, None);
    clean_with(&client, local_folder)
}

fn clean_with(client: &LocalClient, root: &Path) -> Result<CleanReport, LocalError> {
    let attributes = client.clean_xattrs(Path::new("/"))?;
    let tmp_files = remove_download_leftovers(root)?;
    info!(root = %root.display(), attributes, tmp_files, "Folder cleaned");
    Ok(CleanReport {
        attributes,
        tmp_files,
    })
}

fn remove_download_leftovers(dir: &Path) -> Result<usize, LocalError> {
    let mut removed = 0;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(LocalError::from_io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| LocalError::from_io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| LocalError::from_io(&path, e))?;
        if file_type.is_dir() {
            removed += remove_download_leftovers(&path)?;
        } else if file_type.is_file() && is_download_tmp(&entry.file_name().to_string_lossy()) {
            fs::remove_file(&path).map_err(|e| LocalError::from_io(&path, e))?;
            debug!(path = %path.display(), "Download leftover removed");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Snapshot of the server container every sync root lives in
fn top_level_info() -> RemoteInfo {
    RemoteInfo {
        uid: TOP_LEVEL_REF.to_string(),
        parent_uid: None,
        path: "/".to_string(),
        name: "Nuxeo Drive".to_string(),
        folderish: true,
        size: 0,
        digest: None,
        digest_algorithm: None,
        last_modification_time: None,
        creation_time: None,
        last_contributor: None,
        download_url: None,
        can_rename: false,
        can_update: false,
        can_delete: false,
        can_create_child: false,
        lock_owner: None,
    }
}
