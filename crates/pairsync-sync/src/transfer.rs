//! Upload and download engine
//!
//! Downloads stream into a temporary `.<name>.<uid>.nxpart` file next to
//! their destination and are verified against the digest announced by the
//! server before the processor renames them into place. A corrupt
//! download restarts from the first byte. Blobs of at most
//! `tmp_file_limit` bytes are read in one piece, without progress or
//! pause checkpoints.
//!
//! Uploads go through a server-side batch. Every acknowledged chunk is
//! recorded on the transfer row so that an interrupted upload resumes
//! from the first missing chunk, even across restarts. An expired batch
//! is replaced by a fresh one.
//!
//! Both directions check for a pause between buffers: a paused, suspended
//! or cancelled transfer returns [`TransferError::Paused`], which the
//! processor treats as a clean stop.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use pairsync_core::config::Config;
use pairsync_core::domain::{
    DigestAlgorithm, DigestKind, DocPair, RemoteInfo, Session, Transfer, TransferDirection,
    TransferStatus,
};
use pairsync_core::ports::{IDownloadStream, IPairStateStore, IRemoteClient, RemoteError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backoff::{with_retry, Backoff};
use crate::digest::Hasher;
use crate::local::{safe_filename, LocalError};
use crate::SyncError;

/// Attempts of a download whose digest does not match
pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

/// Suffix of temporary download files
pub const DOWNLOAD_SUFFIX: &str = ".nxpart";

/// Errors specific to transfers
#[derive(Debug, Error)]
pub enum TransferError {
    /// The transfer was paused, suspended or cancelled at a checkpoint
    #[error("Transfer {0} halted")]
    Paused(Uuid),

    #[error("Corrupted download of {path}: expected {expected}, got {actual}")]
    Corrupted {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The source file changed size while being uploaded
    #[error("{path} changed size during upload: {expected} -> {actual}")]
    SizeChanged {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The source file was rewritten while being uploaded
    #[error("{0} was modified during upload")]
    Modified(PathBuf),
}

/// Document an upload attaches its blob to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// New file document under `parent_ref`
    Create { parent_ref: String, name: String },
    /// New content for an existing document
    Update { remote_ref: String },
}

/// A verified download waiting to be renamed into place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub tmp_path: PathBuf,
    /// Digest of the received bytes with the algorithm of the remote digest
    pub digest: String,
}

/// Runs uploads and downloads for one engine
pub struct TransferEngine {
    store: Arc<dyn IPairStateStore>,
    remote: Arc<dyn IRemoteClient>,
    config: Arc<Config>,
    backoff: Backoff,
    suspended: AtomicBool,
    halted: Mutex<HashMap<Uuid, TransferStatus>>,
}

impl TransferEngine {
    pub fn new(
        store: Arc<dyn IPairStateStore>,
        remote: Arc<dyn IRemoteClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            remote,
            config,
            backoff: Backoff::default(),
            suspended: AtomicBool::new(false),
            halted: Mutex::new(HashMap::new()),
        }
    }

    fn halted(&self) -> MutexGuard<'_, HashMap<Uuid, TransferStatus>> {
        match self.halted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Status a running transfer must stop with, if any
    fn checkpoint(&self, uid: Uuid) -> Option<TransferStatus> {
        if let Some(status) = self.halted().get(&uid) {
            return Some(*status);
        }
        if self.suspended.load(Ordering::Acquire) {
            return Some(TransferStatus::Suspended);
        }
        None
    }

    /// Stops a transfer at its checkpoint and records why
    async fn halt(
        &self,
        transfer: &Transfer,
        status: TransferStatus,
    ) -> Result<TransferError, SyncError> {
        match status {
            TransferStatus::Cancelled => {
                self.discard(transfer).await;
                self.halted().remove(&transfer.uid);
            }
            status => self.store.set_transfer_status(transfer.uid, status).await?,
        }
        info!(uid = %transfer.uid, pair_id = %transfer.pair_id, %status, "Transfer halted");
        Ok(TransferError::Paused(transfer.uid))
    }

    /// Drops the server batch or tmp file of a transfer, then its row
    async fn discard(&self, transfer: &Transfer) {
        if let Some(batch_id) = &transfer.batch_id {
            if let Err(e) = self.remote.cancel_batch(batch_id).await {
                debug!(batch_id, error = %e, "Cannot cancel upload batch");
            }
        }
        if let Some(tmp) = &transfer.tmp_path {
            let _ = tokio::fs::remove_file(tmp).await;
        }
        if let Err(e) = self.store.remove_transfer(transfer.uid).await {
            warn!(uid = %transfer.uid, error = %e, "Cannot remove transfer row");
        }
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    /// Downloads the blob of `info` into a temporary file of `dest_dir`
    ///
    /// The caller renames [`Downloaded::tmp_path`] into place.
    #[instrument(skip(self, pair, info), fields(pair_id = %pair.id, name = %info.name))]
    pub async fn download(
        &self,
        pair: &DocPair,
        info: &RemoteInfo,
        dest_dir: &Path,
    ) -> Result<Downloaded, SyncError> {
        let kind = info
            .digest
            .as_deref()
            .map(|digest| DigestKind::classify(digest, info.digest_algorithm.as_deref()));
        if let Some(DigestKind::Unsupported(name)) = &kind {
            return Err(SyncError::UnknownDigest(format!("{} ({name})", info.name)));
        }
        let algorithm = kind
            .as_ref()
            .and_then(DigestKind::algorithm)
            .unwrap_or(DigestAlgorithm::Md5);
        let verify = !self.config.transfers.disabled_file_integrity_check
            && matches!(kind, Some(DigestKind::Supported(_)));

        let mut transfer = match self
            .store
            .get_transfer_for_pair(pair.id, TransferDirection::Download)
            .await?
        {
            Some(previous) => {
                if let Some(tmp) = &previous.tmp_path {
                    let _ = tokio::fs::remove_file(tmp).await;
                }
                let mut resumed = previous;
                resumed.status = TransferStatus::Ongoing;
                resumed.progress = 0;
                resumed.filesize = info.size;
                resumed
            }
            None => Transfer::new(pair.id, TransferDirection::Download, info.size),
        };
        let tmp_path = dest_dir.join(format!(
            ".{}.{}{DOWNLOAD_SUFFIX}",
            safe_filename(&info.name),
            transfer.uid
        ));
        transfer.tmp_path = Some(tmp_path.clone());
        transfer.digest = info.digest.clone();
        self.store.save_transfer(&transfer).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let digest = match self.fetch(&transfer, info, &tmp_path, algorithm).await {
                Ok(digest) => digest,
                Err(SyncError::Transfer(TransferError::Paused(uid))) => {
                    return Err(TransferError::Paused(uid).into())
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    let _ = self.store.remove_transfer(transfer.uid).await;
                    return Err(e);
                }
            };

            let expected = info.digest.as_deref().unwrap_or_default();
            if !verify || digest.eq_ignore_ascii_case(expected) {
                self.store.remove_transfer(transfer.uid).await?;
                debug!(path = %tmp_path.display(), attempt, "Download complete");
                return Ok(Downloaded { tmp_path, digest });
            }

            warn!(
                path = %tmp_path.display(),
                expected,
                actual = %digest,
                attempt,
                "Downloaded content does not match the remote digest"
            );
            if attempt >= MAX_DOWNLOAD_ATTEMPTS {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                self.store.remove_transfer(transfer.uid).await?;
                return Err(TransferError::Corrupted {
                    path: tmp_path,
                    expected: expected.to_string(),
                    actual: digest,
                }
                .into());
            }
        }
    }

    /// One pass over the remote stream, from byte 0
    async fn fetch(
        &self,
        transfer: &Transfer,
        info: &RemoteInfo,
        tmp_path: &Path,
        algorithm: DigestAlgorithm,
    ) -> Result<String, SyncError> {
        let remote = &self.remote;
        let mut stream = with_retry("download", self.backoff, || remote.download(info)).await?;
        let limit = self.config.transfers.tmp_file_limit;
        if limit > 0 && info.size <= limit {
            return self.fetch_whole(transfer, stream.as_mut(), tmp_path, algorithm).await;
        }

        let mut file = tokio::fs::File::create(tmp_path)
            .await
            .map_err(|e| LocalError::from_io(tmp_path, e))?;
        let mut hasher = Hasher::new(algorithm);
        let mut progress = 0u64;
        let mut reported = 0u64;
        let report_every = self.config.transfers.chunk_size.max(1);

        while let Some(buffer) = stream.next_chunk().await? {
            file.write_all(&buffer)
                .await
                .map_err(|e| LocalError::from_io(tmp_path, e))?;
            hasher.update(&buffer);
            progress += buffer.len() as u64;

            if progress - reported >= report_every {
                self.store.set_transfer_progress(transfer.uid, progress).await?;
                reported = progress;
            }
            if let Some(status) = self.checkpoint(transfer.uid) {
                file.flush().await.map_err(|e| LocalError::from_io(tmp_path, e))?;
                return Err(self.halt(transfer, status).await?.into());
            }
        }

        file.flush().await.map_err(|e| LocalError::from_io(tmp_path, e))?;
        file.sync_all().await.map_err(|e| LocalError::from_io(tmp_path, e))?;
        self.store.set_transfer_progress(transfer.uid, progress).await?;
        Ok(hasher.finalize())
    }

    /// Small blob: read in memory and written in one go, no checkpoints
    async fn fetch_whole(
        &self,
        transfer: &Transfer,
        stream: &mut dyn IDownloadStream,
        tmp_path: &Path,
        algorithm: DigestAlgorithm,
    ) -> Result<String, SyncError> {
        let mut content = Vec::new();
        while let Some(buffer) = stream.next_chunk().await? {
            content.extend_from_slice(&buffer);
        }
        tokio::fs::write(tmp_path, &content)
            .await
            .map_err(|e| LocalError::from_io(tmp_path, e))?;
        self.store
            .set_transfer_progress(transfer.uid, content.len() as u64)
            .await?;

        let mut hasher = Hasher::new(algorithm);
        hasher.update(&content);
        Ok(hasher.finalize())
    }

    // ------------------------------------------------------------------
    // Uploads
    // ------------------------------------------------------------------

    /// Uploads `source` and attaches it to `target`
    ///
    /// `digest` is the local digest of `source`; a stored transfer for a
    /// different content is discarded instead of resumed.
    pub async fn upload(
        &self,
        pair: &DocPair,
        source: &Path,
        digest: &str,
        target: UploadTarget,
    ) -> Result<RemoteInfo, SyncError> {
        self.upload_in_session(pair, source, digest, target, None).await
    }

    /// Same as [`upload`](Self::upload), counting the item in a session
    #[instrument(skip(self, pair, digest, target), fields(pair_id = %pair.id))]
    pub async fn upload_in_session(
        &self,
        pair: &DocPair,
        source: &Path,
        digest: &str,
        target: UploadTarget,
        session: Option<Uuid>,
    ) -> Result<RemoteInfo, SyncError> {
        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| LocalError::from_io(source, e))?;
        let filesize = meta.len();
        let mtime = meta.modified().ok();

        let mut transfer = self.prepare_upload(pair, filesize, digest, session).await?;
        let started = Instant::now();
        let name = match &target {
            UploadTarget::Create { name, .. } => name.clone(),
            UploadTarget::Update { .. } => pair.local_name.clone(),
        };

        let mut restarted = false;
        loop {
            match self.send_chunks(&mut transfer, source, &name).await {
                Ok(()) => break,
                Err(SyncError::Remote(RemoteError::BatchExpired(batch))) if !restarted => {
                    info!(batch, "Upload batch expired, starting over");
                    restarted = true;
                    self.new_batch(&mut transfer).await?;
                }
                Err(e) => return Err(e),
            }
        }

        let current = tokio::fs::metadata(source)
            .await
            .map_err(|e| LocalError::from_io(source, e))?;
        if current.len() != filesize || current.modified().ok() != mtime {
            self.discard(&transfer).await;
            return Err(TransferError::Modified(source.to_path_buf()).into());
        }

        let elapsed = started.elapsed().as_secs();
        let timeout = self
            .config
            .transfers
            .upload_transaction_timeout
            .max(elapsed.saturating_mul(2));
        let Some(batch_id) = transfer.batch_id.clone() else {
            return Err(SyncError::Store(anyhow::anyhow!(
                "upload {} has no batch",
                transfer.uid
            )));
        };
        let remote = &self.remote;
        let info = match &target {
            UploadTarget::Create { parent_ref, name } => {
                remote.create_file(parent_ref, name, &batch_id, timeout).await?
            }
            UploadTarget::Update { remote_ref } => {
                with_retry("update_content", self.backoff, || {
                    remote.update_content(remote_ref, &batch_id, timeout)
                })
                .await?
            }
        };

        self.store.remove_transfer(transfer.uid).await?;
        if let Some(session) = transfer.session_uid {
            if let Some(updated) = self.store.increase_session_uploaded(session).await? {
                debug!(session = %updated.uid, uploaded = updated.uploaded, total = updated.total, "Session progress");
            }
        }
        info!(
            path = %source.display(),
            remote_ref = %info.uid,
            size = filesize,
            elapsed_secs = elapsed,
            "Upload complete"
        );
        Ok(info)
    }

    /// Returns the transfer row to work with, resuming a stored one when
    /// it describes the same content
    async fn prepare_upload(
        &self,
        pair: &DocPair,
        filesize: u64,
        digest: &str,
        session: Option<Uuid>,
    ) -> Result<Transfer, SyncError> {
        if let Some(mut previous) = self
            .store
            .get_transfer_for_pair(pair.id, TransferDirection::Upload)
            .await?
        {
            if previous.status == TransferStatus::Paused {
                return Err(TransferError::Paused(previous.uid).into());
            }
            let same_content = previous.filesize == filesize
                && previous.digest.as_deref() == Some(digest);
            if same_content {
                if let Some(batch_id) = previous.batch_id.clone() {
                    match self.remote.batch_info(&batch_id).await {
                        Ok(Some(state)) => {
                            previous.uploaded_chunks = state.uploaded_chunk_ids;
                            previous.uploaded_chunks.sort_unstable();
                            previous.status = TransferStatus::Ongoing;
                            self.store.save_transfer(&previous).await?;
                            info!(
                                uid = %previous.uid,
                                batch_id,
                                next_chunk = previous.next_chunk(),
                                "Resuming upload"
                            );
                            return Ok(previous);
                        }
                        Ok(None) | Err(RemoteError::BatchExpired(_)) => {
                            info!(uid = %previous.uid, batch_id, "Stored batch is gone");
                            previous.status = TransferStatus::Ongoing;
                            self.new_batch(&mut previous).await?;
                            return Ok(previous);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            info!(uid = %previous.uid, "Local content changed, discarding stored upload");
            self.discard(&previous).await;
        }

        let mut transfer = Transfer::new(pair.id, TransferDirection::Upload, filesize);
        transfer.digest = Some(digest.to_string());
        transfer.session_uid = session;
        self.store.save_transfer(&transfer).await?;
        self.new_batch(&mut transfer).await?;
        Ok(transfer)
    }

    async fn new_batch(&self, transfer: &mut Transfer) -> Result<(), SyncError> {
        let remote = &self.remote;
        let batch_id = with_retry("create_batch", self.backoff, || remote.create_batch()).await?;
        let chunk_size = if transfer.filesize > self.config.transfers.chunk_limit {
            self.config.transfers.chunk_size
        } else {
            transfer.filesize
        };
        self.store
            .set_transfer_batch(transfer.uid, &batch_id, chunk_size)
            .await?;
        transfer.batch_id = Some(batch_id);
        transfer.chunk_size = chunk_size;
        transfer.uploaded_chunks.clear();
        transfer.progress = 0;
        Ok(())
    }

    async fn send_chunks(
        &self,
        transfer: &mut Transfer,
        source: &Path,
        name: &str,
    ) -> Result<(), SyncError> {
        let Some(batch_id) = transfer.batch_id.clone() else {
            return Err(SyncError::Store(anyhow::anyhow!(
                "upload {} has no batch",
                transfer.uid
            )));
        };
        let count = transfer.chunk_count();
        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(|e| LocalError::from_io(source, e))?;

        for index in 0..count {
            if transfer.uploaded_chunks.contains(&index) {
                continue;
            }
            if let Some(status) = self.checkpoint(transfer.uid) {
                return Err(self.halt(transfer, status).await?.into());
            }
            let size = file
                .metadata()
                .await
                .map_err(|e| LocalError::from_io(source, e))?
                .len();
            if size != transfer.filesize {
                self.discard(transfer).await;
                return Err(TransferError::SizeChanged {
                    path: source.to_path_buf(),
                    expected: transfer.filesize,
                    actual: size,
                }
                .into());
            }

            let offset = u64::from(index) * transfer.chunk_size;
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| LocalError::from_io(source, e))?;
            let mut data = Vec::with_capacity(transfer.chunk_size as usize);
            (&mut file)
                .take(transfer.chunk_size)
                .read_to_end(&mut data)
                .await
                .map_err(|e| LocalError::from_io(source, e))?;

            let remote = &self.remote;
            let filesize = transfer.filesize;
            let len = data.len() as u64;
            with_retry("upload_chunk", self.backoff, || {
                remote.upload_chunk(&batch_id, index, count, data.clone(), name, filesize)
            })
            .await?;

            transfer.uploaded_chunks.push(index);
            transfer.progress = (transfer.progress + len).min(filesize);
            self.store
                .record_uploaded_chunk(transfer.uid, index, transfer.progress)
                .await?;
            debug!(uid = %transfer.uid, index, count, "Chunk uploaded");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Opens a session grouping `total` uploads
    pub async fn open_session(&self, description: &str, total: u64) -> anyhow::Result<Session> {
        let session = Session::new(description, total);
        self.store.create_session(&session).await?;
        info!(uid = %session.uid, total, "Transfer session opened");
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Pause, resume, cancel
    // ------------------------------------------------------------------

    /// Pauses a transfer; a running one stops at its next checkpoint
    pub async fn pause(&self, uid: Uuid) -> anyhow::Result<()> {
        self.halted().insert(uid, TransferStatus::Paused);
        self.store.set_transfer_status(uid, TransferStatus::Paused).await?;
        info!(%uid, "Transfer paused");
        Ok(())
    }

    /// Resumes a paused transfer and returns it so that its pair can be
    /// requeued
    pub async fn resume(&self, uid: Uuid) -> anyhow::Result<Option<Transfer>> {
        self.halted().remove(&uid);
        let Some(mut transfer) = self.store.get_transfer(uid).await? else {
            return Ok(None);
        };
        self.store.set_transfer_status(uid, TransferStatus::Ongoing).await?;
        transfer.status = TransferStatus::Ongoing;
        info!(%uid, pair_id = %transfer.pair_id, "Transfer resumed");
        Ok(Some(transfer))
    }

    /// Cancels a transfer: its batch or tmp file and its row are dropped
    pub async fn cancel(&self, uid: Uuid) -> anyhow::Result<()> {
        self.halted().insert(uid, TransferStatus::Cancelled);
        if let Some(transfer) = self.store.get_transfer(uid).await? {
            self.discard(&transfer).await;
        }
        info!(%uid, "Transfer cancelled");
        Ok(())
    }

    /// Raises the suspension flag checked by running transfers
    pub fn request_suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    /// Suspends every ongoing transfer
    pub async fn suspend_all(&self) -> anyhow::Result<u64> {
        self.request_suspend();
        let count = self
            .store
            .set_transfers_status(&[TransferStatus::Ongoing], TransferStatus::Suspended)
            .await?;
        info!(count, "Transfers suspended");
        Ok(count)
    }

    /// Resumes suspended transfers and returns them for requeueing
    pub async fn resume_all(&self) -> anyhow::Result<Vec<Transfer>> {
        self.suspended.store(false, Ordering::Release);
        let suspended: Vec<Transfer> = self
            .store
            .get_active_transfers()
            .await?
            .into_iter()
            .filter(|t| t.status == TransferStatus::Suspended)
            .collect();
        self.store
            .set_transfers_status(&[TransferStatus::Suspended], TransferStatus::Ongoing)
            .await?;
        info!(count = suspended.len(), "Transfers resumed");
        Ok(suspended)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Returns true if the pair has a transfer paused by the user
    pub async fn is_paused(&self, pair: &DocPair) -> anyhow::Result<bool> {
        for direction in [TransferDirection::Upload, TransferDirection::Download] {
            if let Some(transfer) = self.store.get_transfer_for_pair(pair.id, direction).await? {
                if transfer.status == TransferStatus::Paused {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Returns true for temporary download files
pub fn is_download_tmp(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(DOWNLOAD_SUFFIX)
}
