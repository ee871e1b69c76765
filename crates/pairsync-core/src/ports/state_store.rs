//! Pair-state store port (driven/secondary port)
//!
//! This module defines the interface for the durable table of `DocPair`
//! rows and its satellites (filters, transfers, sessions, key/value
//! configuration). The store is the single source of truth for
//! reconciliation and the canonical notifier of the queue.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//!   Errors that callers must branch on are raised as [`DomainError`]
//!   values inside the `anyhow::Error` and can be recovered with
//!   `downcast_ref::<DomainError>()` (duplicate remote pair, ghost row).
//! - Outcomes that are not failures are encoded in return values:
//!   `acquire_state` yields `None` when another worker owns the row,
//!   `synchronize_state` yields `false` when the row went stale.
//! - Every write recomputes `pair_state` through the domain derivation
//!   function and, when the new state is processable, notifies the queue.
//!
//! [`DomainError`]: crate::domain::DomainError

use std::path::Path;
use std::sync::Weak;

use anyhow::Result;
use uuid::Uuid;

use crate::domain::{
    DocPair, Filter, LocalInfo, PairId, PairState, RemoteInfo, Session, Side, Transfer,
    TransferDirection, TransferStatus,
};
use crate::ports::queue::{IQueueSink, QueueItem};

/// Port trait for the pair-state store
#[async_trait::async_trait]
pub trait IPairStateStore: Send + Sync {
    // --- Queue notification ---

    /// Registers the queue receiving admissions
    fn register_queue(&self, sink: Weak<dyn IQueueSink>);

    /// Pushes a pair to the registered queue if its state is processable
    fn queue_pair_state(&self, id: PairId, folderish: bool, pair_state: PairState);

    // --- Inserts ---

    /// Records a local entry unknown to the store (`locally_created`)
    async fn insert_local(&self, info: &LocalInfo, parent_path: &Path) -> Result<PairId>;

    /// Records a remote document unknown to the store (`remotely_created`)
    async fn insert_remote(
        &self,
        info: &RemoteInfo,
        remote_parent_path: &str,
        local_path: &Path,
        local_parent_path: &Path,
    ) -> Result<PairId>;

    // --- Observations ---

    /// Merges a local observation; `row.local_state` is written as-is
    ///
    /// With `versioned`, the row version is bumped. With `queue`, the pair
    /// is pushed to the queue when its new state is processable. Returns
    /// `false` without writing when `row.version` is older than the stored one.
    async fn update_local_state(
        &self,
        row: &DocPair,
        info: &LocalInfo,
        versioned: bool,
        queue: bool,
    ) -> Result<bool>;

    /// Merges a remote observation; `row.remote_state` is written as-is
    ///
    /// Returns `false` when `row.version` is older than the stored one, or
    /// when nothing changed and `force_update` is unset.
    async fn update_remote_state(
        &self,
        row: &DocPair,
        info: &RemoteInfo,
        remote_parent_path: Option<&str>,
        versioned: bool,
        force_update: bool,
    ) -> Result<bool>;

    /// Moves a pair locally: new name and parent path
    async fn update_local_parent_path(
        &self,
        row: &DocPair,
        new_name: &str,
        new_parent_path: &Path,
    ) -> Result<()>;

    /// Rewrites the remote parent path of a pair and, for folders, of its subtree
    async fn update_remote_parent_path(&self, row: &DocPair, new_path: &str) -> Result<()>;

    /// Records a freshly computed local digest without touching states
    async fn update_local_digest(&self, id: PairId, digest: &str) -> Result<()>;

    // --- Reads ---

    async fn get_state_from_id(&self, id: PairId) -> Result<Option<DocPair>>;

    async fn get_state_from_local(&self, path: &Path) -> Result<Option<DocPair>>;

    async fn get_state_from_remote(&self, remote_ref: &str) -> Result<Option<DocPair>>;

    async fn get_state_from_remote_with_path(
        &self,
        remote_ref: &str,
        remote_parent_path: &str,
    ) -> Result<Option<DocPair>>;

    /// Direct children of a local folder path
    async fn get_local_children(&self, path: &Path) -> Result<Vec<DocPair>>;

    /// Direct children of a remote folder
    async fn get_remote_children(&self, remote_ref: &str) -> Result<Vec<DocPair>>;

    /// Children of a remote folder not yet materialized locally
    async fn get_new_remote_children(&self, remote_ref: &str) -> Result<Vec<DocPair>>;

    /// Rows whose local path is `prefix` or below it
    async fn get_states_from_partial_local(&self, prefix: &Path) -> Result<Vec<DocPair>>;

    /// Another row with the same name under the same remote parent
    async fn get_dedupe_pair(
        &self,
        name: &str,
        remote_parent_ref: &str,
        exclude: PairId,
    ) -> Result<Option<DocPair>>;

    /// All rows in a processable state, for the startup requeue
    async fn get_queue_items(&self) -> Result<Vec<QueueItem>>;

    /// Rows whose `error_count` is at least `threshold`
    async fn get_errors(&self, threshold: u32) -> Result<Vec<DocPair>>;

    async fn get_conflicts(&self) -> Result<Vec<DocPair>>;

    async fn get_unsynchronizeds(&self) -> Result<Vec<DocPair>>;

    /// Number of rows, optionally restricted to one pair state
    async fn get_count(&self, state: Option<PairState>) -> Result<u64>;

    // --- Processor ownership ---

    /// Atomically takes ownership of a row; `None` if owned by another worker
    async fn acquire_state(&self, worker_id: u64, id: PairId) -> Result<Option<DocPair>>;

    /// Releases every row owned by the worker
    async fn release_state(&self, worker_id: u64) -> Result<()>;

    /// Clears stale ownership and errors of synchronized rows (startup)
    async fn reinit_processors(&self) -> Result<()>;

    // --- Transitions ---

    /// Marks both sides synchronized (or re-derives with `dynamic_states`)
    ///
    /// Rejected, returning `false`, when the stored version differs from
    /// `version` (defaults to `row.version`).
    async fn synchronize_state(
        &self,
        row: &DocPair,
        version: Option<i64>,
        dynamic_states: bool,
    ) -> Result<bool>;

    /// Moves a pair to the terminal `unsynchronized` state with a reason
    async fn unsynchronize_state(&self, row: &DocPair, reason: &str) -> Result<()>;

    /// Undoes `unsynchronized` on a subtree and rescans it as created
    async fn unset_unsynchronized(&self, row: &DocPair) -> Result<()>;

    /// Deletes a row; folders take their local subtree along
    async fn remove_state(&self, row: &DocPair, remote_recursion: bool) -> Result<()>;

    /// Deletes the descendants of a folder row
    async fn remove_state_children(&self, row: &DocPair, remote_recursion: bool) -> Result<()>;

    /// User conflict resolution: keep one side, re-derive and requeue
    async fn mark_resolved(&self, row: &DocPair, side: Side) -> Result<bool>;

    async fn set_conflict_state(&self, row: &DocPair) -> Result<bool>;

    /// `remote_state = deleted` on the row and its remote subtree
    ///
    /// Only the row itself is queued; descendants go away with it.
    async fn delete_remote_state(&self, row: &DocPair) -> Result<()>;

    /// `local_state = deleted` on the row and its local subtree
    ///
    /// Only the row itself is queued; descendants go away with it.
    async fn delete_local_state(&self, row: &DocPair) -> Result<()>;

    /// Records a failure and parks the row for `retry_in` seconds
    ///
    /// Returns the updated row.
    async fn increase_error(
        &self,
        row: &DocPair,
        code: &str,
        details: Option<&str>,
        incr: u32,
        retry_in: u64,
    ) -> Result<DocPair>;

    /// Clears the error fields and requeues the row
    async fn reset_error(&self, row: &DocPair, last_error: Option<&str>) -> Result<()>;

    /// Bulk rename of local paths below `old_prefix`; returns rows touched
    async fn replace_local_paths(&self, old_prefix: &Path, new_prefix: &Path) -> Result<u64>;

    // --- Filters ---

    async fn get_filters(&self) -> Result<Vec<Filter>>;

    async fn add_filter(&self, path: &str) -> Result<()>;

    async fn remove_filter(&self, path: &str) -> Result<()>;

    async fn is_filter(&self, path: &str) -> Result<bool>;

    // --- Key/value configuration ---

    async fn get_config(&self, key: &str) -> Result<Option<String>>;

    async fn set_config(&self, key: &str, value: &str) -> Result<()>;

    async fn delete_config(&self, key: &str) -> Result<()>;

    // --- Transfers ---

    async fn save_transfer(&self, transfer: &Transfer) -> Result<()>;

    async fn get_transfer(&self, uid: Uuid) -> Result<Option<Transfer>>;

    async fn get_transfer_for_pair(
        &self,
        pair_id: PairId,
        direction: TransferDirection,
    ) -> Result<Option<Transfer>>;

    async fn get_active_transfers(&self) -> Result<Vec<Transfer>>;

    async fn set_transfer_status(&self, uid: Uuid, status: TransferStatus) -> Result<()>;

    /// Moves every transfer in one of `from` to `to`; returns rows touched
    async fn set_transfers_status(&self, from: &[TransferStatus], to: TransferStatus) -> Result<u64>;

    async fn set_transfer_progress(&self, uid: Uuid, progress: u64) -> Result<()>;

    /// Records the batch used by an upload and resets acknowledged chunks
    async fn set_transfer_batch(&self, uid: Uuid, batch_id: &str, chunk_size: u64) -> Result<()>;

    /// Appends an acknowledged chunk index and updates progress
    async fn record_uploaded_chunk(&self, uid: Uuid, index: u32, progress: u64) -> Result<()>;

    async fn remove_transfer(&self, uid: Uuid) -> Result<()>;

    // --- Sessions ---

    async fn create_session(&self, session: &Session) -> Result<()>;

    async fn get_session(&self, uid: Uuid) -> Result<Option<Session>>;

    /// Counts one more uploaded item; completes the session when full
    async fn increase_session_uploaded(&self, uid: Uuid) -> Result<Option<Session>>;

    async fn set_session_status(&self, uid: Uuid, status: TransferStatus) -> Result<()>;

    // --- Maintenance ---

    /// Drops every row, transfer, session and filter (unbind)
    async fn purge(&self) -> Result<()>;
}
