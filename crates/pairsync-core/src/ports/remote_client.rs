//! Remote client port (driven/secondary port)
//!
//! This module defines the interface the synchronization engine uses to
//! talk to the document repository: file-system item CRUD, change-log
//! queries, sync-root registration, locks, and blob transfers through
//! resumable batch sessions.
//!
//! ## Design Notes
//!
//! - Unlike the store port, failures are typed (`RemoteError`): processors
//!   branch on HTTP semantics (401, 403, 404, 409, 5xx) to choose between
//!   retrying, parking and giving up.
//! - Downloads are pulled chunk by chunk through [`IDownloadStream`] so the
//!   transfer engine controls buffering, hashing and pause checkpoints.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::RemoteInfo;

// ============================================================================
// RemoteError
// ============================================================================

/// Errors returned by remote client operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// 401: credentials were rejected or revoked
    #[error("Unauthorized: credentials rejected by the server")]
    Unauthorized,

    /// 403: the user lacks the permission for this operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// 404: the document does not exist or is not visible
    #[error("Not found: {0}")]
    NotFound(String),

    /// 409: concurrent modification on the server
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 429: throttled by the server
    #[error("Too many requests, retry after {retry_after:?} seconds")]
    TooManyRequests {
        /// Seconds announced by `Retry-After`
        retry_after: Option<u64>,
    },

    /// 5xx response
    #[error("Server error {status}: {message}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Body or reason phrase
        message: String,
    },

    /// Transport-level failure (DNS, reset, TLS)
    #[error("Network error: {0}")]
    Network(String),

    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// The upload batch is unknown to the server (expired or purged)
    #[error("Upload batch expired: {0}")]
    BatchExpired(String),

    /// The server answered with something unparseable
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Returns true if retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout | RemoteError::TooManyRequests { .. } => {
                true
            }
            RemoteError::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// HTTP status code carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Unauthorized => Some(401),
            RemoteError::Forbidden(_) => Some(403),
            RemoteError::NotFound(_) => Some(404),
            RemoteError::Conflict(_) => Some(409),
            RemoteError::TooManyRequests { .. } => Some(429),
            RemoteError::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ============================================================================
// Change log types
// ============================================================================

/// Kind of a change-log event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    #[serde(alias = "documentCreated", alias = "documentCreatedByCopy")]
    Created,
    #[serde(alias = "documentModified", alias = "documentRestored")]
    Modified,
    #[serde(alias = "documentMoved")]
    Moved,
    #[serde(alias = "documentRemoved", alias = "documentTrashed")]
    Deleted,
    SecurityUpdated,
    #[serde(alias = "documentLocked")]
    Locked,
    #[serde(alias = "documentUnlocked")]
    Unlocked,
    RootRegistered,
    RootUnregistered,
    #[serde(other)]
    Other,
}

/// One entry of the server change log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub event_id: ChangeKind,
    pub event_date: i64,
    /// Reference of the item the event is about
    pub file_system_item_id: String,
    pub file_system_item_name: Option<String>,
    /// Current state of the item; absent when it is gone or unreadable
    pub file_system_item: Option<RemoteInfo>,
}

/// Summary returned by a change-log poll
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    /// New high-water mark to send on the next poll
    pub upper_bound: i64,
    /// References of the sync roots currently registered for the user
    pub active_roots: Vec<String>,
    pub sync_date: i64,
    /// The server refused to replay: a full rescan is needed
    pub has_too_many_changes: bool,
    pub file_system_changes: Vec<RemoteChange>,
}

/// One page of a descendants scroll
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollBatch {
    pub scroll_id: Option<String>,
    pub file_system_items: Vec<RemoteInfo>,
}

/// Server-side state of an upload batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchState {
    pub batch_id: String,
    /// Chunk indexes the server has accepted
    pub uploaded_chunk_ids: Vec<u32>,
    pub chunk_count: Option<u32>,
}

/// Effective permissions of the current user on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePermissions {
    pub can_read: bool,
    pub can_update: bool,
    pub can_rename: bool,
    pub can_delete: bool,
    pub can_create_child: bool,
}

/// Identity returned by the authentication handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    pub username: String,
    pub token: Option<String>,
    pub server_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Streams and the client trait
// ============================================================================

/// Pull-based body of a download
#[async_trait::async_trait]
pub trait IDownloadStream: Send {
    /// Returns the next buffer, or `None` at end of body
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RemoteError>;

    /// Total size announced by the server, if known
    fn content_length(&self) -> Option<u64>;
}

/// Port trait for the document repository
#[async_trait::async_trait]
pub trait IRemoteClient: Send + Sync {
    /// Authentication handshake; returns the user identity and a token
    async fn fetch_user(&self) -> Result<RemoteUser, RemoteError>;

    /// Fetches a document; `None` when missing or unreadable
    async fn get_info(&self, remote_ref: &str) -> Result<Option<RemoteInfo>, RemoteError>;

    /// Returns true if the document exists and is readable
    async fn exists(&self, remote_ref: &str) -> Result<bool, RemoteError> {
        Ok(self.get_info(remote_ref).await?.is_some())
    }

    /// Lists the direct children of a folder (all pages)
    async fn get_children(&self, remote_ref: &str) -> Result<Vec<RemoteInfo>, RemoteError>;

    /// Fetches one page of the descendants of a folder
    async fn scroll_descendants(
        &self,
        remote_ref: &str,
        scroll_id: Option<&str>,
        batch_size: u32,
    ) -> Result<ScrollBatch, RemoteError>;

    async fn make_folder(&self, parent_ref: &str, name: &str) -> Result<RemoteInfo, RemoteError>;

    async fn rename(&self, remote_ref: &str, name: &str) -> Result<RemoteInfo, RemoteError>;

    async fn move_to(&self, remote_ref: &str, new_parent_ref: &str) -> Result<RemoteInfo, RemoteError>;

    async fn delete(&self, remote_ref: &str) -> Result<(), RemoteError>;

    /// Opens the content stream of a file document
    async fn download(&self, info: &RemoteInfo) -> Result<Box<dyn IDownloadStream>, RemoteError>;

    /// Opens a new upload batch and returns its id
    async fn create_batch(&self) -> Result<String, RemoteError>;

    /// Queries a batch; `None` when the server no longer knows it
    async fn batch_info(&self, batch_id: &str) -> Result<Option<BatchState>, RemoteError>;

    /// Uploads chunk `index` of `count` for the first file of a batch
    async fn upload_chunk(
        &self,
        batch_id: &str,
        index: u32,
        count: u32,
        data: Vec<u8>,
        filename: &str,
        filesize: u64,
    ) -> Result<(), RemoteError>;

    /// Drops a batch and its uploaded chunks
    async fn cancel_batch(&self, batch_id: &str) -> Result<(), RemoteError>;

    /// Creates a file document from the blob of a batch
    async fn create_file(
        &self,
        parent_ref: &str,
        name: &str,
        batch_id: &str,
        transaction_timeout: u64,
    ) -> Result<RemoteInfo, RemoteError>;

    /// Replaces the blob of a file document with the blob of a batch
    async fn update_content(
        &self,
        remote_ref: &str,
        batch_id: &str,
        transaction_timeout: u64,
    ) -> Result<RemoteInfo, RemoteError>;

    /// Polls the change log since `last_event_log_id` for the given roots
    async fn get_changes(
        &self,
        last_event_log_id: i64,
        root_refs: &[String],
    ) -> Result<ChangeSummary, RemoteError>;

    /// Lists the sync roots registered for the user
    async fn get_roots(&self) -> Result<Vec<RemoteInfo>, RemoteError>;

    async fn register_as_root(&self, remote_ref: &str) -> Result<(), RemoteError>;

    async fn unregister_as_root(&self, remote_ref: &str) -> Result<(), RemoteError>;

    async fn permissions(&self, remote_ref: &str) -> Result<RemotePermissions, RemoteError>;

    async fn lock(&self, remote_ref: &str) -> Result<(), RemoteError>;

    async fn unlock(&self, remote_ref: &str) -> Result<(), RemoteError>;

    /// Feature toggles the server publishes for its clients, by name
    async fn server_features(&self) -> Result<HashMap<String, bool>, RemoteError>;
}
