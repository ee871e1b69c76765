//! PairSync Sync - Bidirectional synchronization engine
//!
//! Provides:
//! - A path client that owns every mutation under the sync root
//! - Local and remote watchers feeding the pair-state store
//! - A partitioned work queue with an error park
//! - Processors reconciling one pair at a time
//! - Resumable chunked uploads and verified downloads
//!
//! ## Modules
//!
//! - [`local`] - Path client: ignore rules, names, extended attributes
//! - [`watcher`] - `notify` wrapper and debounced change queue
//! - [`local_watcher`] - Initial local scan and filesystem event handling
//! - [`remote_watcher`] - Change-log polling and full remote scans
//! - [`queue`] - Queue manager with folder-first partitions
//! - [`processor`] - Per-pair reconciliation handlers
//! - [`transfer`] - Upload and download engine
//! - [`engine`] - Owner of all of the above for one bound account

pub mod backoff;
pub mod context;
pub mod digest;
pub mod engine;
pub mod local;
pub mod local_watcher;
pub mod processor;
pub mod queue;
pub mod remote_watcher;
pub mod transfer;
pub mod watcher;

pub use engine::{clean_folder, CleanReport, Engine, EngineEvent, EngineStatus, PairSummary, TOP_LEVEL_REF};
pub use local::{LocalClient, LocalError};
pub use transfer::{TransferEngine, TransferError};

use pairsync_core::domain::DomainError;
use pairsync_core::ports::RemoteError;
use thiserror::Error;

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// A filesystem operation under the sync root failed
    #[error(transparent)]
    Local(#[from] LocalError),

    /// The server refused or failed a request
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// An upload or download could not complete
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A domain rule was violated
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The pair-state store failed
    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),

    /// The parent of a pair has not been synchronized yet
    #[error("Parent of {name} ({remote_ref}) is not synchronized yet")]
    ParentNotSynced {
        name: String,
        remote_ref: String,
    },

    /// Another processor holds the path
    #[error("Path in use by another processor: {0}")]
    Interrupted(String),

    /// The server announced a digest the client cannot compute
    #[error("Unsupported digest for {0}")]
    UnknownDigest(String),

    /// The engine is shutting down
    #[error("Engine stopped")]
    Stopped,
}

/// Failure classes of local filesystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFailure {
    ReadOnly,
    Locked,
    NoSpace,
    PathTooLong,
    CrossDevice,
    TrashRefused,
    NotFound,
    Other,
}

/// Classification of any synchronization failure
///
/// Processors choose between retrying, parking and giving up from this
/// value alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection reset, timeout, throttling or 5xx
    TransientNetwork,
    /// Credentials rejected (401)
    Authentication,
    /// Permission denied by the server (403)
    Authorization,
    /// The document vanished on the server (404)
    Gone,
    /// Digest mismatch or digest the client cannot verify
    Integrity,
    /// Concurrent modification on the server (409)
    Conflict,
    LocalFilesystem(LocalFailure),
    /// Two documents compete for the same local name
    Duplication,
    /// Programmer error or corrupted state
    Invariant,
    /// The transfer was paused or suspended by the user
    Paused,
    /// The pair must be retried shortly
    Interrupted,
}

impl SyncError {
    /// Classifies the error into an [`ErrorKind`]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Local(err) => err.kind(),
            SyncError::Remote(err) => remote_kind(err),
            SyncError::Transfer(err) => match err {
                TransferError::Paused(_) => ErrorKind::Paused,
                TransferError::Corrupted { .. } => ErrorKind::Integrity,
                TransferError::SizeChanged { .. } | TransferError::Modified(_) => {
                    ErrorKind::Interrupted
                }
            },
            SyncError::Domain(err) => domain_kind(err),
            SyncError::Store(err) => match err.downcast_ref::<DomainError>() {
                Some(err) => domain_kind(err),
                None => ErrorKind::Invariant,
            },
            SyncError::ParentNotSynced { .. } | SyncError::Interrupted(_) | SyncError::Stopped => {
                ErrorKind::Interrupted
            }
            SyncError::UnknownDigest(_) => ErrorKind::Integrity,
        }
    }

    /// Short code recorded in `last_error`
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::TransientNetwork => match self {
                SyncError::Remote(RemoteError::ServerError { .. }) => "SERVER_ERROR",
                _ => "CONNECTION_ERROR",
            },
            ErrorKind::Authentication => "INVALID_CREDENTIALS",
            ErrorKind::Authorization => "FORBIDDEN",
            ErrorKind::Gone => "NOT_FOUND",
            ErrorKind::Integrity => match self {
                SyncError::UnknownDigest(_) => "UNKNOWN_DIGEST",
                _ => "CORRUPT",
            },
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::LocalFilesystem(failure) => match failure {
                LocalFailure::ReadOnly => "READONLY",
                LocalFailure::Locked => "LOCKED",
                LocalFailure::NoSpace => "NO_SPACE_LEFT_ON_DEVICE",
                LocalFailure::PathTooLong => "PATH_TOO_LONG",
                LocalFailure::CrossDevice => "CROSS_DEVICE",
                LocalFailure::TrashRefused => "TRASH_REFUSED",
                LocalFailure::NotFound => "LOCAL_NOT_FOUND",
                LocalFailure::Other => "LOCAL_ERROR",
            },
            ErrorKind::Duplication => "DEDUP",
            ErrorKind::Invariant => "INVARIANT",
            ErrorKind::Paused => "PAUSED",
            ErrorKind::Interrupted => match self {
                SyncError::ParentNotSynced { .. } => "PARENT_UNSYNC",
                _ => "INTERRUPTED",
            },
        }
    }
}

fn remote_kind(err: &RemoteError) -> ErrorKind {
    match err {
        RemoteError::Unauthorized => ErrorKind::Authentication,
        RemoteError::Forbidden(_) => ErrorKind::Authorization,
        RemoteError::NotFound(_) => ErrorKind::Gone,
        RemoteError::Conflict(_) => ErrorKind::Conflict,
        RemoteError::TooManyRequests { .. }
        | RemoteError::ServerError { .. }
        | RemoteError::Network(_)
        | RemoteError::Timeout
        | RemoteError::BatchExpired(_)
        | RemoteError::InvalidResponse(_) => ErrorKind::TransientNetwork,
    }
}

fn domain_kind(err: &DomainError) -> ErrorKind {
    match err {
        DomainError::DuplicateRemote { .. } => ErrorKind::Duplication,
        DomainError::PairNotFound(_) => ErrorKind::Gone,
        _ => ErrorKind::Invariant,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_remote_errors_are_classified() {
        assert_eq!(SyncError::from(RemoteError::Unauthorized).kind(), ErrorKind::Authentication);
        assert_eq!(
            SyncError::from(RemoteError::Forbidden("doc".into())).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(SyncError::from(RemoteError::NotFound("doc".into())).kind(), ErrorKind::Gone);
        assert_eq!(SyncError::from(RemoteError::Timeout).kind(), ErrorKind::TransientNetwork);

        let server = SyncError::from(RemoteError::ServerError {
            status: 502,
            message: "Bad Gateway".into(),
        });
        assert_eq!(server.kind(), ErrorKind::TransientNetwork);
        assert_eq!(server.code(), "SERVER_ERROR");
        assert_eq!(SyncError::from(RemoteError::Network("reset".into())).code(), "CONNECTION_ERROR");
    }

    #[test]
    fn test_local_errors_are_classified() {
        let err = SyncError::from(LocalError::PathTooLong(PathBuf::from("/a")));
        assert_eq!(err.kind(), ErrorKind::LocalFilesystem(LocalFailure::PathTooLong));
        assert_eq!(err.code(), "PATH_TOO_LONG");

        let err = SyncError::from(LocalError::DuplicationDisabled(PathBuf::from("/a")));
        assert_eq!(err.kind(), ErrorKind::Duplication);
        assert_eq!(err.code(), "DEDUP");
    }

    #[test]
    fn test_store_errors_carrying_domain_errors() {
        let err = SyncError::from(anyhow::Error::from(DomainError::PairNotFound(3)));
        assert_eq!(err.kind(), ErrorKind::Gone);

        let err = SyncError::from(anyhow::anyhow!("disk I/O error"));
        assert_eq!(err.kind(), ErrorKind::Invariant);
    }

    #[test]
    fn test_parent_not_synced_is_retried() {
        let err = SyncError::ParentNotSynced {
            name: "joe.txt".into(),
            remote_ref: "doc-1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Interrupted);
        assert_eq!(err.code(), "PARENT_UNSYNC");
    }
}
