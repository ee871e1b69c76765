//! Domain error types
//!
//! Errors raised by pure domain operations: parsing persisted enum values,
//! rejecting rows that break store invariants, and stale optimistic updates.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A persisted state string does not name a known state
    #[error("Unknown {kind} state: {value}")]
    UnknownState {
        /// Which alphabet was being parsed (`local`, `remote`, `pair`, ...)
        kind: &'static str,
        /// The offending value
        value: String,
    },

    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A row would have neither a local path nor a remote reference
    #[error("Ghost pair: neither local path nor remote reference is set")]
    GhostPair,

    /// Unique `(remote_ref, remote_parent_ref)` constraint violated
    #[error("Duplicate remote pair: {remote_ref} under {remote_parent_ref}")]
    DuplicateRemote {
        /// Remote document reference
        remote_ref: String,
        /// Remote parent reference
        remote_parent_ref: String,
    },

    /// Update rejected because the row changed since it was read
    #[error("Stale update for pair {id}: expected version {expected}, found {found}")]
    StaleVersion {
        /// Pair identifier
        id: i64,
        /// Version the caller read
        expected: i64,
        /// Version currently stored
        found: i64,
    },

    /// A pair referenced by id does not exist
    #[error("Pair not found: {0}")]
    PairNotFound(i64),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
