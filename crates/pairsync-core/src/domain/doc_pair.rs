//! DocPair domain entity
//!
//! One row per tracked document, associating a local path with a remote
//! reference. The store exclusively owns rows; every other component
//! works on short-lived snapshots and writes through the store API.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::digest::DigestKind;
use super::errors::DomainError;
use super::states::{derive_pair_state, DerivationInput, DigestComparison, LocalState, PairState, RemoteState};

/// Identifier of a `DocPair` row (monotonic integer primary key)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairId(pub i64);

impl PairId {
    /// Returns the raw database id
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PairId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Reconciliation record for one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocPair {
    pub id: PairId,

    pub local_path: PathBuf,
    pub local_parent_path: PathBuf,
    pub local_name: String,

    pub remote_ref: Option<String>,
    pub remote_parent_ref: Option<String>,
    pub remote_name: Option<String>,
    pub remote_parent_path: Option<String>,

    pub folderish: bool,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,
    pub digest_algorithm: Option<String>,
    pub size: u64,

    pub last_local_updated: Option<DateTime<Utc>>,
    pub last_remote_updated: Option<DateTime<Utc>>,
    pub last_sync_date: Option<DateTime<Utc>>,

    pub error_count: u32,
    pub version: i64,

    pub local_state: LocalState,
    pub remote_state: RemoteState,
    pub pair_state: PairState,

    pub last_error: Option<String>,
    pub last_error_details: Option<String>,
    /// Epoch seconds before which the pair must not be retried
    pub error_next_try: i64,

    /// Owning worker id, 0 when free
    pub processor: u64,

    pub remote_can_rename: bool,
    pub remote_can_delete: bool,
    pub remote_can_update: bool,
    pub remote_can_create_child: bool,
    pub remote_lock_owner: Option<String>,
}

impl DocPair {
    /// Checks the "no pure ghost" invariant
    ///
    /// # Errors
    ///
    /// Returns `DomainError::GhostPair` when the row has neither a local path
    /// nor a remote reference.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.local_path.as_os_str().is_empty() && self.remote_ref.is_none() {
            return Err(DomainError::GhostPair);
        }
        Ok(())
    }

    /// Classification of the remote digest, if any
    pub fn digest_kind(&self) -> Option<DigestKind> {
        self.remote_digest
            .as_deref()
            .map(|digest| DigestKind::classify(digest, self.digest_algorithm.as_deref()))
    }

    /// Compares the recorded local and remote digests
    pub fn digest_comparison(&self) -> DigestComparison {
        if self.folderish {
            return DigestComparison::Unknown;
        }
        match self.digest_kind() {
            Some(DigestKind::Unsupported(_)) => DigestComparison::Unsupported,
            Some(DigestKind::Exotic) | None => DigestComparison::Unknown,
            Some(DigestKind::Supported(_)) => match (&self.local_digest, &self.remote_digest) {
                (Some(local), Some(remote)) if local.eq_ignore_ascii_case(remote) => {
                    DigestComparison::Equal
                }
                (Some(_), Some(_)) => DigestComparison::Differ,
                _ => DigestComparison::Unknown,
            },
        }
    }

    /// Name on the remote side, falling back to the local name
    pub fn display_name(&self) -> &str {
        self.remote_name.as_deref().unwrap_or(&self.local_name)
    }

    /// Remote reference path of the pair, `{remote_parent_path}/{remote_ref}`
    ///
    /// This is the value children carry as `remote_parent_path` and the
    /// value filters are matched against.
    pub fn remote_path(&self) -> Option<String> {
        let remote_ref = self.remote_ref.as_deref()?;
        let parent = self.remote_parent_path.as_deref().unwrap_or("");
        Some(format!("{}/{}", parent.trim_end_matches('/'), remote_ref))
    }

    /// Builds the derivation input for this row
    ///
    /// `same_parent` is only meaningful after moves on both sides and must
    /// be resolved by the caller (it needs a lookup of the parent pair).
    pub fn derivation_input(&self, same_parent: bool) -> DerivationInput {
        DerivationInput {
            local_state: self.local_state,
            remote_state: self.remote_state,
            folderish: self.folderish,
            digests: self.digest_comparison(),
            same_parent,
            same_name: self.remote_name.as_deref() == Some(self.local_name.as_str()),
        }
    }

    /// Recomputes `pair_state` from the other fields
    pub fn refresh_pair_state(&mut self, same_parent: bool) -> PairState {
        self.pair_state = derive_pair_state(&self.derivation_input(same_parent));
        self.pair_state
    }

    /// Returns true if the pair failed at least once and is parked
    pub fn is_parked(&self, now: i64) -> bool {
        self.error_count > 0 && self.error_next_try > now
    }

    /// Returns true if the remote document may not be modified by us
    pub fn is_remote_readonly(&self) -> bool {
        !self.remote_can_update
    }

    /// Returns true if this row is the sync root pair
    pub fn is_root(&self) -> bool {
        self.local_parent_path.as_os_str().is_empty() && self.local_path == PathBuf::from("/")
    }
}

impl fmt::Display for DocPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DocPair<{}, local={:?}, remote={:?}, {}|{} => {}>",
            self.id,
            self.local_path,
            self.remote_ref,
            self.local_state,
            self.remote_state,
            self.pair_state
        )
    }
}
