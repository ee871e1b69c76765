//! Per-side states and the pair-state derivation function
//!
//! Every `DocPair` records the last observed state of each side
//! (`LocalState`, `RemoteState`). The reconciliation verdict, `PairState`,
//! is never written independently: it is recomputed from the two side
//! states plus a few facts about the row (folderishness, digest equality,
//! parent/name agreement after concurrent moves).
//!
//! ## Derivation overview
//!
//! ```text
//!   (local, remote)          files                     folders
//!   ─────────────────────────────────────────────────────────────────
//!   created / unknown        locally_created           locally_created
//!   unknown / created        remotely_created          remotely_created
//!   modified / synchronized  locally_modified          locally_modified
//!   synchronized / modified  remotely_modified         remotely_modified
//!   modified / modified      synchronized | conflicted remotely_modified
//!   created / created        synchronized | conflicted synchronized
//!   moved / moved            synchronized | remotely_moved | conflicted
//!   any, unsupported digest  unsynchronized            (n/a)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// Side states
// ============================================================================

/// Last observed state of the local side of a pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalState {
    #[default]
    Unknown,
    Created,
    Modified,
    Moved,
    Deleted,
    Synchronized,
    Resolved,
    /// Excluded from synchronization until the user acts
    Unsynchronized,
}

impl LocalState {
    /// Returns the persisted name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalState::Unknown => "unknown",
            LocalState::Created => "created",
            LocalState::Modified => "modified",
            LocalState::Moved => "moved",
            LocalState::Deleted => "deleted",
            LocalState::Synchronized => "synchronized",
            LocalState::Resolved => "resolved",
            LocalState::Unsynchronized => "unsynchronized",
        }
    }
}

impl fmt::Display for LocalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocalState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(LocalState::Unknown),
            "created" => Ok(LocalState::Created),
            "modified" => Ok(LocalState::Modified),
            "moved" => Ok(LocalState::Moved),
            "deleted" => Ok(LocalState::Deleted),
            "synchronized" => Ok(LocalState::Synchronized),
            "resolved" => Ok(LocalState::Resolved),
            "unsynchronized" => Ok(LocalState::Unsynchronized),
            other => Err(DomainError::UnknownState {
                kind: "local",
                value: other.to_string(),
            }),
        }
    }
}

/// Last observed state of the remote side of a pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    #[default]
    Unknown,
    Created,
    Modified,
    Moved,
    Deleted,
    Synchronized,
    Resolved,
}

impl RemoteState {
    /// Returns the persisted name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteState::Unknown => "unknown",
            RemoteState::Created => "created",
            RemoteState::Modified => "modified",
            RemoteState::Moved => "moved",
            RemoteState::Deleted => "deleted",
            RemoteState::Synchronized => "synchronized",
            RemoteState::Resolved => "resolved",
        }
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(RemoteState::Unknown),
            "created" => Ok(RemoteState::Created),
            "modified" => Ok(RemoteState::Modified),
            "moved" => Ok(RemoteState::Moved),
            "deleted" => Ok(RemoteState::Deleted),
            "synchronized" => Ok(RemoteState::Synchronized),
            "resolved" => Ok(RemoteState::Resolved),
            other => Err(DomainError::UnknownState {
                kind: "remote",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// PairState
// ============================================================================

/// Derived reconciliation verdict driving the processors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    #[default]
    Unknown,
    Synchronized,
    LocallyCreated,
    RemotelyCreated,
    LocallyModified,
    RemotelyModified,
    LocallyMoved,
    RemotelyMoved,
    /// Local move applied remotely, then remote content downloaded
    LocallyMovedRemotelyModified,
    /// Remote move applied locally, then local content uploaded
    RemotelyMovedLocallyModified,
    LocallyDeleted,
    RemotelyDeleted,
    Deleted,
    UnknownDeleted,
    DeletedUnknown,
    LocallyResolved,
    RemotelyResolved,
    Conflicted,
    Unsynchronized,
}

/// Which side of the pair a state asks the processors to propagate from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    Remote,
}

impl PairState {
    /// All pair states, in declaration order
    pub const ALL: [PairState; 19] = [
        PairState::Unknown,
        PairState::Synchronized,
        PairState::LocallyCreated,
        PairState::RemotelyCreated,
        PairState::LocallyModified,
        PairState::RemotelyModified,
        PairState::LocallyMoved,
        PairState::RemotelyMoved,
        PairState::LocallyMovedRemotelyModified,
        PairState::RemotelyMovedLocallyModified,
        PairState::LocallyDeleted,
        PairState::RemotelyDeleted,
        PairState::Deleted,
        PairState::UnknownDeleted,
        PairState::DeletedUnknown,
        PairState::LocallyResolved,
        PairState::RemotelyResolved,
        PairState::Conflicted,
        PairState::Unsynchronized,
    ];

    /// Returns the persisted name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            PairState::Unknown => "unknown",
            PairState::Synchronized => "synchronized",
            PairState::LocallyCreated => "locally_created",
            PairState::RemotelyCreated => "remotely_created",
            PairState::LocallyModified => "locally_modified",
            PairState::RemotelyModified => "remotely_modified",
            PairState::LocallyMoved => "locally_moved",
            PairState::RemotelyMoved => "remotely_moved",
            PairState::LocallyMovedRemotelyModified => "locally_moved_remotely_modified",
            PairState::RemotelyMovedLocallyModified => "remotely_moved_locally_modified",
            PairState::LocallyDeleted => "locally_deleted",
            PairState::RemotelyDeleted => "remotely_deleted",
            PairState::Deleted => "deleted",
            PairState::UnknownDeleted => "unknown_deleted",
            PairState::DeletedUnknown => "deleted_unknown",
            PairState::LocallyResolved => "locally_resolved",
            PairState::RemotelyResolved => "remotely_resolved",
            PairState::Conflicted => "conflicted",
            PairState::Unsynchronized => "unsynchronized",
        }
    }

    /// Side whose observation drives the processing, if the state is queued
    ///
    /// States returning `None` are terminal or waiting on the user and are
    /// never admitted to the queue.
    pub fn origin(&self) -> Option<Side> {
        match self {
            PairState::LocallyCreated
            | PairState::LocallyModified
            | PairState::LocallyMoved
            | PairState::LocallyMovedRemotelyModified
            | PairState::LocallyDeleted
            | PairState::LocallyResolved
            | PairState::Deleted
            | PairState::DeletedUnknown => Some(Side::Local),
            PairState::RemotelyCreated
            | PairState::RemotelyModified
            | PairState::RemotelyMoved
            | PairState::RemotelyMovedLocallyModified
            | PairState::RemotelyDeleted
            | PairState::RemotelyResolved
            | PairState::UnknownDeleted => Some(Side::Remote),
            PairState::Unknown
            | PairState::Synchronized
            | PairState::Conflicted
            | PairState::Unsynchronized => None,
        }
    }

    /// Returns true if processors have work to do for this state
    pub fn is_processable(&self) -> bool {
        self.origin().is_some()
    }

    /// Returns true for deletions, which get a priority bump in the queue
    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            PairState::LocallyDeleted
                | PairState::RemotelyDeleted
                | PairState::Deleted
                | PairState::UnknownDeleted
                | PairState::DeletedUnknown
        )
    }

    /// Returns true for user conflict resolutions, which get a priority bump
    pub fn is_resolution(&self) -> bool {
        matches!(self, PairState::LocallyResolved | PairState::RemotelyResolved)
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PairState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PairState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| DomainError::UnknownState {
                kind: "pair",
                value: s.to_string(),
            })
    }
}

// ============================================================================
// Derivation
// ============================================================================

/// Outcome of comparing the local and remote digests of a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DigestComparison {
    /// One side has no digest yet, the item is a folder, or the server
    /// announced an asynchronous digest that cannot be compared
    #[default]
    Unknown,
    Equal,
    Differ,
    /// The server announced a digest algorithm the client cannot compute
    Unsupported,
}

/// Everything the derivation function looks at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DerivationInput {
    pub local_state: LocalState,
    pub remote_state: RemoteState,
    pub folderish: bool,
    pub digests: DigestComparison,
    /// After a move on both sides: do both now live under the same parent?
    pub same_parent: bool,
    /// After a move on both sides: do both carry the same name?
    pub same_name: bool,
}

/// Computes the reconciliation verdict of a pair
///
/// This is a pure function: a row's `pair_state` column must always equal
/// `derive_pair_state` applied to the row's other fields.
pub fn derive_pair_state(input: &DerivationInput) -> PairState {
    use LocalState as L;
    use RemoteState as R;

    let file = !input.folderish;
    if file && input.digests == DigestComparison::Unsupported {
        return PairState::Unsynchronized;
    }
    let equal = file && input.digests == DigestComparison::Equal;

    match (input.local_state, input.remote_state) {
        (L::Unsynchronized, R::Deleted) => PairState::RemotelyDeleted,
        (L::Unsynchronized, _) => PairState::Unsynchronized,

        (L::Unknown, R::Unknown) => PairState::Unknown,
        (L::Synchronized, R::Synchronized) => PairState::Synchronized,
        (L::Created | L::Unknown | L::Resolved, R::Synchronized) => PairState::Synchronized,
        (L::Synchronized, R::Unknown) => PairState::Synchronized,

        (L::Created, R::Unknown | R::Deleted) => PairState::LocallyCreated,
        (L::Unknown | L::Deleted, R::Created) => PairState::RemotelyCreated,
        (L::Unknown, R::Moved) => PairState::RemotelyCreated,
        (L::Deleted, R::Modified) => PairState::RemotelyCreated,

        (L::Modified, R::Synchronized) if equal => PairState::Synchronized,
        (L::Modified, R::Synchronized | R::Unknown) => PairState::LocallyModified,
        (L::Synchronized | L::Unknown, R::Modified) => PairState::RemotelyModified,

        (L::Modified, R::Modified) if input.folderish => PairState::RemotelyModified,
        (L::Created, R::Created) if input.folderish => PairState::Synchronized,
        (L::Modified | L::Created, R::Modified | R::Created) if equal => PairState::Synchronized,
        (L::Modified | L::Created, R::Modified | R::Created) => PairState::Conflicted,

        (L::Deleted, R::Synchronized) => PairState::LocallyDeleted,
        (L::Synchronized, R::Deleted) => PairState::RemotelyDeleted,
        (L::Modified, R::Deleted) => PairState::RemotelyDeleted,
        (L::Deleted, R::Deleted) => PairState::Deleted,
        (L::Unknown, R::Deleted) => PairState::UnknownDeleted,
        (L::Deleted, R::Unknown) => PairState::DeletedUnknown,

        (L::Moved, R::Synchronized) => PairState::LocallyMoved,
        (L::Synchronized, R::Moved) => PairState::RemotelyMoved,
        (L::Moved, R::Moved) => match (input.same_parent, input.same_name) {
            (true, true) => PairState::Synchronized,
            (true, false) => PairState::RemotelyMoved,
            (false, _) => PairState::Conflicted,
        },
        (L::Moved, R::Deleted) => PairState::LocallyCreated,
        (L::Moved, R::Unknown | R::Created) => PairState::Conflicted,
        // A remote rename keeps the digest: two competing metadata changes
        (L::Moved, R::Modified) if equal || input.folderish => PairState::Conflicted,
        (L::Moved, R::Modified) => PairState::LocallyMovedRemotelyModified,
        (L::Modified, R::Moved) => PairState::RemotelyMovedLocallyModified,

        (L::Resolved, R::Unknown) => PairState::LocallyResolved,
        (L::Synchronized, R::Resolved) => PairState::RemotelyResolved,
        (L::Resolved, R::Modified) => PairState::Conflicted,

        _ => PairState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(local: LocalState, remote: RemoteState) -> DerivationInput {
        DerivationInput {
            local_state: local,
            remote_state: remote,
            ..Default::default()
        }
    }

    fn file(local: LocalState, remote: RemoteState, digests: DigestComparison) -> PairState {
        derive_pair_state(&DerivationInput {
            digests,
            ..input(local, remote)
        })
    }

    fn folder(local: LocalState, remote: RemoteState) -> PairState {
        derive_pair_state(&DerivationInput {
            folderish: true,
            ..input(local, remote)
        })
    }

    mod table_tests {
        use super::*;
        use DigestComparison::*;
        use LocalState as L;
        use RemoteState as R;

        #[test]
        fn test_creations() {
            assert_eq!(file(L::Created, R::Unknown, Unknown), PairState::LocallyCreated);
            assert_eq!(folder(L::Created, R::Unknown), PairState::LocallyCreated);
            assert_eq!(file(L::Unknown, R::Created, Unknown), PairState::RemotelyCreated);
            assert_eq!(folder(L::Unknown, R::Created), PairState::RemotelyCreated);
        }

        #[test]
        fn test_modifications() {
            assert_eq!(
                file(L::Modified, R::Synchronized, Differ),
                PairState::LocallyModified
            );
            assert_eq!(
                file(L::Modified, R::Synchronized, Unknown),
                PairState::LocallyModified
            );
            assert_eq!(
                file(L::Modified, R::Synchronized, Equal),
                PairState::Synchronized
            );
            assert_eq!(
                file(L::Synchronized, R::Modified, Differ),
                PairState::RemotelyModified
            );
        }

        #[test]
        fn test_concurrent_modifications() {
            assert_eq!(file(L::Modified, R::Modified, Equal), PairState::Synchronized);
            assert_eq!(file(L::Modified, R::Modified, Differ), PairState::Conflicted);
            assert_eq!(file(L::Modified, R::Modified, Unknown), PairState::Conflicted);
            assert_eq!(folder(L::Modified, R::Modified), PairState::RemotelyModified);
        }

        #[test]
        fn test_concurrent_creations() {
            assert_eq!(file(L::Created, R::Created, Equal), PairState::Synchronized);
            assert_eq!(file(L::Created, R::Created, Differ), PairState::Conflicted);
            assert_eq!(folder(L::Created, R::Created), PairState::Synchronized);
        }

        #[test]
        fn test_deletions() {
            assert_eq!(folder(L::Deleted, R::Synchronized), PairState::LocallyDeleted);
            assert_eq!(folder(L::Synchronized, R::Deleted), PairState::RemotelyDeleted);
            assert_eq!(folder(L::Deleted, R::Deleted), PairState::Deleted);
            assert_eq!(folder(L::Unknown, R::Deleted), PairState::UnknownDeleted);
            assert_eq!(folder(L::Deleted, R::Unknown), PairState::DeletedUnknown);
            assert_eq!(file(L::Created, R::Deleted, Unknown), PairState::LocallyCreated);
            assert_eq!(file(L::Deleted, R::Created, Unknown), PairState::RemotelyCreated);
        }

        #[test]
        fn test_moves() {
            assert_eq!(folder(L::Moved, R::Synchronized), PairState::LocallyMoved);
            assert_eq!(folder(L::Synchronized, R::Moved), PairState::RemotelyMoved);
            assert_eq!(folder(L::Moved, R::Deleted), PairState::LocallyCreated);
        }

        #[test]
        fn test_moved_on_both_sides() {
            let base = DerivationInput {
                local_state: L::Moved,
                remote_state: R::Moved,
                ..Default::default()
            };
            let same = DerivationInput {
                same_parent: true,
                same_name: true,
                ..base
            };
            let renamed = DerivationInput {
                same_parent: true,
                same_name: false,
                ..base
            };
            assert_eq!(derive_pair_state(&same), PairState::Synchronized);
            assert_eq!(derive_pair_state(&renamed), PairState::RemotelyMoved);
            assert_eq!(derive_pair_state(&base), PairState::Conflicted);
        }

        #[test]
        fn test_move_then_edit() {
            assert_eq!(
                file(L::Moved, R::Modified, Differ),
                PairState::LocallyMovedRemotelyModified
            );
            assert_eq!(file(L::Moved, R::Modified, Equal), PairState::Conflicted);
            assert_eq!(
                file(L::Modified, R::Moved, Unknown),
                PairState::RemotelyMovedLocallyModified
            );
        }

        #[test]
        fn test_resolutions() {
            assert_eq!(file(L::Resolved, R::Unknown, Differ), PairState::LocallyResolved);
            assert_eq!(
                file(L::Synchronized, R::Resolved, Differ),
                PairState::RemotelyResolved
            );
            assert_eq!(file(L::Resolved, R::Synchronized, Unknown), PairState::Synchronized);
        }

        #[test]
        fn test_unsupported_digest_unsynchronizes_files_only() {
            assert_eq!(
                file(L::Unknown, R::Created, Unsupported),
                PairState::Unsynchronized
            );
            let folder_input = DerivationInput {
                folderish: true,
                digests: Unsupported,
                ..input(L::Unknown, R::Created)
            };
            assert_eq!(derive_pair_state(&folder_input), PairState::RemotelyCreated);
        }

        #[test]
        fn test_unsynchronized_local_state() {
            assert_eq!(
                folder(L::Unsynchronized, R::Modified),
                PairState::Unsynchronized
            );
            assert_eq!(
                folder(L::Unsynchronized, R::Deleted),
                PairState::RemotelyDeleted
            );
        }
    }

    #[test]
    fn test_pair_state_round_trips_through_names() {
        for state in PairState::ALL {
            assert_eq!(state.as_str().parse::<PairState>().unwrap(), state);
        }
        assert!("floating".parse::<PairState>().is_err());
    }

    #[test]
    fn test_side_states_parse() {
        assert_eq!("moved".parse::<LocalState>().unwrap(), LocalState::Moved);
        assert_eq!(
            "resolved".parse::<RemoteState>().unwrap(),
            RemoteState::Resolved
        );
        assert!("unsynchronized".parse::<RemoteState>().is_err());
    }

    #[test]
    fn test_origin_partitions() {
        assert_eq!(PairState::LocallyCreated.origin(), Some(Side::Local));
        assert_eq!(PairState::RemotelyDeleted.origin(), Some(Side::Remote));
        assert_eq!(PairState::Conflicted.origin(), None);
        assert!(!PairState::Synchronized.is_processable());
        assert!(!PairState::Unsynchronized.is_processable());
        assert!(PairState::UnknownDeleted.is_deletion());
        assert!(PairState::LocallyResolved.is_resolution());
    }
}
