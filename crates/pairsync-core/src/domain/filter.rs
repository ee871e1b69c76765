//! Remote path filters
//!
//! A filter names a remote reference path (`/root/folder`) whose subtree is
//! never mirrored locally. Paths are compared on `/` boundaries so that
//! `/root/folder` does not filter `/root/folder2`.

use serde::{Deserialize, Serialize};

/// An authoritative exclusion of a remote subtree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub path: String,
}

impl Filter {
    /// Creates a filter, normalizing away a trailing slash
    pub fn new(path: impl Into<String>) -> Self {
        let mut path = path.into();
        while path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        Self { path }
    }

    /// Returns true if `remote_path` is the filtered path or below it
    pub fn covers(&self, remote_path: &str) -> bool {
        remote_path == self.path
            || remote_path
                .strip_prefix(self.path.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Returns true if any filter covers `remote_path`
pub fn is_filtered(filters: &[Filter], remote_path: &str) -> bool {
    filters.iter().any(|f| f.covers(remote_path))
}
