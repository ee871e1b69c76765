//! Observations of one side of a pair
//!
//! `LocalInfo` is produced by the Path Client from a filesystem entry,
//! `RemoteInfo` by the Remote Client from a server document. Both are
//! immutable snapshots merged into `DocPair` rows by the store.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a local filesystem entry
///
/// `path` is relative to the sync root, `/`-rooted (the root itself is `/`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInfo {
    pub root: PathBuf,
    pub path: PathBuf,
    pub folderish: bool,
    pub size: u64,
    pub last_modification_time: DateTime<Utc>,
    pub creation_time: Option<DateTime<Utc>>,
    /// Value of the `remote-ref` extended attribute, if present
    pub remote_ref: Option<String>,
}

impl LocalInfo {
    /// File or folder name; empty for the sync root
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Relative path of the parent folder; empty for the sync root
    pub fn parent_path(&self) -> PathBuf {
        self.path.parent().map(Path::to_path_buf).unwrap_or_default()
    }

    /// Absolute path on disk
    pub fn filepath(&self) -> PathBuf {
        abspath(&self.root, &self.path)
    }
}

/// Joins a `/`-rooted relative pair path onto the sync root
pub fn abspath(root: &Path, rel: &Path) -> PathBuf {
    let stripped = rel.strip_prefix("/").unwrap_or(rel);
    if stripped.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(stripped)
    }
}

/// Snapshot of a remote document as seen through the file-system item API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInfo {
    /// Document reference (file-system item id)
    pub uid: String,
    pub parent_uid: Option<String>,
    /// Reference path from the top-level container, e.g. `/root/folder/doc`
    pub path: String,
    pub name: String,
    pub folderish: bool,
    #[serde(default)]
    pub size: u64,
    pub digest: Option<String>,
    pub digest_algorithm: Option<String>,
    pub last_modification_time: Option<DateTime<Utc>>,
    pub creation_time: Option<DateTime<Utc>>,
    pub last_contributor: Option<String>,
    pub download_url: Option<String>,
    #[serde(default = "default_true")]
    pub can_rename: bool,
    #[serde(default = "default_true")]
    pub can_update: bool,
    #[serde(default = "default_true")]
    pub can_delete: bool,
    #[serde(default = "default_true")]
    pub can_create_child: bool,
    pub lock_owner: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RemoteInfo {
    /// Reference path of the parent, derived from `path`
    pub fn parent_path(&self) -> String {
        match self.path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => self.path[..idx].to_string(),
        }
    }

    /// Returns true if the document is locked by somebody
    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_info_names() {
        let info = LocalInfo {
            root: PathBuf::from("/sync"),
            path: PathBuf::from("/Test folder/joe.txt"),
            folderish: false,
            size: 12,
            last_modification_time: Utc::now(),
            creation_time: None,
            remote_ref: None,
        };
        assert_eq!(info.name(), "joe.txt");
        assert_eq!(info.parent_path(), PathBuf::from("/Test folder"));
        assert_eq!(info.filepath(), PathBuf::from("/sync/Test folder/joe.txt"));
    }

    #[test]
    fn test_abspath_of_root() {
        assert_eq!(abspath(Path::new("/sync"), Path::new("/")), PathBuf::from("/sync"));
    }

    #[test]
    fn test_remote_parent_path() {
        let json = serde_json::json!({
            "uid": "doc",
            "parentUid": "folder",
            "path": "/root/folder/doc",
            "name": "joe.txt",
            "folderish": false,
            "digest": null,
            "digestAlgorithm": null,
            "lastModificationTime": null,
            "creationTime": null,
            "lastContributor": null,
            "downloadUrl": null,
            "lockOwner": null
        });
        let info: RemoteInfo = serde_json::from_value(json).unwrap();
        assert_eq!(info.parent_path(), "/root/folder");
        assert!(info.can_update);
        assert!(!info.is_locked());
    }
}
