//! Server JSON payloads
//!
//! The repository describes documents as "file-system items" whose field
//! names and encodings differ from the domain's [`RemoteInfo`]. The
//! structs here mirror the server JSON and convert into domain types.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use unicode_normalization::UnicodeNormalization;

use pairsync_core::domain::RemoteInfo;
use pairsync_core::ports::{ChangeKind, ChangeSummary, RemoteChange, ScrollBatch};

// ============================================================================
// File-system items
// ============================================================================

/// Lock details attached to a locked item
#[derive(Debug, Clone, Deserialize)]
pub struct LockInfo {
    pub owner: Option<String>,
    /// Lock creation date in epoch milliseconds
    pub created: Option<i64>,
}

/// A file-system item as returned by `NuxeoDrive.*` operations
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsItem {
    pub id: String,
    pub parent_id: Option<String>,
    pub path: String,
    pub name: String,
    pub folder: bool,
    /// Epoch milliseconds
    pub last_modification_date: Option<i64>,
    /// Epoch milliseconds
    pub creation_date: Option<i64>,
    pub last_contributor: Option<String>,
    pub digest: Option<String>,
    pub digest_algorithm: Option<String>,
    #[serde(rename = "downloadURL")]
    pub download_url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub can_rename: bool,
    #[serde(default)]
    pub can_update: bool,
    #[serde(default)]
    pub can_delete: bool,
    #[serde(default)]
    pub can_create_child: bool,
    pub lock_info: Option<LockInfo>,
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Canonical digest algorithm name: lowercase, without `-` (`SHA-256` → `sha256`)
pub fn normalize_algorithm(algorithm: &str) -> Option<String> {
    let normalized = algorithm.trim().to_lowercase().replace('-', "");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

impl From<FsItem> for RemoteInfo {
    fn from(item: FsItem) -> Self {
        // Folders carry neither content nor update rights; files cannot
        // have children.
        let (digest, digest_algorithm, download_url, can_update, can_create_child) = if item.folder
        {
            (None, None, None, false, item.can_create_child)
        } else {
            (
                item.digest,
                item.digest_algorithm.as_deref().and_then(normalize_algorithm),
                item.download_url,
                item.can_update,
                false,
            )
        };

        RemoteInfo {
            uid: item.id,
            parent_uid: item.parent_id,
            path: item.path,
            name: item.name.nfc().collect(),
            folderish: item.folder,
            size: item.size.unwrap_or(0),
            digest,
            digest_algorithm,
            last_modification_time: from_millis(item.last_modification_date),
            creation_time: from_millis(item.creation_date),
            last_contributor: item.last_contributor,
            download_url,
            can_rename: item.can_rename,
            can_update,
            can_delete: item.can_delete,
            can_create_child,
            lock_owner: item.lock_info.and_then(|lock| lock.owner),
        }
    }
}

/// `NuxeoDrive.GetChildren` answers either a bare array or a page
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ChildrenPage {
    All(Vec<FsItem>),
    Paged {
        entries: Vec<FsItem>,
        #[serde(rename = "isNextPageAvailable", default)]
        is_next_page_available: bool,
    },
}

/// Answer of `NuxeoDrive.ScrollDescendants`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireScroll {
    pub scroll_id: Option<String>,
    #[serde(default)]
    pub file_system_items: Vec<FsItem>,
}

impl From<WireScroll> for ScrollBatch {
    fn from(scroll: WireScroll) -> Self {
        ScrollBatch {
            scroll_id: scroll.scroll_id,
            file_system_items: scroll.file_system_items.into_iter().map(Into::into).collect(),
        }
    }
}

// ============================================================================
// Change summary
// ============================================================================

/// One change-log entry
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChange {
    pub event_id: ChangeKind,
    #[serde(default)]
    pub event_date: i64,
    pub file_system_item_id: String,
    pub file_system_item_name: Option<String>,
    pub file_system_item: Option<FsItem>,
}

/// Answer of `NuxeoDrive.GetChangeSummary`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChangeSummary {
    #[serde(default)]
    pub upper_bound: i64,
    /// Comma-separated `repository:ref` list
    #[serde(default)]
    pub active_synchronization_root_definitions: String,
    #[serde(default)]
    pub sync_date: i64,
    #[serde(default)]
    pub has_too_many_changes: bool,
    #[serde(default)]
    pub file_system_changes: Vec<WireChange>,
}

/// Extracts the references of a `repository:ref,repository:ref` list
pub fn parse_root_definitions(definitions: &str) -> Vec<String> {
    definitions
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| match d.split_once(':') {
            Some((_, reference)) => reference.to_string(),
            None => d.to_string(),
        })
        .collect()
}

/// Builds the `repository:ref` list sent back to the server
pub fn format_root_definitions(repository: &str, refs: &[String]) -> String {
    refs.iter()
        .map(|r| format!("{}:{}", repository, r))
        .collect::<Vec<_>>()
        .join(",")
}

impl From<WireChangeSummary> for ChangeSummary {
    fn from(summary: WireChangeSummary) -> Self {
        ChangeSummary {
            upper_bound: summary.upper_bound,
            active_roots: parse_root_definitions(&summary.active_synchronization_root_definitions),
            sync_date: summary.sync_date,
            has_too_many_changes: summary.has_too_many_changes,
            file_system_changes: summary
                .file_system_changes
                .into_iter()
                .map(|change| RemoteChange {
                    event_id: change.event_id,
                    event_date: change.event_date,
                    file_system_item_id: change.file_system_item_id,
                    file_system_item_name: change.file_system_item_name,
                    file_system_item: change.file_system_item.map(Into::into),
                })
                .collect(),
        }
    }
}

// ============================================================================
// Documents, login, batches
// ============================================================================

/// A plain document, as returned by `NuxeoDrive.GetRoots`
#[derive(Debug, Deserialize)]
pub struct WireDocument {
    pub uid: String,
    pub path: String,
    pub title: Option<String>,
    #[serde(rename = "lastModified")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// `{"entity-type": "documents", "entries": [...]}`
#[derive(Debug, Deserialize)]
pub struct WireDocuments {
    #[serde(default)]
    pub entries: Vec<WireDocument>,
}

impl From<WireDocument> for RemoteInfo {
    fn from(doc: WireDocument) -> Self {
        let name = doc
            .title
            .clone()
            .unwrap_or_else(|| doc.path.rsplit('/').next().unwrap_or_default().to_string());
        RemoteInfo {
            uid: doc.uid,
            parent_uid: None,
            path: doc.path,
            name: name.nfc().collect(),
            folderish: true,
            size: 0,
            digest: None,
            digest_algorithm: None,
            last_modification_time: doc.last_modified,
            creation_time: None,
            last_contributor: None,
            download_url: None,
            can_rename: false,
            can_update: false,
            can_delete: false,
            can_create_child: true,
            lock_owner: None,
        }
    }
}

/// Answer of the `login` operation
#[derive(Debug, Deserialize)]
pub struct WireLogin {
    pub username: String,
}

/// Answer of `GET /api/v1/drive/configuration`
#[derive(Debug, Default, Deserialize)]
pub struct WireServerOptions {
    #[serde(default)]
    pub feature: HashMap<String, bool>,
}

/// Answer of `POST /api/v1/upload/`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBatch {
    pub batch_id: String,
}

/// Answer of `GET /api/v1/upload/{batch}/0`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBatchFile {
    #[serde(default)]
    pub uploaded_chunk_ids: Vec<u32>,
    pub chunk_count: Option<u32>,
}
