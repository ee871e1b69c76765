//! Row mapping between SQLite and domain types
//!
//! | Domain Type        | SQL Type | Strategy                                   |
//! |--------------------|----------|--------------------------------------------|
//! | PairId             | INTEGER  | raw `i64`                                  |
//! | PathBuf            | TEXT     | `/`-separated string, empty when absent    |
//! | LocalState etc.    | TEXT     | `as_str()` / `FromStr`                     |
//! | DateTime<Utc>      | TEXT     | RFC 3339                                   |
//! | Uuid               | TEXT     | hyphenated string                          |
//! | Vec<u32> (chunks)  | TEXT     | serde_json array                           |

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use pairsync_core::domain::{
    DocPair, LocalState, PairId, PairState, RemoteState, Session, Transfer, TransferDirection,
    TransferStatus,
};

use crate::StoreError;

pub(crate) fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn opt_datetime_to_string(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(datetime_to_string)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::SerializationError(format!("Invalid date '{}': {}", s, e)))
}

fn parse_opt_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn parse_enum<T>(s: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    s.parse::<T>()
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::SerializationError(format!("Invalid UUID: {}", e)))
}

/// Maps a `States` row onto a `DocPair`
pub(crate) fn row_to_pair(row: &SqliteRow) -> Result<DocPair, StoreError> {
    let local_state: String = row.get("local_state");
    let remote_state: String = row.get("remote_state");
    let pair_state: String = row.get("pair_state");
    let local_path: String = row.get("local_path");
    let local_parent_path: String = row.get("local_parent_path");
    let size: i64 = row.get("size");
    let error_count: i64 = row.get("error_count");
    let processor: i64 = row.get("processor");

    Ok(DocPair {
        id: PairId(row.get("id")),
        local_path: PathBuf::from(local_path),
        local_parent_path: PathBuf::from(local_parent_path),
        local_name: row.get("local_name"),
        remote_ref: row.get("remote_ref"),
        remote_parent_ref: row.get("remote_parent_ref"),
        remote_name: row.get("remote_name"),
        remote_parent_path: row.get("remote_parent_path"),
        folderish: row.get("folderish"),
        local_digest: row.get("local_digest"),
        remote_digest: row.get("remote_digest"),
        digest_algorithm: row.get("digest_algorithm"),
        size: size.max(0) as u64,
        last_local_updated: parse_opt_datetime(row.get("last_local_updated"))?,
        last_remote_updated: parse_opt_datetime(row.get("last_remote_updated"))?,
        last_sync_date: parse_opt_datetime(row.get("last_sync_date"))?,
        error_count: error_count.max(0) as u32,
        version: row.get("version"),
        local_state: parse_enum::<LocalState>(&local_state)?,
        remote_state: parse_enum::<RemoteState>(&remote_state)?,
        pair_state: parse_enum::<PairState>(&pair_state)?,
        last_error: row.get("last_error"),
        last_error_details: row.get("last_error_details"),
        error_next_try: row.get("error_next_try"),
        processor: processor.max(0) as u64,
        remote_can_rename: row.get("remote_can_rename"),
        remote_can_delete: row.get("remote_can_delete"),
        remote_can_update: row.get("remote_can_update"),
        remote_can_create_child: row.get("remote_can_create_child"),
        remote_lock_owner: row.get("remote_lock_owner"),
    })
}

/// Maps a `Transfers` row onto a `Transfer`
pub(crate) fn row_to_transfer(row: &SqliteRow) -> Result<Transfer, StoreError> {
    let uid: String = row.get("uid");
    let direction: String = row.get("direction");
    let status: String = row.get("status");
    let chunks: String = row.get("uploaded_chunks");
    let tmp_path: Option<String> = row.get("tmp_path");
    let session_uid: Option<String> = row.get("session_uid");
    let started_at: String = row.get("started_at");
    let filesize: i64 = row.get("filesize");
    let progress: i64 = row.get("progress");
    let chunk_size: i64 = row.get("chunk_size");

    Ok(Transfer {
        uid: parse_uuid(&uid)?,
        pair_id: PairId(row.get("pair_id")),
        direction: parse_enum::<TransferDirection>(&direction)?,
        status: parse_enum::<TransferStatus>(&status)?,
        filesize: filesize.max(0) as u64,
        progress: progress.max(0) as u64,
        tmp_path: tmp_path.map(PathBuf::from),
        batch_id: row.get("batch_id"),
        chunk_size: chunk_size.max(0) as u64,
        uploaded_chunks: serde_json::from_str(&chunks)
            .map_err(|e| StoreError::SerializationError(format!("Invalid chunk list: {}", e)))?,
        digest: row.get("digest"),
        session_uid: session_uid.as_deref().map(parse_uuid).transpose()?,
        started_at: parse_datetime(&started_at)?,
    })
}

/// Maps a `Sessions` row onto a `Session`
pub(crate) fn row_to_session(row: &SqliteRow) -> Result<Session, StoreError> {
    let uid: String = row.get("uid");
    let status: String = row.get("status");
    let created_on: String = row.get("created_on");
    let uploaded: i64 = row.get("uploaded");
    let total: i64 = row.get("total");

    Ok(Session {
        uid: parse_uuid(&uid)?,
        description: row.get("description"),
        status: parse_enum::<TransferStatus>(&status)?,
        uploaded: uploaded.max(0) as u64,
        total: total.max(0) as u64,
        created_on: parse_datetime(&created_on)?,
        completed_on: parse_opt_datetime(row.get("completed_on"))?,
    })
}
