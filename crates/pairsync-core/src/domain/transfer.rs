//! Transfer and Session entities
//!
//! A `Transfer` row exists while an upload or download of a pair is in
//! flight, paused or suspended. It carries what is needed to resume: the
//! tmp file of a download, or the batch and acknowledged chunks of an
//! upload. A `Session` groups user-initiated bulk transfers.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::doc_pair::PairId;
use super::errors::DomainError;

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferDirection {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(TransferDirection::Upload),
            "download" => Ok(TransferDirection::Download),
            other => Err(DomainError::UnknownState {
                kind: "transfer direction",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle status shared by transfers and sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    #[default]
    Ongoing,
    /// Paused by the user; resumable
    Paused,
    /// Paused by an engine suspension; resumed with the engine
    Suspended,
    Done,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Ongoing => "ongoing",
            TransferStatus::Paused => "paused",
            TransferStatus::Suspended => "suspended",
            TransferStatus::Done => "done",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true when a running transfer must stop at the next chunk
    pub fn is_halted(&self) -> bool {
        matches!(
            self,
            TransferStatus::Paused | TransferStatus::Suspended | TransferStatus::Cancelled
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ongoing" => Ok(TransferStatus::Ongoing),
            "paused" => Ok(TransferStatus::Paused),
            "suspended" => Ok(TransferStatus::Suspended),
            "done" => Ok(TransferStatus::Done),
            "cancelled" => Ok(TransferStatus::Cancelled),
            other => Err(DomainError::UnknownState {
                kind: "transfer",
                value: other.to_string(),
            }),
        }
    }
}

/// One active, paused or suspended upload or download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub uid: Uuid,
    pub pair_id: PairId,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub filesize: u64,
    /// Bytes transferred so far
    pub progress: u64,
    pub tmp_path: Option<PathBuf>,
    pub batch_id: Option<String>,
    pub chunk_size: u64,
    /// Indexes of chunks acknowledged by the server, ascending
    pub uploaded_chunks: Vec<u32>,
    /// Digest announced by the server for downloads
    pub digest: Option<String>,
    pub session_uid: Option<Uuid>,
    pub started_at: DateTime<Utc>,
}

impl Transfer {
    /// Creates an ongoing transfer for a pair
    pub fn new(pair_id: PairId, direction: TransferDirection, filesize: u64) -> Self {
        Self {
            uid: Uuid::new_v4(),
            pair_id,
            direction,
            status: TransferStatus::Ongoing,
            filesize,
            progress: 0,
            tmp_path: None,
            batch_id: None,
            chunk_size: 0,
            uploaded_chunks: Vec::new(),
            digest: None,
            session_uid: None,
            started_at: Utc::now(),
        }
    }

    /// Number of chunks the file splits into (at least one)
    pub fn chunk_count(&self) -> u32 {
        chunk_count(self.filesize, self.chunk_size)
    }

    /// First chunk index not yet acknowledged by the server
    pub fn next_chunk(&self) -> u32 {
        (0..self.chunk_count())
            .find(|idx| !self.uploaded_chunks.contains(idx))
            .unwrap_or_else(|| self.chunk_count())
    }

    /// Completion percentage, 0 to 100
    pub fn percent(&self) -> f64 {
        if self.filesize == 0 {
            return 100.0;
        }
        (self.progress as f64 * 100.0 / self.filesize as f64).min(100.0)
    }
}

/// Number of `chunk_size` chunks in a file of `filesize` bytes (minimum 1)
pub fn chunk_count(filesize: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 || filesize == 0 {
        return 1;
    }
    filesize.div_ceil(chunk_size) as u32
}

/// Grouping of bulk user-initiated transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub uid: Uuid,
    pub description: String,
    pub status: TransferStatus,
    pub uploaded: u64,
    pub total: u64,
    pub created_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(description: impl Into<String>, total: u64) -> Self {
        Self {
            uid: Uuid::new_v4(),
            description: description.into(),
            status: TransferStatus::Ongoing,
            uploaded: 0,
            total,
            created_on: Utc::now(),
            completed_on: None,
        }
    }

    /// Returns true once every item of the session is uploaded
    pub fn is_complete(&self) -> bool {
        self.uploaded >= self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 1024), 1);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
        assert_eq!(chunk_count(2 * 1024 * 1024, 1024 * 1024), 2);
        assert_eq!(chunk_count(10, 0), 1);
    }

    #[test]
    fn test_next_chunk_skips_acknowledged() {
        let mut transfer = Transfer::new(PairId(1), TransferDirection::Upload, 3 * 1024);
        transfer.chunk_size = 1024;
        assert_eq!(transfer.next_chunk(), 0);
        transfer.uploaded_chunks = vec![0];
        assert_eq!(transfer.next_chunk(), 1);
        transfer.uploaded_chunks = vec![0, 1, 2];
        assert_eq!(transfer.next_chunk(), 3);
    }

    #[test]
    fn test_status_round_trip_and_halt() {
        for status in [
            TransferStatus::Ongoing,
            TransferStatus::Paused,
            TransferStatus::Suspended,
            TransferStatus::Done,
            TransferStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
        }
        assert!(TransferStatus::Paused.is_halted());
        assert!(!TransferStatus::Ongoing.is_halted());
        assert!(!TransferStatus::Done.is_halted());
    }

    #[test]
    fn test_session_completion() {
        let mut session = Session::new("bulk upload", 2);
        assert!(!session.is_complete());
        session.uploaded = 2;
        assert!(session.is_complete());
    }
}
