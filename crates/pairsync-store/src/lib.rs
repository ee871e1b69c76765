//! PairSync Store - Durable pair-state persistence
//!
//! SQLite-based storage for:
//! - `DocPair` rows and their derived pair states
//! - Remote path filters
//! - Resumable transfers and transfer sessions
//! - Per-engine key/value configuration (change-log high-water mark, roots)
//!
//! ## Architecture
//!
//! This crate implements the `IPairStateStore` port from `pairsync-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter
//! in the hexagonal architecture, and the canonical notifier of the queue.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with versioned migrations and backups
//! - [`SqlitePairStore`] - Full `IPairStateStore` implementation
//! - [`StoreError`] - Error types for store operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use pairsync_store::{DatabasePool, SqlitePairStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.pairsync/engines/abc.db")).await?;
//! let store = SqlitePairStore::new(pool.pool().clone());
//! // Use store as IPairStateStore...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;
mod rows;

pub use pool::{DatabasePool, SCHEMA_VERSION};
pub use repository::SqlitePairStore;

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Backing up the database before an upgrade failed
    #[error("Backup failed: {0}")]
    BackupFailed(String),

    /// A stored value could not be mapped to a domain type
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::QueryFailed(e.to_string())
    }
}
