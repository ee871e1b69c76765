//! Database connection pool management
//!
//! Provides a wrapper around SQLx's SqlitePool with:
//! - Automatic directory creation for database files
//! - WAL journal mode for concurrent reads
//! - Versioned schema migrations tracked in the `Config` table
//! - A backup copy of the database before any schema upgrade
//! - In-memory mode for testing

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::StoreError;

/// Ordered schema migrations: `(version, sql)`
const MIGRATIONS: &[(i64, &str)] = &[
    (1, include_str!("migrations/0001_initial.sql")),
    (2, include_str!("migrations/0002_transfers.sql")),
];

/// Schema version produced by running every migration
pub const SCHEMA_VERSION: i64 = 2;

/// Manages a pool of SQLite connections for one engine database
///
/// The pool is configured with:
/// - WAL journal mode for concurrent read access
/// - 5 max connections for file-based databases
/// - 1 connection for in-memory databases (required for data persistence)
/// - 5-second busy timeout to handle write contention
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Creates a new database pool connected to the specified file
    ///
    /// This will:
    /// 1. Create parent directories if they don't exist
    /// 2. Create the database file if it doesn't exist
    /// 3. Enable WAL journal mode and foreign keys
    /// 4. Back up an existing database whose schema is older
    /// 5. Run pending schema migrations
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection cannot be established,
    /// `StoreError::BackupFailed` if the pre-upgrade copy cannot be written,
    /// or `StoreError::MigrationFailed` if schema migrations fail.
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::ConnectionFailed(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                StoreError::ConnectionFailed(format!(
                    "Failed to connect to database at {}: {}",
                    db_path.display(),
                    e
                ))
            })?;

        let current = Self::schema_version(&pool).await;
        if current > 0 && current < SCHEMA_VERSION {
            let backup = backup_path(db_path, current);
            sqlx::query("VACUUM INTO ?")
                .bind(backup.to_string_lossy().into_owned())
                .execute(&pool)
                .await
                .map_err(|e| {
                    StoreError::BackupFailed(format!(
                        "Failed to back up {} to {}: {}",
                        db_path.display(),
                        backup.display(),
                        e
                    ))
                })?;
            tracing::info!(
                backup = %backup.display(),
                from = current,
                to = SCHEMA_VERSION,
                "Database backed up before schema upgrade"
            );
        }

        Self::run_migrations(&pool, current).await?;

        tracing::info!(
            path = %db_path.display(),
            schema_version = SCHEMA_VERSION,
            "Database pool initialized"
        );

        Ok(Self { pool })
    }

    /// Creates an in-memory database pool for testing
    ///
    /// Uses a single connection to ensure data persistence across queries
    /// (SQLite in-memory databases are per-connection).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection cannot be established,
    /// or `StoreError::MigrationFailed` if schema migrations fail.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                StoreError::ConnectionFailed(format!("Failed to create in-memory database: {}", e))
            })?;

        sqlx::raw_sql("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .map_err(|e| {
                StoreError::MigrationFailed(format!("Failed to enable foreign keys: {}", e))
            })?;

        Self::run_migrations(&pool, 0).await?;

        tracing::debug!("In-memory database pool initialized");

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reads the schema version; 0 for a fresh database
    async fn schema_version(pool: &SqlitePool) -> i64 {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM Config WHERE name = 'schema_version'")
                .fetch_optional(pool)
                .await
                .ok()
                .flatten();
        value.and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// Runs every migration newer than `current`
    async fn run_migrations(pool: &SqlitePool, current: i64) -> Result<(), StoreError> {
        for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
            sqlx::raw_sql(sql).execute(pool).await.map_err(|e| {
                StoreError::MigrationFailed(format!("Failed to run migration {}: {}", version, e))
            })?;
            sqlx::query("INSERT OR REPLACE INTO Config (name, value) VALUES ('schema_version', ?)")
                .bind(version.to_string())
                .execute(pool)
                .await
                .map_err(|e| {
                    StoreError::MigrationFailed(format!(
                        "Failed to record schema version {}: {}",
                        version, e
                    ))
                })?;
            tracing::debug!(version, "Migration applied");
        }
        Ok(())
    }
}

/// Path of the backup written before upgrading from `version`
pub fn backup_path(db_path: &Path, version: i64) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(format!(".{version}.bak"));
    PathBuf::from(name)
}
