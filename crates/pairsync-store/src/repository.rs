//! SQLite implementation of IPairStateStore
//!
//! Every write goes through a read-modify-write on a `DocPair` snapshot:
//! the stored row is loaded, the caller's observation is merged in, the
//! pair state is re-derived with [`derive_pair_state`] and the full row is
//! written back. Multi-row operations run inside a transaction and notify
//! the queue only after the commit.
//!
//! The `processor` column is never part of the full-row write: only
//! [`acquire_state`] and [`release_state`] touch it.
//!
//! [`derive_pair_state`]: pairsync_core::domain::derive_pair_state
//! [`acquire_state`]: SqlitePairStore::acquire_state
//! [`release_state`]: SqlitePairStore::release_state

use std::path::Path;
use std::sync::{RwLock, Weak};

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqliteRow};
use sqlx::{Sqlite, SqlitePool};
use uuid::Uuid;

use pairsync_core::domain::{
    DigestKind, DocPair, DomainError, Filter, LocalInfo, LocalState, PairId, PairState,
    RemoteInfo, RemoteState, Session, Side, Transfer, TransferDirection, TransferStatus,
};
use pairsync_core::ports::{IPairStateStore, IQueueSink, QueueItem};

use crate::rows::{
    datetime_to_string, opt_datetime_to_string, path_to_string, row_to_pair, row_to_session,
    row_to_transfer,
};
use crate::StoreError;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const INSERT_PAIR: &str = "INSERT INTO States (
        local_path, local_parent_path, local_name,
        remote_ref, remote_parent_ref, remote_name, remote_parent_path,
        folderish, local_digest, remote_digest, digest_algorithm, size,
        last_local_updated, last_remote_updated, last_sync_date,
        error_count, version, local_state, remote_state, pair_state,
        last_error, last_error_details, error_next_try,
        remote_can_rename, remote_can_delete, remote_can_update,
        remote_can_create_child, remote_lock_owner
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const UPDATE_PAIR: &str = "UPDATE States SET
        local_path = ?, local_parent_path = ?, local_name = ?,
        remote_ref = ?, remote_parent_ref = ?, remote_name = ?, remote_parent_path = ?,
        folderish = ?, local_digest = ?, remote_digest = ?, digest_algorithm = ?, size = ?,
        last_local_updated = ?, last_remote_updated = ?, last_sync_date = ?,
        error_count = ?, version = ?, local_state = ?, remote_state = ?, pair_state = ?,
        last_error = ?, last_error_details = ?, error_next_try = ?,
        remote_can_rename = ?, remote_can_delete = ?, remote_can_update = ?,
        remote_can_create_child = ?, remote_lock_owner = ?
    WHERE id = ?";

/// Last error recorded on remote documents whose digest cannot be verified
pub const UNKNOWN_DIGEST: &str = "UNKNOWN_DIGEST";

/// SQLite-based implementation of the pair-state store port
///
/// Holds a weak handle to the queue so that the engine stays the single
/// owner of both the store and the queue.
pub struct SqlitePairStore {
    pool: SqlitePool,
    queue: RwLock<Option<Weak<dyn IQueueSink>>>,
}

impl SqlitePairStore {
    /// Creates a new store on top of a migrated connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            queue: RwLock::new(None),
        }
    }

    /// Pushes every processable item to the registered queue
    fn notify(&self, items: impl IntoIterator<Item = QueueItem>) {
        for item in items {
            self.queue_pair_state(item.id, item.folderish, item.pair_state);
        }
    }

    async fn load(&self, id: PairId) -> Result<DocPair> {
        let mut conn = self.pool.acquire().await?;
        fetch_pair(&mut conn, id)
            .await?
            .ok_or_else(|| DomainError::PairNotFound(id.get()).into())
    }

    async fn fetch_many(&self, sql: &str, binds: &[&str]) -> Result<Vec<DocPair>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        to_pairs(rows)
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Prefix matched by every descendant of `path` (`/a` gives `/a/`)
fn child_prefix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// `(col = ? OR substr(col, 1, length(?)) = ?)`: binds path, prefix, prefix
fn subtree_clause(column: &str) -> String {
    format!("({column} = ? OR substr({column}, 1, length(?)) = ?)")
}

/// `substr(col, 1, length(?)) = ?`: binds prefix, prefix
fn below_clause(column: &str) -> String {
    format!("substr({column}, 1, length(?)) = ?")
}

fn to_pairs(rows: Vec<SqliteRow>) -> Result<Vec<DocPair>> {
    rows.iter()
        .map(row_to_pair)
        .collect::<Result<Vec<_>, StoreError>>()
        .map_err(Into::into)
}

fn bind_pair<'q>(query: SqliteQuery<'q>, pair: &'q DocPair) -> SqliteQuery<'q> {
    query
        .bind(path_to_string(&pair.local_path))
        .bind(path_to_string(&pair.local_parent_path))
        .bind(pair.local_name.as_str())
        .bind(pair.remote_ref.as_deref())
        .bind(pair.remote_parent_ref.as_deref())
        .bind(pair.remote_name.as_deref())
        .bind(pair.remote_parent_path.as_deref())
        .bind(pair.folderish)
        .bind(pair.local_digest.as_deref())
        .bind(pair.remote_digest.as_deref())
        .bind(pair.digest_algorithm.as_deref())
        .bind(pair.size as i64)
        .bind(opt_datetime_to_string(&pair.last_local_updated))
        .bind(opt_datetime_to_string(&pair.last_remote_updated))
        .bind(opt_datetime_to_string(&pair.last_sync_date))
        .bind(pair.error_count as i64)
        .bind(pair.version)
        .bind(pair.local_state.as_str())
        .bind(pair.remote_state.as_str())
        .bind(pair.pair_state.as_str())
        .bind(pair.last_error.as_deref())
        .bind(pair.last_error_details.as_deref())
        .bind(pair.error_next_try)
        .bind(pair.remote_can_rename)
        .bind(pair.remote_can_delete)
        .bind(pair.remote_can_update)
        .bind(pair.remote_can_create_child)
        .bind(pair.remote_lock_owner.as_deref())
}

fn map_insert_error(err: sqlx::Error, pair: &DocPair) -> anyhow::Error {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return DomainError::DuplicateRemote {
                remote_ref: pair.remote_ref.clone().unwrap_or_default(),
                remote_parent_ref: pair.remote_parent_ref.clone().unwrap_or_default(),
            }
            .into();
        }
        if db.is_check_violation() {
            return DomainError::GhostPair.into();
        }
    }
    StoreError::from(err).into()
}

async fn fetch_pair(conn: &mut SqliteConnection, id: PairId) -> Result<Option<DocPair>> {
    let row = sqlx::query("SELECT * FROM States WHERE id = ?")
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(row_to_pair).transpose()?)
}

/// Re-derives `pair_state`, resolving the parent agreement when needed
async fn derive(conn: &mut SqliteConnection, pair: &mut DocPair) -> Result<PairState> {
    let same_parent =
        if pair.local_state == LocalState::Moved && pair.remote_state == RemoteState::Moved {
            let parent_ref: Option<Option<String>> =
                sqlx::query_scalar("SELECT remote_ref FROM States WHERE local_path = ?")
                    .bind(path_to_string(&pair.local_parent_path))
                    .fetch_optional(&mut *conn)
                    .await?;
            match (parent_ref.flatten(), pair.remote_parent_ref.as_ref()) {
                (Some(parent), Some(expected)) => &parent == expected,
                _ => false,
            }
        } else {
            false
        };
    Ok(pair.refresh_pair_state(same_parent))
}

/// Writes the full row; `expected_version` adds an optimistic check
async fn persist(
    conn: &mut SqliteConnection,
    pair: &DocPair,
    expected_version: Option<i64>,
) -> Result<bool> {
    let sql = match expected_version {
        Some(_) => format!("{UPDATE_PAIR} AND version = ?"),
        None => UPDATE_PAIR.to_string(),
    };
    let mut query = bind_pair(sqlx::query(&sql), pair).bind(pair.id.get());
    if let Some(version) = expected_version {
        query = query.bind(version);
    }
    let result = query.execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

async fn insert_pair(conn: &mut SqliteConnection, pair: &DocPair) -> Result<PairId> {
    pair.validate()?;
    let result = bind_pair(sqlx::query(INSERT_PAIR), pair)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_insert_error(e, pair))?;
    Ok(PairId(result.last_insert_rowid()))
}

/// Rows below the local folder `path` (the folder itself excluded)
async fn local_descendants(conn: &mut SqliteConnection, path: &Path) -> Result<Vec<DocPair>> {
    let prefix = child_prefix(&path_to_string(path));
    let sql = format!("SELECT * FROM States WHERE {} ORDER BY id", below_clause("local_path"));
    let rows = sqlx::query(&sql)
        .bind(prefix.as_str())
        .bind(prefix.as_str())
        .fetch_all(&mut *conn)
        .await?;
    to_pairs(rows)
}

/// Rows below the remote folder whose reference path is `remote_path`
async fn remote_descendants(
    conn: &mut SqliteConnection,
    remote_path: &str,
) -> Result<Vec<DocPair>> {
    let prefix = child_prefix(remote_path);
    let sql = format!(
        "SELECT * FROM States WHERE {} ORDER BY id",
        subtree_clause("remote_parent_path")
    );
    let rows = sqlx::query(&sql)
        .bind(remote_path)
        .bind(prefix.as_str())
        .bind(prefix.as_str())
        .fetch_all(&mut *conn)
        .await?;
    to_pairs(rows)
}

/// Rewrites `column` for rows at or below `old` so they start with `new`
async fn rewrite_prefix(
    conn: &mut SqliteConnection,
    column: &str,
    old: &str,
    new: &str,
) -> Result<u64> {
    let prefix = child_prefix(old);
    let sql = format!(
        "UPDATE States SET {column} = ? || substr({column}, length(?) + 1) WHERE {}",
        subtree_clause(column)
    );
    let result = sqlx::query(&sql)
        .bind(new)
        .bind(old)
        .bind(old)
        .bind(prefix.as_str())
        .bind(prefix.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Deletes the rows below `row`, by local path and optionally by remote path
async fn delete_subtree(
    conn: &mut SqliteConnection,
    row: &DocPair,
    remote_recursion: bool,
) -> Result<u64> {
    let mut removed = 0;
    if remote_recursion {
        if let Some(tree) = row.remote_path() {
            let prefix = child_prefix(&tree);
            let sql = format!("DELETE FROM States WHERE {}", subtree_clause("remote_parent_path"));
            removed += sqlx::query(&sql)
                .bind(tree.as_str())
                .bind(prefix.as_str())
                .bind(prefix.as_str())
                .execute(&mut *conn)
                .await?
                .rows_affected();
        }
    }
    if !row.local_path.as_os_str().is_empty() {
        let prefix = child_prefix(&path_to_string(&row.local_path));
        let sql = format!("DELETE FROM States WHERE {}", below_clause("local_path"));
        removed += sqlx::query(&sql)
            .bind(prefix.as_str())
            .bind(prefix.as_str())
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(removed)
}

fn processable_in_list() -> String {
    PairState::ALL
        .iter()
        .filter(|state| state.is_processable())
        .map(|state| format!("'{}'", state.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// IPairStateStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IPairStateStore for SqlitePairStore {
    fn register_queue(&self, sink: Weak<dyn IQueueSink>) {
        match self.queue.write() {
            Ok(mut queue) => *queue = Some(sink),
            Err(poisoned) => *poisoned.into_inner() = Some(sink),
        }
    }

    fn queue_pair_state(&self, id: PairId, folderish: bool, pair_state: PairState) {
        if !pair_state.is_processable() {
            return;
        }
        let sink = match self.queue.read() {
            Ok(queue) => queue.as_ref().and_then(Weak::upgrade),
            Err(poisoned) => poisoned.into_inner().as_ref().and_then(Weak::upgrade),
        };
        if let Some(sink) = sink {
            sink.push(QueueItem::new(id, folderish, pair_state));
        }
    }

    // --- Inserts ---

    async fn insert_local(&self, info: &LocalInfo, parent_path: &Path) -> Result<PairId> {
        let mut pair = DocPair {
            local_path: info.path.clone(),
            local_parent_path: parent_path.to_path_buf(),
            local_name: info.name(),
            folderish: info.folderish,
            size: info.size,
            last_local_updated: Some(info.last_modification_time),
            local_state: LocalState::Created,
            remote_state: RemoteState::Unknown,
            remote_can_rename: true,
            remote_can_delete: true,
            remote_can_update: true,
            remote_can_create_child: true,
            ..Default::default()
        };
        let mut conn = self.pool.acquire().await?;
        derive(&mut conn, &mut pair).await?;
        let id = insert_pair(&mut conn, &pair).await?;
        drop(conn);

        tracing::debug!(id = %id, path = %info.path.display(), state = %pair.pair_state, "Local pair inserted");
        self.queue_pair_state(id, pair.folderish, pair.pair_state);
        Ok(id)
    }

    async fn insert_remote(
        &self,
        info: &RemoteInfo,
        remote_parent_path: &str,
        local_path: &Path,
        local_parent_path: &Path,
    ) -> Result<PairId> {
        let mut pair = DocPair {
            local_path: local_path.to_path_buf(),
            local_parent_path: local_parent_path.to_path_buf(),
            local_name: info.name.clone(),
            remote_ref: Some(info.uid.clone()),
            remote_parent_ref: info.parent_uid.clone(),
            remote_name: Some(info.name.clone()),
            remote_parent_path: Some(remote_parent_path.to_string()),
            folderish: info.folderish,
            remote_digest: info.digest.clone(),
            digest_algorithm: info.digest_algorithm.clone(),
            size: info.size,
            last_remote_updated: info.last_modification_time,
            local_state: LocalState::Unknown,
            remote_state: RemoteState::Created,
            remote_can_rename: info.can_rename,
            remote_can_delete: info.can_delete,
            remote_can_update: info.can_update,
            remote_can_create_child: info.can_create_child,
            remote_lock_owner: info.lock_owner.clone(),
            ..Default::default()
        };
        if !pair.folderish && matches!(pair.digest_kind(), Some(DigestKind::Unsupported(_))) {
            pair.last_error = Some(UNKNOWN_DIGEST.to_string());
        }

        let mut conn = self.pool.acquire().await?;
        derive(&mut conn, &mut pair).await?;
        let id = insert_pair(&mut conn, &pair).await?;
        drop(conn);

        tracing::debug!(id = %id, remote_ref = %info.uid, state = %pair.pair_state, "Remote pair inserted");
        self.queue_pair_state(id, pair.folderish, pair.pair_state);
        Ok(id)
    }

    // --- Observations ---

    async fn update_local_state(
        &self,
        row: &DocPair,
        info: &LocalInfo,
        versioned: bool,
        queue: bool,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let mut pair = fetch_pair(&mut tx, row.id)
            .await?
            .ok_or(DomainError::PairNotFound(row.id.get()))?;
        if row.version < pair.version {
            tracing::debug!(id = %row.id, seen = row.version, current = pair.version, "Stale local update rejected");
            return Ok(false);
        }
        let current = pair.version;

        pair.local_path = info.path.clone();
        pair.local_parent_path = info.parent_path();
        pair.local_name = info.name();
        pair.folderish = info.folderish;
        pair.size = info.size;
        pair.last_local_updated = Some(info.last_modification_time);
        pair.local_digest = row.local_digest.clone();
        pair.local_state = row.local_state;
        if versioned {
            pair.version += 1;
        }
        derive(&mut tx, &mut pair).await?;
        if !persist(&mut tx, &pair, Some(current)).await? {
            return Ok(false);
        }
        tx.commit().await?;

        tracing::debug!(id = %pair.id, local_state = %pair.local_state, state = %pair.pair_state, "Local state updated");
        if queue {
            self.queue_pair_state(pair.id, pair.folderish, pair.pair_state);
        }
        Ok(true)
    }

    async fn update_remote_state(
        &self,
        row: &DocPair,
        info: &RemoteInfo,
        remote_parent_path: Option<&str>,
        versioned: bool,
        force_update: bool,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let stored = fetch_pair(&mut tx, row.id)
            .await?
            .ok_or(DomainError::PairNotFound(row.id.get()))?;
        if row.version < stored.version {
            tracing::debug!(id = %row.id, seen = row.version, current = stored.version, "Stale remote update rejected");
            return Ok(false);
        }

        let mut pair = stored.clone();
        pair.remote_ref = Some(info.uid.clone());
        pair.remote_parent_ref = info.parent_uid.clone();
        pair.remote_name = Some(info.name.clone());
        pair.remote_parent_path = Some(
            remote_parent_path
                .map(str::to_string)
                .unwrap_or_else(|| info.parent_path()),
        );
        pair.folderish = info.folderish;
        pair.remote_digest = info.digest.clone();
        pair.digest_algorithm = info.digest_algorithm.clone();
        pair.last_remote_updated = info.last_modification_time;
        pair.remote_can_rename = info.can_rename;
        pair.remote_can_delete = info.can_delete;
        pair.remote_can_update = info.can_update;
        pair.remote_can_create_child = info.can_create_child;
        pair.remote_lock_owner = info.lock_owner.clone();
        pair.remote_state = row.remote_state;

        if !force_update && pair == stored {
            return Ok(false);
        }
        if versioned {
            pair.version += 1;
        }
        derive(&mut tx, &mut pair).await?;
        if !persist(&mut tx, &pair, Some(stored.version)).await? {
            return Ok(false);
        }
        tx.commit().await?;

        tracing::debug!(id = %pair.id, remote_state = %pair.remote_state, state = %pair.pair_state, "Remote state updated");
        self.queue_pair_state(pair.id, pair.folderish, pair.pair_state);
        Ok(true)
    }

    async fn update_local_parent_path(
        &self,
        row: &DocPair,
        new_name: &str,
        new_parent_path: &Path,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut pair = fetch_pair(&mut tx, row.id)
            .await?
            .ok_or(DomainError::PairNotFound(row.id.get()))?;

        let old_path = path_to_string(&pair.local_path);
        let new_path = new_parent_path.join(new_name);
        if pair.folderish && !old_path.is_empty() {
            let new_str = path_to_string(&new_path);
            rewrite_prefix(&mut tx, "local_parent_path", &old_path, &new_str).await?;
            rewrite_prefix(&mut tx, "local_path", &old_path, &new_str).await?;
        }

        pair.local_name = new_name.to_string();
        pair.local_parent_path = new_parent_path.to_path_buf();
        pair.local_path = new_path;
        pair.version += 1;
        persist(&mut tx, &pair, None).await?;
        tx.commit().await?;

        tracing::debug!(id = %pair.id, path = %pair.local_path.display(), "Local path updated");
        Ok(())
    }

    async fn update_remote_parent_path(&self, row: &DocPair, new_path: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if row.folderish {
            if let (Some(old_tree), Some(remote_ref)) = (row.remote_path(), row.remote_ref.as_ref())
            {
                let new_tree = format!("{}/{}", new_path.trim_end_matches('/'), remote_ref);
                rewrite_prefix(&mut tx, "remote_parent_path", &old_tree, &new_tree).await?;
            }
        }
        sqlx::query("UPDATE States SET remote_parent_path = ? WHERE id = ?")
            .bind(new_path)
            .bind(row.id.get())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_local_digest(&self, id: PairId, digest: &str) -> Result<()> {
        sqlx::query("UPDATE States SET local_digest = ? WHERE id = ?")
            .bind(digest)
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Reads ---

    async fn get_state_from_id(&self, id: PairId) -> Result<Option<DocPair>> {
        let mut conn = self.pool.acquire().await?;
        fetch_pair(&mut conn, id).await
    }

    async fn get_state_from_local(&self, path: &Path) -> Result<Option<DocPair>> {
        let path = path_to_string(path);
        Ok(self
            .fetch_many("SELECT * FROM States WHERE local_path = ? ORDER BY id LIMIT 1", &[path.as_str()])
            .await?
            .into_iter()
            .next())
    }

    async fn get_state_from_remote(&self, remote_ref: &str) -> Result<Option<DocPair>> {
        Ok(self
            .fetch_many(
                "SELECT * FROM States WHERE remote_ref = ? ORDER BY id LIMIT 1",
                &[remote_ref],
            )
            .await?
            .into_iter()
            .next())
    }

    async fn get_state_from_remote_with_path(
        &self,
        remote_ref: &str,
        remote_parent_path: &str,
    ) -> Result<Option<DocPair>> {
        Ok(self
            .fetch_many(
                "SELECT * FROM States WHERE remote_ref = ? AND remote_parent_path = ? ORDER BY id LIMIT 1",
                &[remote_ref, remote_parent_path],
            )
            .await?
            .into_iter()
            .next())
    }

    async fn get_local_children(&self, path: &Path) -> Result<Vec<DocPair>> {
        let path = path_to_string(path);
        self.fetch_many(
            "SELECT * FROM States WHERE local_parent_path = ? AND local_path <> '' ORDER BY local_name",
            &[path.as_str()],
        )
        .await
    }

    async fn get_remote_children(&self, remote_ref: &str) -> Result<Vec<DocPair>> {
        self.fetch_many(
            "SELECT * FROM States WHERE remote_parent_ref = ? ORDER BY id",
            &[remote_ref],
        )
        .await
    }

    async fn get_new_remote_children(&self, remote_ref: &str) -> Result<Vec<DocPair>> {
        self.fetch_many(
            "SELECT * FROM States WHERE remote_parent_ref = ? AND remote_state = 'created' AND local_state = 'unknown' ORDER BY id",
            &[remote_ref],
        )
        .await
    }

    async fn get_states_from_partial_local(&self, prefix: &Path) -> Result<Vec<DocPair>> {
        let path = path_to_string(prefix);
        let below = child_prefix(&path);
        let sql = format!(
            "SELECT * FROM States WHERE local_path <> '' AND {} ORDER BY local_path",
            subtree_clause("local_path")
        );
        self.fetch_many(&sql, &[path.as_str(), below.as_str(), below.as_str()]).await
    }

    async fn get_dedupe_pair(
        &self,
        name: &str,
        remote_parent_ref: &str,
        exclude: PairId,
    ) -> Result<Option<DocPair>> {
        let row = sqlx::query(
            "SELECT * FROM States WHERE local_name = ? AND remote_parent_ref = ? AND id <> ? ORDER BY id LIMIT 1",
        )
        .bind(name)
        .bind(remote_parent_ref)
        .bind(exclude.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_pair).transpose()?)
    }

    async fn get_queue_items(&self) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT * FROM States WHERE pair_state IN ({}) ORDER BY id",
            processable_in_list()
        );
        Ok(self
            .fetch_many(&sql, &[])
            .await?
            .into_iter()
            .map(|pair| QueueItem::new(pair.id, pair.folderish, pair.pair_state))
            .collect())
    }

    async fn get_errors(&self, threshold: u32) -> Result<Vec<DocPair>> {
        let rows = sqlx::query("SELECT * FROM States WHERE error_count >= ? ORDER BY id")
            .bind(threshold as i64)
            .fetch_all(&self.pool)
            .await?;
        to_pairs(rows)
    }

    async fn get_conflicts(&self) -> Result<Vec<DocPair>> {
        self.fetch_many(
            "SELECT * FROM States WHERE pair_state = ? ORDER BY id",
            &[PairState::Conflicted.as_str()],
        )
        .await
    }

    async fn get_unsynchronizeds(&self) -> Result<Vec<DocPair>> {
        self.fetch_many(
            "SELECT * FROM States WHERE pair_state = ? ORDER BY id",
            &[PairState::Unsynchronized.as_str()],
        )
        .await
    }

    async fn get_count(&self, state: Option<PairState>) -> Result<u64> {
        let count: i64 = match state {
            Some(state) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM States WHERE pair_state = ?")
                    .bind(state.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM States")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count.max(0) as u64)
    }

    // --- Processor ownership ---

    async fn acquire_state(&self, worker_id: u64, id: PairId) -> Result<Option<DocPair>> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            "UPDATE States SET processor = ? WHERE id = ? AND (processor = 0 OR processor = ?)",
        )
        .bind(worker_id as i64)
        .bind(id.get())
        .bind(worker_id as i64)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            tracing::trace!(id = %id, worker_id, "Pair already owned by another worker");
            return Ok(None);
        }
        fetch_pair(&mut conn, id).await
    }

    async fn release_state(&self, worker_id: u64) -> Result<()> {
        sqlx::query("UPDATE States SET processor = 0 WHERE processor = ?")
            .bind(worker_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reinit_processors(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE States SET processor = 0")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE States SET error_count = 0, last_error = NULL, last_error_details = NULL, error_next_try = 0 WHERE pair_state = 'synchronized'",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // --- Transitions ---

    async fn synchronize_state(
        &self,
        row: &DocPair,
        version: Option<i64>,
        dynamic_states: bool,
    ) -> Result<bool> {
        let expected = version.unwrap_or(row.version);
        let mut conn = self.pool.acquire().await?;
        let Some(mut pair) = fetch_pair(&mut conn, row.id).await? else {
            return Ok(false);
        };

        if dynamic_states {
            pair.local_state = row.local_state;
            pair.remote_state = row.remote_state;
        } else {
            pair.local_state = LocalState::Synchronized;
            pair.remote_state = RemoteState::Synchronized;
        }
        pair.local_digest = row.local_digest.clone();
        pair.last_sync_date = Some(Utc::now());
        pair.error_count = 0;
        pair.error_next_try = 0;
        pair.last_error = None;
        pair.last_error_details = None;
        derive(&mut conn, &mut pair).await?;

        let mut updated = persist(&mut conn, &pair, Some(expected)).await?;
        if !updated && pair.folderish {
            // Folders absorb concurrent child events as version bumps
            updated = persist(&mut conn, &pair, None).await?;
        }
        drop(conn);

        if !updated {
            tracing::debug!(id = %row.id, expected, "Stale synchronization rejected");
            return Ok(false);
        }
        tracing::debug!(id = %pair.id, state = %pair.pair_state, "Pair synchronized");
        self.queue_pair_state(pair.id, pair.folderish, pair.pair_state);
        Ok(true)
    }

    async fn unsynchronize_state(&self, row: &DocPair, reason: &str) -> Result<()> {
        let mut pair = self.load(row.id).await?;
        pair.local_state = LocalState::Unsynchronized;
        pair.remote_state = RemoteState::Unknown;
        pair.last_sync_date = Some(Utc::now());
        pair.last_error = Some(reason.to_string());
        pair.error_count = 0;
        pair.error_next_try = 0;

        let mut conn = self.pool.acquire().await?;
        derive(&mut conn, &mut pair).await?;
        persist(&mut conn, &pair, None).await?;

        tracing::info!(id = %pair.id, path = %pair.local_path.display(), reason, "Pair unsynchronized");
        Ok(())
    }

    async fn unset_unsynchronized(&self, row: &DocPair) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut targets = Vec::new();
        if let Some(pair) = fetch_pair(&mut tx, row.id).await? {
            targets.push(pair);
        }
        if !row.local_path.as_os_str().is_empty() && row.folderish {
            targets.extend(local_descendants(&mut tx, &row.local_path).await?);
        }

        let mut queued = Vec::new();
        for mut pair in targets {
            if pair.pair_state != PairState::Unsynchronized {
                continue;
            }
            if pair.local_path.as_os_str().is_empty() {
                pair.local_state = LocalState::Unknown;
                pair.remote_state = RemoteState::Created;
            } else {
                pair.local_state = LocalState::Created;
                pair.remote_state = RemoteState::Unknown;
            }
            pair.last_error = None;
            pair.last_error_details = None;
            derive(&mut tx, &mut pair).await?;
            persist(&mut tx, &pair, None).await?;
            queued.push(QueueItem::new(pair.id, pair.folderish, pair.pair_state));
        }
        tx.commit().await?;

        tracing::debug!(id = %row.id, count = queued.len(), "Unsynchronized pairs restored");
        self.notify(queued);
        Ok(())
    }

    async fn remove_state(&self, row: &DocPair, remote_recursion: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM States WHERE id = ?")
            .bind(row.id.get())
            .execute(&mut *tx)
            .await?;
        let removed = if row.folderish {
            delete_subtree(&mut tx, row, remote_recursion).await?
        } else {
            0
        };
        tx.commit().await?;

        tracing::debug!(id = %row.id, children = removed, "Pair removed");
        Ok(())
    }

    async fn remove_state_children(&self, row: &DocPair, remote_recursion: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let removed = delete_subtree(&mut tx, row, remote_recursion).await?;
        tx.commit().await?;

        tracing::debug!(id = %row.id, removed, "Pair children removed");
        Ok(())
    }

    async fn mark_resolved(&self, row: &DocPair, side: Side) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let Some(mut pair) = fetch_pair(&mut conn, row.id).await? else {
            return Ok(false);
        };
        match side {
            Side::Local => {
                pair.local_state = LocalState::Resolved;
                pair.remote_state = RemoteState::Unknown;
            }
            Side::Remote => {
                pair.local_state = LocalState::Synchronized;
                pair.remote_state = RemoteState::Resolved;
            }
        }
        pair.version = row.version + 1;
        derive(&mut conn, &mut pair).await?;
        let updated = persist(&mut conn, &pair, Some(row.version)).await?;
        drop(conn);

        if updated {
            tracing::info!(id = %pair.id, side = ?side, state = %pair.pair_state, "Conflict resolved");
            self.queue_pair_state(pair.id, pair.folderish, pair.pair_state);
        }
        Ok(updated)
    }

    async fn set_conflict_state(&self, row: &DocPair) -> Result<bool> {
        if row.folderish {
            return Ok(false);
        }
        let mut conn = self.pool.acquire().await?;
        let Some(mut pair) = fetch_pair(&mut conn, row.id).await? else {
            return Ok(false);
        };
        pair.local_state = LocalState::Modified;
        pair.remote_state = RemoteState::Modified;
        pair.local_digest = row.local_digest.clone();
        derive(&mut conn, &mut pair).await?;
        let updated = persist(&mut conn, &pair, None).await?;

        tracing::info!(id = %pair.id, path = %pair.local_path.display(), state = %pair.pair_state, "Conflict detected");
        Ok(updated)
    }

    async fn delete_remote_state(&self, row: &DocPair) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(mut pair) = fetch_pair(&mut tx, row.id).await? else {
            return Ok(());
        };
        pair.remote_state = RemoteState::Deleted;
        derive(&mut tx, &mut pair).await?;
        persist(&mut tx, &pair, None).await?;

        if pair.folderish {
            if let Some(tree) = pair.remote_path() {
                for mut child in remote_descendants(&mut tx, &tree).await? {
                    child.remote_state = RemoteState::Deleted;
                    derive(&mut tx, &mut child).await?;
                    persist(&mut tx, &child, None).await?;
                }
            }
        }
        tx.commit().await?;

        tracing::debug!(id = %pair.id, state = %pair.pair_state, "Remote deletion recorded");
        self.queue_pair_state(pair.id, pair.folderish, pair.pair_state);
        Ok(())
    }

    async fn delete_local_state(&self, row: &DocPair) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(mut pair) = fetch_pair(&mut tx, row.id).await? else {
            return Ok(());
        };
        pair.local_state = LocalState::Deleted;
        derive(&mut tx, &mut pair).await?;
        persist(&mut tx, &pair, None).await?;

        if pair.folderish && !pair.local_path.as_os_str().is_empty() {
            for mut child in local_descendants(&mut tx, &pair.local_path).await? {
                child.local_state = LocalState::Deleted;
                derive(&mut tx, &mut child).await?;
                persist(&mut tx, &child, None).await?;
            }
        }
        tx.commit().await?;

        tracing::debug!(id = %pair.id, state = %pair.pair_state, "Local deletion recorded");
        self.queue_pair_state(pair.id, pair.folderish, pair.pair_state);
        Ok(())
    }

    async fn increase_error(
        &self,
        row: &DocPair,
        code: &str,
        details: Option<&str>,
        incr: u32,
        retry_in: u64,
    ) -> Result<DocPair> {
        let next_try = now_epoch() + retry_in as i64;
        sqlx::query(
            "UPDATE States SET error_count = error_count + ?, last_error = ?, last_error_details = ?, error_next_try = ? WHERE id = ?",
        )
        .bind(incr as i64)
        .bind(code)
        .bind(details)
        .bind(next_try)
        .bind(row.id.get())
        .execute(&self.pool)
        .await?;

        let pair = self.load(row.id).await?;
        tracing::warn!(
            id = %pair.id,
            path = %pair.local_path.display(),
            error = code,
            error_count = pair.error_count,
            retry_in,
            "Pair processing failed"
        );
        Ok(pair)
    }

    async fn reset_error(&self, row: &DocPair, last_error: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE States SET error_count = 0, last_error = ?, last_error_details = NULL, error_next_try = 0 WHERE id = ?",
        )
        .bind(last_error)
        .bind(row.id.get())
        .execute(&self.pool)
        .await?;

        let pair = self.load(row.id).await?;
        self.queue_pair_state(pair.id, pair.folderish, pair.pair_state);
        Ok(())
    }

    async fn replace_local_paths(&self, old_prefix: &Path, new_prefix: &Path) -> Result<u64> {
        let old = path_to_string(old_prefix);
        let new = path_to_string(new_prefix);
        let mut tx = self.pool.begin().await?;
        let touched = rewrite_prefix(&mut tx, "local_path", &old, &new).await?;
        rewrite_prefix(&mut tx, "local_parent_path", &old, &new).await?;
        tx.commit().await?;

        tracing::debug!(old = %old, new = %new, touched, "Local paths rewritten");
        Ok(touched)
    }

    // --- Filters ---

    async fn get_filters(&self) -> Result<Vec<Filter>> {
        let paths: Vec<String> = sqlx::query_scalar("SELECT path FROM Filters ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        Ok(paths.into_iter().map(Filter::new).collect())
    }

    async fn add_filter(&self, path: &str) -> Result<()> {
        let filter = Filter::new(path);
        if self.is_filter(&filter.path).await? {
            return Ok(());
        }
        let prefix = child_prefix(&filter.path);

        let mut tx = self.pool.begin().await?;
        let sql = format!("DELETE FROM Filters WHERE {}", subtree_clause("path"));
        sqlx::query(&sql)
            .bind(filter.path.as_str())
            .bind(prefix.as_str())
            .bind(prefix.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO Filters (path) VALUES (?)")
            .bind(filter.path.as_str())
            .execute(&mut *tx)
            .await?;
        let sql = format!("DELETE FROM States WHERE {}", subtree_clause("remote_parent_path"));
        let dropped = sqlx::query(&sql)
            .bind(filter.path.as_str())
            .bind(prefix.as_str())
            .bind(prefix.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        tracing::info!(path = %filter.path, dropped, "Filter added");
        Ok(())
    }

    async fn remove_filter(&self, path: &str) -> Result<()> {
        let filter = Filter::new(path);
        let prefix = child_prefix(&filter.path);
        let sql = format!("DELETE FROM Filters WHERE {}", subtree_clause("path"));
        sqlx::query(&sql)
            .bind(filter.path.as_str())
            .bind(prefix.as_str())
            .bind(prefix.as_str())
            .execute(&self.pool)
            .await?;
        tracing::info!(path = %filter.path, "Filter removed");
        Ok(())
    }

    async fn is_filter(&self, path: &str) -> Result<bool> {
        let filters = self.get_filters().await?;
        Ok(pairsync_core::domain::is_filtered(&filters, path))
    }

    // --- Key/value configuration ---

    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM Config WHERE name = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.flatten())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO Config (name, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_config(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM Config WHERE name = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Transfers ---

    async fn save_transfer(&self, transfer: &Transfer) -> Result<()> {
        let chunks = serde_json::to_string(&transfer.uploaded_chunks)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        sqlx::query(
            "INSERT OR REPLACE INTO Transfers (
                uid, pair_id, direction, status, filesize, progress, tmp_path,
                batch_id, chunk_size, uploaded_chunks, digest, session_uid, started_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(transfer.uid.to_string())
        .bind(transfer.pair_id.get())
        .bind(transfer.direction.as_str())
        .bind(transfer.status.as_str())
        .bind(transfer.filesize as i64)
        .bind(transfer.progress as i64)
        .bind(transfer.tmp_path.as_deref().map(path_to_string))
        .bind(transfer.batch_id.as_deref())
        .bind(transfer.chunk_size as i64)
        .bind(chunks)
        .bind(transfer.digest.as_deref())
        .bind(transfer.session_uid.map(|uid| uid.to_string()))
        .bind(datetime_to_string(&transfer.started_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_transfer(&self, uid: Uuid) -> Result<Option<Transfer>> {
        let row = sqlx::query("SELECT * FROM Transfers WHERE uid = ?")
            .bind(uid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_transfer).transpose()?)
    }

    async fn get_transfer_for_pair(
        &self,
        pair_id: PairId,
        direction: TransferDirection,
    ) -> Result<Option<Transfer>> {
        let row = sqlx::query("SELECT * FROM Transfers WHERE pair_id = ? AND direction = ?")
            .bind(pair_id.get())
            .bind(direction.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_transfer).transpose()?)
    }

    async fn get_active_transfers(&self) -> Result<Vec<Transfer>> {
        let rows = sqlx::query(
            "SELECT * FROM Transfers WHERE status IN ('ongoing', 'paused', 'suspended') ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(row_to_transfer)
            .collect::<Result<Vec<_>, StoreError>>()
            .map_err(Into::into)
    }

    async fn set_transfer_status(&self, uid: Uuid, status: TransferStatus) -> Result<()> {
        sqlx::query("UPDATE Transfers SET status = ? WHERE uid = ?")
            .bind(status.as_str())
            .bind(uid.to_string())
            .execute(&self.pool)
            .await?;
        tracing::debug!(uid = %uid, status = %status, "Transfer status changed");
        Ok(())
    }

    async fn set_transfers_status(&self, from: &[TransferStatus], to: TransferStatus) -> Result<u64> {
        if from.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!("UPDATE Transfers SET status = ? WHERE status IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(to.as_str());
        for status in from {
            query = query.bind(status.as_str());
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn set_transfer_progress(&self, uid: Uuid, progress: u64) -> Result<()> {
        sqlx::query("UPDATE Transfers SET progress = ? WHERE uid = ?")
            .bind(progress as i64)
            .bind(uid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_transfer_batch(&self, uid: Uuid, batch_id: &str, chunk_size: u64) -> Result<()> {
        sqlx::query(
            "UPDATE Transfers SET batch_id = ?, chunk_size = ?, uploaded_chunks = '[]', progress = 0 WHERE uid = ?",
        )
        .bind(batch_id)
        .bind(chunk_size as i64)
        .bind(uid.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_uploaded_chunk(&self, uid: Uuid, index: u32, progress: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<String> =
            sqlx::query_scalar("SELECT uploaded_chunks FROM Transfers WHERE uid = ?")
                .bind(uid.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Ok(());
        };
        let mut chunks: Vec<u32> = serde_json::from_str(&current)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        if !chunks.contains(&index) {
            chunks.push(index);
            chunks.sort_unstable();
        }
        let encoded = serde_json::to_string(&chunks)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        sqlx::query("UPDATE Transfers SET uploaded_chunks = ?, progress = ? WHERE uid = ?")
            .bind(encoded)
            .bind(progress as i64)
            .bind(uid.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_transfer(&self, uid: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM Transfers WHERE uid = ?")
            .bind(uid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Sessions ---

    async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO Sessions (uid, description, status, uploaded, total, created_on, completed_on)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.uid.to_string())
        .bind(session.description.as_str())
        .bind(session.status.as_str())
        .bind(session.uploaded as i64)
        .bind(session.total as i64)
        .bind(datetime_to_string(&session.created_on))
        .bind(opt_datetime_to_string(&session.completed_on))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, uid: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM Sessions WHERE uid = ?")
            .bind(uid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_session).transpose()?)
    }

    async fn increase_session_uploaded(&self, uid: Uuid) -> Result<Option<Session>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE Sessions SET uploaded = uploaded + 1 WHERE uid = ?")
            .bind(uid.to_string())
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query("SELECT * FROM Sessions WHERE uid = ?")
            .bind(uid.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(mut session) = row.as_ref().map(row_to_session).transpose()? else {
            return Ok(None);
        };
        if session.is_complete() && session.status == TransferStatus::Ongoing {
            let now = Utc::now();
            sqlx::query("UPDATE Sessions SET status = 'done', completed_on = ? WHERE uid = ?")
                .bind(datetime_to_string(&now))
                .bind(uid.to_string())
                .execute(&mut *tx)
                .await?;
            session.status = TransferStatus::Done;
            session.completed_on = Some(now);
            tracing::info!(uid = %uid, total = session.total, "Transfer session completed");
        }
        tx.commit().await?;
        Ok(Some(session))
    }

    async fn set_session_status(&self, uid: Uuid, status: TransferStatus) -> Result<()> {
        sqlx::query("UPDATE Sessions SET status = ? WHERE uid = ?")
            .bind(status.as_str())
            .bind(uid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Maintenance ---

    async fn purge(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM Transfers",
            "DELETE FROM Sessions",
            "DELETE FROM States",
            "DELETE FROM Filters",
            "DELETE FROM Config WHERE name <> 'schema_version'",
        ] {
            sqlx::query(sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::info!("Engine database purged");
        Ok(())
    }
}
