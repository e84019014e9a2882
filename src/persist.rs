// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable replica backed by SQLite.
//!
//! Mirrors entities and the watermark to disk so a client that restarts
//! resumes catch-up from where it left off instead of from version 0.
//!
//! # Lifecycle
//!
//! ```text
//! new(path)   → no I/O, every call fails with Uninitialized
//! init()      → open pool, create tables (idempotent)
//! ...         → normal operation
//! close()     → checkpoint WAL, close pool
//! ```
//!
//! # Schema
//!
//! ```text
//! entities (key TEXT PK "type::id", entity_type, entity_id, version, data JSON)
//! watermark (id = 0, version, updated_at)
//! ```
//!
//! # Atomic Apply
//!
//! `apply_changes` writes updates, deletes and the watermark inside one
//! transaction. A crash mid-apply leaves the previous watermark in place, and
//! the next catch-up re-sends the same delta (apply is idempotent).
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with bounded exponential backoff.
//! Entities are serialized before the retry loop so a retry never re-encodes.

use crate::config::{ReplicaBackend, ReplicaConfig};
use crate::error::{ReplicationError, Result};
use crate::protocol::ChangeSet;
use crate::reference::{EntityKey, Reference, Version};
use crate::replica::{MemoryReplicaStore, ReplicaStore};
use crate::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Path that selects a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const UPSERT_ENTITY: &str = r#"
    INSERT INTO entities (key, entity_type, entity_id, version, data)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT(key) DO UPDATE SET
        version = excluded.version,
        data = excluded.data
"#;

const UPSERT_WATERMARK: &str = r#"
    INSERT INTO watermark (id, version, updated_at)
    VALUES (0, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        version = excluded.version,
        updated_at = excluded.updated_at
"#;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::replica_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

fn to_db_version(version: Version) -> Result<i64> {
    i64::try_from(version).map_err(|_| ReplicationError::Internal(format!("Version {} exceeds SQLite range", version)))
}

fn from_db_version(version: i64) -> Result<Version> {
    Version::try_from(version).map_err(|_| ReplicationError::Internal(format!("Negative version {} in replica", version)))
}

/// An entity encoded for storage.
struct EntityRow {
    key: String,
    entity_type: String,
    entity_id: String,
    version: i64,
    data: String,
}

impl EntityRow {
    fn encode<R: Reference>(reference: &R) -> Result<Self> {
        Ok(Self {
            key: reference.key().to_string(),
            entity_type: reference.entity_type().to_string(),
            entity_id: reference.id().to_string(),
            version: to_db_version(reference.version())?,
            data: serde_json::to_string(reference)?,
        })
    }
}

async fn write_rows(
    tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
    rows: &[EntityRow],
) -> std::result::Result<(), sqlx::Error> {
    for row in rows {
        sqlx::query(UPSERT_ENTITY)
            .bind(&row.key)
            .bind(&row.entity_type)
            .bind(&row.entity_id)
            .bind(row.version)
            .bind(&row.data)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Replica persisted in a SQLite database.
pub struct SqliteReplicaStore<R> {
    pool: OnceCell<SqlitePool>,
    path: String,
    wal_mode: bool,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Reference> SqliteReplicaStore<R> {
    /// Describe a replica at `path`. Nothing is opened until [`init`](ReplicaStore::init).
    ///
    /// Pass [`MEMORY_PATH`] for a private in-memory database.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            pool: OnceCell::new(),
            path: path.as_ref().to_string_lossy().to_string(),
            wal_mode: true,
            _marker: PhantomData,
        }
    }

    /// Toggle WAL journaling (ignored for in-memory databases).
    pub fn with_wal(mut self, wal_mode: bool) -> Self {
        self.wal_mode = wal_mode;
        self
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_initialized(&self) -> bool {
        self.pool.initialized()
    }

    fn is_memory(&self) -> bool {
        self.path == MEMORY_PATH
    }

    fn pool(&self) -> Result<&SqlitePool> {
        self.pool
            .get()
            .ok_or_else(|| ReplicationError::uninitialized(format!("sqlite replica at {}", self.path)))
    }

    async fn connect(&self) -> Result<SqlitePool> {
        info!(path = %self.path, wal = self.wal_mode, "Opening SQLite replica");

        if self.is_memory() {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            // Each connection would get its own database; keep exactly one alive.
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?;
            return Ok(pool);
        }

        let journal = if self.wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", self.path))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Ok(pool)
    }

    /// Number of stored entities.
    pub async fn entity_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(self.pool()?)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = self.pool()?;
        execute_with_retry("replica_checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool. No-op if never initialized.
    pub async fn close(&self) {
        let Some(pool) = self.pool.get() else {
            return;
        };
        if self.wal_mode && !self.is_memory() {
            if let Err(e) = self.checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        pool.close().await;
        info!(path = %self.path, "SQLite replica closed");
    }

    async fn read_version(&self) -> Result<Version> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM watermark WHERE id = 0")
            .fetch_optional(self.pool()?)
            .await?;
        version.map_or(Ok(0), from_db_version)
    }

    async fn write_version(&self, version: Version) -> Result<()> {
        let pool = self.pool()?;
        let version = to_db_version(version)?;
        let now = chrono::Utc::now().timestamp_millis();

        execute_with_retry("replica_set_version", || async move {
            sqlx::query(UPSERT_WATERMARK).bind(version).bind(now).execute(pool).await
        })
        .await?;
        Ok(())
    }

    async fn apply(&self, changes: ChangeSet<R>) -> Result<()> {
        let pool = self.pool()?;
        let rows = changes.update.iter().map(EntityRow::encode).collect::<Result<Vec<_>>>()?;
        let deletes: Vec<String> = changes.delete.iter().map(|r| r.key().to_string()).collect();
        let version = to_db_version(changes.version)?;
        let now = chrono::Utc::now().timestamp_millis();
        let (rows, deletes) = (&rows, &deletes);

        execute_with_retry("replica_apply", || async move {
            let mut tx = pool.begin().await?;
            write_rows(&mut tx, rows).await?;
            for key in deletes {
                sqlx::query("DELETE FROM entities WHERE key = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query(UPSERT_WATERMARK)
                .bind(version)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        })
        .await?;

        debug!(
            version = changes.version,
            updated = rows.len(),
            deleted = deletes.len(),
            "Applied changes to SQLite replica"
        );
        crate::metrics::record_replica_apply("sqlite", rows.len(), deletes.len());
        crate::metrics::set_replica_watermark("sqlite", changes.version);
        Ok(())
    }

    async fn write_entities(&self, references: &[R]) -> Result<()> {
        let pool = self.pool()?;
        let rows = references.iter().map(EntityRow::encode).collect::<Result<Vec<_>>>()?;
        let rows = &rows;

        execute_with_retry("replica_put", || async move {
            let mut tx = pool.begin().await?;
            write_rows(&mut tx, rows).await?;
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    async fn read_all(&self, from_version: Version) -> Result<Vec<R>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT data FROM entities WHERE version >= ? ORDER BY key")
            .bind(to_db_version(from_version)?)
            .fetch_all(self.pool()?)
            .await?;
        rows.into_iter()
            .map(|(data,)| serde_json::from_str(&data).map_err(ReplicationError::from))
            .collect()
    }

    async fn read_one(&self, key: &EntityKey) -> Result<Option<R>> {
        let data: Option<String> = sqlx::query_scalar("SELECT data FROM entities WHERE key = ?")
            .bind(key.to_string())
            .fetch_optional(self.pool()?)
            .await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }
}

impl<R: Reference> ReplicaStore<R> for SqliteReplicaStore<R> {
    fn init(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let pool = self.pool.get_or_try_init(|| self.connect()).await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS entities (
                    key TEXT PRIMARY KEY,
                    entity_type TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    data TEXT NOT NULL
                )
                "#,
            )
            .execute(pool)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS watermark (
                    id INTEGER PRIMARY KEY CHECK (id = 0),
                    version INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
            )
            .execute(pool)
            .await?;

            let version = self.read_version().await?;
            if version > 0 {
                info!(path = %self.path, version, "Restored replica watermark from previous run");
            }
            Ok(())
        })
    }

    fn get_version(&self) -> BoxFuture<'_, Version> {
        Box::pin(self.read_version())
    }

    fn set_version(&self, version: Version) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.write_version(version).await?;
            crate::metrics::set_replica_watermark("sqlite", version);
            Ok(())
        })
    }

    fn apply_changes(&self, changes: ChangeSet<R>) -> BoxFuture<'_, ()> {
        Box::pin(self.apply(changes))
    }

    fn put(&self, reference: R) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.write_entities(std::slice::from_ref(&reference)).await })
    }

    fn put_many(&self, references: Vec<R>) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.write_entities(&references).await })
    }

    fn get_all(&self, from_version: Version) -> BoxFuture<'_, Vec<R>> {
        Box::pin(self.read_all(from_version))
    }

    fn get_one(&self, key: &EntityKey) -> BoxFuture<'_, Option<R>> {
        let key = key.clone();
        Box::pin(async move { self.read_one(&key).await })
    }
}

/// Build the replica backend selected by `config`. The store still needs
/// [`init`](ReplicaStore::init).
pub fn replica_from_config<R: Reference>(config: &ReplicaConfig) -> Result<Arc<dyn ReplicaStore<R>>> {
    match config.backend {
        ReplicaBackend::Memory => Ok(Arc::new(MemoryReplicaStore::new())),
        ReplicaBackend::Sqlite => {
            let path = config
                .sqlite_path
                .as_ref()
                .ok_or_else(|| ReplicationError::Config("sqlite backend requires sqlite_path".to_string()))?;
            Ok(Arc::new(SqliteReplicaStore::new(path).with_wal(config.wal_mode)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::Record;
    use tempfile::tempdir;

    fn user(id: &str, version: Version) -> Record {
        Record::new("user", id).with("name", format!("user {}", id)).stamped(version)
    }

    async fn memory_store() -> SqliteReplicaStore<Record> {
        let store = SqliteReplicaStore::new(MEMORY_PATH);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_calls_before_init_are_uninitialized() {
        let store = SqliteReplicaStore::<Record>::new(MEMORY_PATH);
        assert!(!store.is_initialized());

        let err = store.get_version().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Uninitialized(_)));
        let err = store.put(user("1", 1)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Uninitialized(_)));
        let err = store.apply_changes(ChangeSet::empty(1)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Uninitialized(_)));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let store = memory_store().await;
        store.put(user("1", 1)).await.unwrap();
        store.init().await.unwrap();

        assert_eq!(store.entity_count().await.unwrap(), 1);
        assert_eq!(store.get_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apply_changes_sets_watermark() {
        let store = memory_store().await;
        store
            .apply_changes(ChangeSet {
                version: 3,
                update: vec![user("1", 1), user("2", 2)],
                delete: vec![],
            })
            .await
            .unwrap();
        store
            .apply_changes(ChangeSet {
                version: 4,
                update: vec![],
                delete: vec![user("1", 4)],
            })
            .await
            .unwrap();

        assert_eq!(store.get_version().await.unwrap(), 4);
        let all = store.get_all(0).await.unwrap();
        assert_eq!(all, vec![user("2", 2)]);
    }

    #[tokio::test]
    async fn test_apply_update_before_delete() {
        let store = memory_store().await;
        store
            .apply_changes(ChangeSet {
                version: 2,
                update: vec![user("1", 1)],
                delete: vec![user("1", 2)],
            })
            .await
            .unwrap();

        assert!(store.get_one(&EntityKey::new("user", "1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_all_filters_by_version() {
        let store = memory_store().await;
        store.put_many(vec![user("1", 1), user("2", 5)]).await.unwrap();

        assert_eq!(store.get_all(0).await.unwrap().len(), 2);
        let recent = store.get_all(2).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "2");
    }

    #[tokio::test]
    async fn test_put_overwrites_and_keeps_watermark() {
        let store = memory_store().await;
        store.set_version(7).await.unwrap();
        store.put(user("1", 1)).await.unwrap();
        store.put(Record::new("user", "1").with("name", "renamed").stamped(6)).await.unwrap();

        let current = store.get_one(&EntityKey::new("user", "1")).await.unwrap().unwrap();
        assert_eq!(current.version, 6);
        assert_eq!(current.get("name"), Some(&serde_json::json!("renamed")));
        assert_eq!(store.get_version().await.unwrap(), 7);
        assert_eq!(store.entity_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_version_accepts_out_of_order() {
        let store = memory_store().await;
        store.set_version(5).await.unwrap();
        store.set_version(2).await.unwrap();
        assert_eq!(store.get_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("replica.db");

        {
            let store = SqliteReplicaStore::<Record>::new(&db_path);
            store.init().await.unwrap();
            store
                .apply_changes(ChangeSet {
                    version: 9,
                    update: vec![user("1", 8), user("2", 9)],
                    delete: vec![],
                })
                .await
                .unwrap();
            store.close().await;
        }

        let reopened = SqliteReplicaStore::<Record>::new(&db_path);
        reopened.init().await.unwrap();
        assert_eq!(reopened.get_version().await.unwrap(), 9);
        assert_eq!(reopened.get_all(0).await.unwrap(), vec![user("1", 8), user("2", 9)]);
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_close_without_init_is_noop() {
        let store = SqliteReplicaStore::<Record>::new(MEMORY_PATH);
        store.close().await;
        assert!(!store.is_initialized());
    }

    #[test]
    fn test_replica_from_config() {
        let memory = replica_from_config::<Record>(&ReplicaConfig::in_memory());
        assert!(memory.is_ok());

        let missing_path = ReplicaConfig {
            backend: ReplicaBackend::Sqlite,
            sqlite_path: None,
            wal_mode: true,
        };
        let err = replica_from_config::<Record>(&missing_path).err().unwrap();
        assert!(matches!(err, ReplicationError::Config(_)));
    }
}
