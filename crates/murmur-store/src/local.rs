//! Local durable cache persister.
//!
//! Backs the in-memory store with a SQLite file so state survives process
//! restarts. The persister performs one initial load that merges the
//! on-disk rows into the (empty) in-memory defaults, then mirrors every
//! subsequent mutation. Initialization errors propagate to the caller and
//! block the "ready" status; auto-save errors after that point are logged
//! and do not disturb the in-memory store.

use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OpenFlags};
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::tables::{ChangeEvent, RawRow, TableKind, TableStore};

/// Pool handle for the local cache database.
pub type CachePool = Pool<SqliteConnectionManager>;

const CACHE_SCHEMA: &str = include_str!("sql/cache_init.sql");

/// Busy timeout for cache connections, in milliseconds.
const CACHE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Maximum number of pooled cache connections. Auto-save is a single task,
/// so the pool stays small.
const CACHE_POOL_MAX_SIZE: u32 = 4;

/// The SQLite-backed local cache persister.
pub struct LocalCachePersister {
    pool: CachePool,
}

impl LocalCachePersister {
    /// Opens (or creates) the cache database and ensures its schema.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the pool cannot be built or the schema
    /// statement fails.
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(flags)
            .with_init(|conn| {
                conn.execute_batch(&format!(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA busy_timeout = {CACHE_BUSY_TIMEOUT_MS};"
                ))
            });

        let pool = Pool::builder().max_size(CACHE_POOL_MAX_SIZE).build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch(CACHE_SCHEMA)?;
        }

        Ok(Self { pool })
    }

    /// Loads every cached row into the store. Returns the number of rows
    /// loaded.
    ///
    /// Must complete before [`start_auto_save`](Self::start_auto_save) so
    /// the initial load is not echoed back to disk out of order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on any read or deserialization failure; the
    /// component is not "ready" until this succeeds.
    pub async fn load_into(&self, store: &TableStore) -> Result<usize, StoreError> {
        let pool = self.pool.clone();
        let rows = tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare("SELECT table_name, row_id, row_json FROM cache_rows")?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;

        let mut loaded = 0usize;
        for (table_name, row_id, row_json) in rows {
            let Some(table) = TableKind::parse(&table_name) else {
                tracing::warn!(table = %table_name, "skipping cached row for unknown table");
                continue;
            };
            let row: RawRow = serde_json::from_str(&row_json)?;
            store.set_row(table, &row_id, row).await;
            loaded += 1;
        }

        tracing::info!(count = loaded, "loaded local cache into store");
        Ok(loaded)
    }

    /// Spawns the auto-save task: every store mutation is written through to
    /// the cache. Runs until the store (and with it the change feed) is
    /// dropped.
    pub fn start_auto_save(&self, store: &Arc<TableStore>) -> JoinHandle<()> {
        let mut rx = store.subscribe_changes();
        let pool = self.pool.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let pool = pool.clone();
                        let result = tokio::task::spawn_blocking(move || write_event(&pool, &event))
                            .await
                            .map_err(|e| StoreError::Task(e.to_string()))
                            .and_then(|r| r);
                        if let Err(e) = result {
                            tracing::error!("local cache auto-save failed: {}", e);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "local cache persister lagged behind mutations");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Writes one change event to the cache (upsert or delete).
fn write_event(pool: &CachePool, event: &ChangeEvent) -> Result<(), StoreError> {
    let conn = pool.get()?;
    match &event.row {
        Some(row) => {
            let row_json = serde_json::to_string(row)?;
            conn.execute(
                "INSERT INTO cache_rows (table_name, row_id, row_json, updated_at)
                 VALUES (?1, ?2, ?3, datetime('now'))
                 ON CONFLICT (table_name, row_id)
                 DO UPDATE SET row_json = excluded.row_json, updated_at = excluded.updated_at",
                params![event.table.as_str(), event.row_id, row_json],
            )?;
        }
        None => {
            conn.execute(
                "DELETE FROM cache_rows WHERE table_name = ?1 AND row_id = ?2",
                params![event.table.as_str(), event.row_id],
            )?;
        }
    }
    Ok(())
}
