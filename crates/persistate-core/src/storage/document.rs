//! Asynchronous document store adapter
//!
//! Stores values in one named database and one named object store, realised
//! as a SQLite file and a table inside it. The connection is opened lazily on
//! first use and memoized for the adapter's lifetime; concurrent first callers
//! share a single open attempt. Every operation runs as exactly one
//! transaction on the blocking pool.
//!
//! Operations on the same key pass through a FIFO queue so that, of two
//! writes in flight, the later-issued one is the one left on disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, warn};

use super::adapter::StorageAdapter;
use super::error::{QuotaExceededError, StorageError, StorageResult};

type SharedConnection = Arc<Mutex<Connection>>;

/// Where and under which names the document store lives
#[derive(Debug, Clone)]
pub struct DocumentStoreOptions {
    /// Directory holding the database file, `None` for an in-memory database
    pub dir: Option<PathBuf>,
    /// Database name
    pub database: String,
    /// Object store name inside the database
    pub store: String,
    /// Size cap in pages, writes beyond it fail with a quota error
    pub max_pages: Option<u32>,
}

impl DocumentStoreOptions {
    pub fn new(dir: impl Into<PathBuf>, database: &str, store: &str) -> Self {
        Self {
            dir: Some(dir.into()),
            database: database.to_string(),
            store: store.to_string(),
            max_pages: None,
        }
    }

    /// In-memory database (for testing)
    pub fn in_memory(database: &str, store: &str) -> Self {
        Self {
            dir: None,
            database: database.to_string(),
            store: store.to_string(),
            max_pages: None,
        }
    }

    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = Some(pages);
        self
    }

    /// Path of the database file
    pub fn database_path(&self) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.db", self.database)))
    }

    fn table(&self) -> String {
        format!("\"{}\"", self.store.replace('"', "\"\""))
    }
}

/// Per-key FIFO queue
///
/// Holding a slot grants exclusive access to one key. Slots are handed out
/// in the order they were requested.
#[derive(Debug, Default)]
pub struct KeyedQueue {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            // Drop slots nobody holds or waits on
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(key.to_string()).or_default())
        };
        slot.lock_owned().await
    }

    /// Number of keys currently held or awaited
    pub fn active_keys(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .values()
            .filter(|slot| Arc::strong_count(slot) > 1)
            .count()
    }
}

/// Adapter over an asynchronous document store
pub struct DocumentStoreAdapter {
    options: DocumentStoreOptions,
    conn: OnceCell<SharedConnection>,
    queue: KeyedQueue,
    open_attempts: AtomicUsize,
}

impl DocumentStoreAdapter {
    pub fn new(options: DocumentStoreOptions) -> Self {
        Self {
            options,
            conn: OnceCell::new(),
            queue: KeyedQueue::new(),
            open_attempts: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &DocumentStoreOptions {
        &self.options
    }

    /// Whether the connection has been opened
    pub fn is_open(&self) -> bool {
        self.conn.initialized()
    }

    /// How many times opening the database was attempted
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    /// Get the memoized connection, opening it on first use
    async fn connection(&self) -> StorageResult<SharedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.open_attempts.fetch_add(1, Ordering::SeqCst);
                let options = self.options.clone();
                tokio::task::spawn_blocking(move || open_database(&options))
                    .await
                    .map_err(StorageError::from)
                    .and_then(|opened| opened)
            })
            .await?;
        Ok(Arc::clone(conn))
    }

    /// Run `op` inside one transaction
    ///
    /// When `key` is given the key's queue slot is held until the
    /// transaction has finished, even if the caller stops waiting.
    async fn transact<R, F>(&self, key: Option<&str>, op: F) -> StorageResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&Transaction<'_>, &str) -> rusqlite::Result<R> + Send + 'static,
    {
        let conn = self.connection().await?;
        let slot = match key {
            Some(key) => Some(self.queue.acquire(key).await),
            None => None,
        };
        let table = self.options.table();

        let result = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let tx = conn.transaction()?;
            let value = op(&tx, &table)?;
            tx.commit()?;
            Ok::<R, rusqlite::Error>(value)
        })
        .await?;

        Ok(result?)
    }

    async fn read(&self, key: &str) -> StorageResult<Option<String>> {
        let owned = key.to_string();
        self.transact(Some(key), move |tx, table| {
            tx.query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", table),
                params![owned],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        let attempted_size_bytes = value.len();
        let (owned_key, owned_value) = (key.to_string(), value.to_string());

        let result = self
            .transact(Some(key), move |tx, table| {
                tx.execute(
                    &format!(
                        "INSERT INTO {} (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        table
                    ),
                    params![owned_key, owned_value],
                )
                .map(|_| ())
            })
            .await;

        match result {
            Err(StorageError::Database(e)) if is_disk_full(&e) => Err(StorageError::QuotaExceeded(
                QuotaExceededError::new(key, attempted_size_bytes),
            )),
            other => other,
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let owned = key.to_string();
        self.transact(Some(key), move |tx, table| {
            tx.execute(&format!("DELETE FROM {} WHERE key = ?1", table), params![owned])
                .map(|_| ())
        })
        .await
    }

    async fn delete_all(&self) -> StorageResult<()> {
        self.transact(None, |tx, table| {
            tx.execute(&format!("DELETE FROM {}", table), []).map(|_| ())
        })
        .await
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        self.transact(None, |tx, table| {
            let mut stmt = tx.prepare(&format!("SELECT key FROM {} ORDER BY key", table))?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })
        .await
    }
}

impl StorageAdapter for DocumentStoreAdapter {
    fn name(&self) -> &'static str {
        "document"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        async move {
            match self.read(key).await {
                Ok(value) => value,
                Err(e) => {
                    warn!("Document store read of '{}' failed: {}", key, e);
                    None
                }
            }
        }
        .boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        self.write(key, value).boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        async move {
            if let Err(e) = self.delete(key).await {
                warn!("Document store remove of '{}' failed: {}", key, e);
            }
        }
        .boxed()
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        async move {
            if let Err(e) = self.delete_all().await {
                warn!("Document store clear failed: {}", e);
            }
        }
        .boxed()
    }

    fn keys(&self) -> BoxFuture<'_, Option<Vec<String>>> {
        async move {
            match self.list_keys().await {
                Ok(keys) => Some(keys),
                Err(e) => {
                    warn!("Document store could not list keys: {}", e);
                    None
                }
            }
        }
        .boxed()
    }
}

/// Open the database and make sure the object store exists
fn open_database(options: &DocumentStoreOptions) -> StorageResult<SharedConnection> {
    let conn = match options.database_path() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            debug!("Opening document store {:?}", path);
            Connection::open(&path)?
        }
        None => Connection::open_in_memory()?,
    };

    if let Some(pages) = options.max_pages {
        conn.execute_batch(&format!("PRAGMA max_page_count = {};", pages))?;
    }

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
        options.table()
    ))?;

    Ok(Arc::new(Mutex::new(conn)))
}

fn is_disk_full(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == rusqlite::ErrorCode::DiskFull
    )
}
