//! Platform storage areas
//!
//! A storage area is the raw, synchronous key-value primitive that the
//! scoped adapters sit on top of. Two implementations are provided:
//!
//! - [`MemoryArea`]: shared in-process area. Every handle created with
//!   [`MemoryArea::context`] sees the same data and receives change events
//!   produced by the *other* handles, mirroring how a persistent browser
//!   store notifies sibling tabs.
//! - [`SqliteArea`]: durable area backed by a single SQLite table.
//!
//! Failures are reported as [`AreaError`], which carries a numeric code and a
//! name in the same shape the platform reports them.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Code and name reported by the platform for a full store
pub const QUOTA_EXCEEDED_CODE: u32 = 22;
pub const QUOTA_EXCEEDED_NAME: &str = "QuotaExceededError";

/// Buffered change events per subscriber
const EVENT_CAPACITY: usize = 64;

/// Error raised by a storage area
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct AreaError {
    /// Legacy numeric code, if the platform provides one
    pub code: Option<u32>,
    /// Error name
    pub name: String,
    /// Human readable message
    pub message: String,
}

impl AreaError {
    pub fn new(code: Option<u32>, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            message: message.into(),
        }
    }

    /// Error reported when a write does not fit
    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(Some(QUOTA_EXCEEDED_CODE), QUOTA_EXCEEDED_NAME, message)
    }
}

impl From<rusqlite::Error> for AreaError {
    fn from(error: rusqlite::Error) -> Self {
        match &error {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::DiskFull =>
            {
                AreaError::quota_exceeded(error.to_string())
            }
            rusqlite::Error::SqliteFailure(failure, _) => AreaError::new(
                Some(failure.extended_code as u32),
                format!("{:?}", failure.code),
                error.to_string(),
            ),
            _ => AreaError::new(None, "SqliteError", error.to_string()),
        }
    }
}

/// Change notification emitted to other contexts sharing an area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Changed key, `None` when the area was cleared
    pub key: Option<String>,
    pub old_value: Option<String>,
    /// New value, `None` when the key was removed
    pub new_value: Option<String>,
    /// Handle that made the change
    origin: Uuid,
}

/// Subscription to change events made by other handles of an area
pub struct StorageEvents {
    rx: broadcast::Receiver<StorageEvent>,
    origin: Uuid,
}

impl StorageEvents {
    /// Wait for the next foreign change
    ///
    /// Returns `None` once the area has been dropped.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.origin => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Storage event subscriber lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Raw synchronous key-value storage primitive
pub trait StorageArea: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, AreaError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), AreaError>;

    fn remove_item(&self, key: &str);

    fn clear(&self);

    fn keys(&self) -> Result<Vec<String>, AreaError>;

    /// Subscribe to changes made through other handles
    ///
    /// `None` when the area cannot notify (session areas, file areas).
    fn subscribe(&self) -> Option<StorageEvents> {
        None
    }
}

// ==================== Memory Area ====================

#[derive(Debug)]
struct SharedArea {
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
    events: broadcast::Sender<StorageEvent>,
}

/// In-process storage area shared between contexts
#[derive(Debug, Clone)]
pub struct MemoryArea {
    shared: Arc<SharedArea>,
    origin: Uuid,
}

impl Default for MemoryArea {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryArea {
    /// Create an unbounded area
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an area that rejects writes once keys and values exceed `bytes`
    pub fn with_quota(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(quota_bytes: Option<usize>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(SharedArea {
                entries: Mutex::new(BTreeMap::new()),
                quota_bytes,
                events,
            }),
            origin: Uuid::new_v4(),
        }
    }

    /// Another handle onto the same data, acting as a separate context
    pub fn context(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            origin: Uuid::new_v4(),
        }
    }

    /// Bytes currently used by keys and values
    pub fn used_bytes(&self) -> usize {
        self.lock().iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.shared.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, key: Option<&str>, old_value: Option<String>, new_value: Option<String>) {
        // No receivers is not an error
        let _ = self.shared.events.send(StorageEvent {
            key: key.map(str::to_string),
            old_value,
            new_value,
            origin: self.origin,
        });
    }
}

impl StorageArea for MemoryArea {
    fn get_item(&self, key: &str) -> Result<Option<String>, AreaError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), AreaError> {
        let old_value = {
            let mut entries = self.lock();

            if let Some(quota) = self.shared.quota_bytes {
                let used: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
                let replaced = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
                let needed = used - replaced + key.len() + value.len();
                if needed > quota {
                    return Err(AreaError::quota_exceeded(format!(
                        "Setting '{}' would use {} of {} bytes",
                        key, needed, quota
                    )));
                }
            }

            entries.insert(key.to_string(), value.to_string())
        };

        if old_value.as_deref() != Some(value) {
            self.emit(Some(key), old_value, Some(value.to_string()));
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        let old_value = self.lock().remove(key);
        if old_value.is_some() {
            self.emit(Some(key), old_value, None);
        }
    }

    fn clear(&self) {
        let was_empty = {
            let mut entries = self.lock();
            let was_empty = entries.is_empty();
            entries.clear();
            was_empty
        };
        if !was_empty {
            self.emit(None, None, None);
        }
    }

    fn keys(&self) -> Result<Vec<String>, AreaError> {
        Ok(self.lock().keys().cloned().collect())
    }

    fn subscribe(&self) -> Option<StorageEvents> {
        Some(StorageEvents {
            rx: self.shared.events.subscribe(),
            origin: self.origin,
        })
    }
}

// ==================== SQLite Area ====================

/// Durable storage area in a single SQLite table
pub struct SqliteArea {
    conn: Mutex<Connection>,
}

impl SqliteArea {
    /// Open or create the area at `path`
    pub fn open(path: &Path) -> Result<Self, AreaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AreaError::new(None, "IoError", format!("{:?}: {}", parent, e))
            })?;
        }

        let conn = Connection::open(path)?;
        debug!("Opened storage area at {:?}", path);
        Self::init(conn)
    }

    /// Open an in-memory area (for testing)
    pub fn open_in_memory() -> Result<Self, AreaError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Cap the database size, writes beyond it fail with a quota error
    pub fn with_max_pages(self, pages: u32) -> Result<Self, AreaError> {
        self.lock()
            .execute_batch(&format!("PRAGMA max_page_count = {};", pages))?;
        Ok(self)
    }

    fn init(conn: Connection) -> Result<Self, AreaError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageArea for SqliteArea {
    fn get_item(&self, key: &str) -> Result<Option<String>, AreaError> {
        let value = self
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), AreaError> {
        self.lock().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        if let Err(e) = self.lock().execute("DELETE FROM kv WHERE key = ?1", params![key]) {
            warn!("Failed to remove '{}' from storage area: {}", key, e);
        }
    }

    fn clear(&self) {
        if let Err(e) = self.lock().execute("DELETE FROM kv", []) {
            warn!("Failed to clear storage area: {}", e);
        }
    }

    fn keys(&self) -> Result<Vec<String>, AreaError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_area_shares_data_between_contexts() {
        let tab_a = MemoryArea::new();
        let tab_b = tab_a.context();

        tab_a.set_item("k", "v").unwrap();
        assert_eq!(tab_b.get_item("k").unwrap().as_deref(), Some("v"));

        tab_b.remove_item("k");
        assert!(tab_a.get_item("k").unwrap().is_none());
    }

    #[test]
    fn test_memory_area_quota() {
        let area = MemoryArea::with_quota(10);

        area.set_item("ab", "cdef").unwrap();
        assert_eq!(area.used_bytes(), 6);

        let err = area.set_item("xy", "0123456").unwrap_err();
        assert_eq!(err.code, Some(QUOTA_EXCEEDED_CODE));
        assert_eq!(err.name, QUOTA_EXCEEDED_NAME);

        // Replacing an existing value only counts the difference
        area.set_item("ab", "cdefghij").unwrap();
        assert_eq!(area.used_bytes(), 10);
    }

    #[tokio::test]
    async fn test_memory_area_events_skip_own_context() {
        let tab_a = MemoryArea::new();
        let tab_b = tab_a.context();

        let mut a_events = tab_a.subscribe().unwrap();
        let mut b_events = tab_b.subscribe().unwrap();

        tab_a.set_item("k", "1").unwrap();
        tab_b.set_item("k", "2").unwrap();

        let seen_by_b = b_events.recv().await.unwrap();
        assert_eq!(seen_by_b.key.as_deref(), Some("k"));
        assert_eq!(seen_by_b.new_value.as_deref(), Some("1"));

        let seen_by_a = a_events.recv().await.unwrap();
        assert_eq!(seen_by_a.old_value.as_deref(), Some("1"));
        assert_eq!(seen_by_a.new_value.as_deref(), Some("2"));
    }

    #[test]
    fn test_sqlite_area_roundtrip_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("area.db");

        {
            let area = SqliteArea::open(&path).unwrap();
            area.set_item("b", "2").unwrap();
            area.set_item("a", "1").unwrap();
            area.set_item("a", "one").unwrap();
        }

        let area = SqliteArea::open(&path).unwrap();
        assert_eq!(area.get_item("a").unwrap().as_deref(), Some("one"));
        assert_eq!(area.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);

        area.remove_item("a");
        assert!(area.get_item("a").unwrap().is_none());

        area.clear();
        assert!(area.keys().unwrap().is_empty());
        assert!(area.subscribe().is_none());
    }

    #[test]
    fn test_sqlite_area_full_maps_to_quota() {
        let area = SqliteArea::open_in_memory()
            .unwrap()
            .with_max_pages(4)
            .unwrap();

        let big = "x".repeat(256 * 1024);
        let err = area.set_item("big", &big).unwrap_err();

        assert_eq!(err.code, Some(QUOTA_EXCEEDED_CODE));
        assert_eq!(err.name, QUOTA_EXCEEDED_NAME);
    }
}
