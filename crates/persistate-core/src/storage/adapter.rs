//! Storage adapter contract
//!
//! Every backend exposes the same string-keyed interface. Adapters may be
//! synchronous or asynchronous underneath; the trait is expressed with boxed
//! futures so both kinds can sit behind `Arc<dyn StorageAdapter>`.
//!
//! Failure policy shared by all adapters:
//! - reads never fail, a backend error is logged and reported as `None`
//! - writes surface [`StorageError`], capacity failures as
//!   [`StorageError::QuotaExceeded`]
//! - remove and clear are best-effort and never fail

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::future::{self, BoxFuture, FutureExt};

use super::error::StorageResult;

/// Uniform get/set/remove/clear contract over a key-value backend
pub trait StorageAdapter: Send + Sync {
    /// Short adapter name used in logs and errors
    fn name(&self) -> &'static str;

    /// Read a value, `None` when missing or unreadable
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>>;

    /// Write a value
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, StorageResult<()>>;

    /// Remove a value
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()>;

    /// Remove every value owned by this adapter
    fn clear(&self) -> BoxFuture<'_, ()>;

    /// List keys, `None` when the backend cannot enumerate
    fn keys(&self) -> BoxFuture<'_, Option<Vec<String>>> {
        future::ready(None).boxed()
    }
}

/// In-memory adapter
///
/// Always available. Used when no platform storage exists and in tests.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map is still a valid map
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        future::ready(self.lock().get(key).cloned()).boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        self.lock().insert(key.to_string(), value.to_string());
        future::ready(Ok(())).boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        self.lock().remove(key);
        future::ready(()).boxed()
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        self.lock().clear();
        future::ready(()).boxed()
    }

    fn keys(&self) -> BoxFuture<'_, Option<Vec<String>>> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        future::ready(Some(keys)).boxed()
    }
}
