//! Scoped synchronous adapters
//!
//! Wraps a [`StorageArea`] and namespaces every key with a prefix so several
//! stores can share one area without trampling each other. The persistent
//! and session flavours differ only in which area they are given and the
//! name they report; both run capacity failures through [`is_quota_error`].

use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use tracing::warn;

use super::adapter::StorageAdapter;
use super::area::{AreaError, StorageArea, QUOTA_EXCEEDED_NAME};
use super::error::{QuotaExceededError, StorageError, StorageResult};

/// Codes the platform uses for a full store
const QUOTA_CODES: [u32; 2] = [22, 1014];

/// Names the platform uses for a full store
const QUOTA_NAMES: [&str; 2] = [QUOTA_EXCEEDED_NAME, "NS_ERROR_DOM_QUOTA_REACHED"];

/// Check whether an area error means the store is full
pub fn is_quota_error(error: &AreaError) -> bool {
    error.code.is_some_and(|code| QUOTA_CODES.contains(&code))
        || QUOTA_NAMES.contains(&error.name.as_str())
}

/// A storage area restricted to keys under one prefix
#[derive(Clone)]
pub struct ScopedArea {
    area: Arc<dyn StorageArea>,
    prefix: String,
}

impl ScopedArea {
    pub fn new(area: Arc<dyn StorageArea>, prefix: impl Into<String>) -> Self {
        Self {
            area,
            prefix: prefix.into(),
        }
    }

    /// The underlying area
    pub fn area(&self) -> &Arc<dyn StorageArea> {
        &self.area
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn get(&self, adapter: &'static str, key: &str) -> Option<String> {
        match self.area.get_item(&self.full_key(key)) {
            Ok(value) => value,
            Err(e) => {
                warn!("{} storage read of '{}' failed: {}", adapter, key, e);
                None
            }
        }
    }

    fn set(&self, adapter: &'static str, key: &str, value: &str) -> StorageResult<()> {
        self.area
            .set_item(&self.full_key(key), value)
            .map_err(|e| {
                if is_quota_error(&e) {
                    StorageError::QuotaExceeded(QuotaExceededError::new(key, value.len()))
                } else {
                    StorageError::Backend {
                        adapter,
                        key: key.to_string(),
                        details: e.to_string(),
                    }
                }
            })
    }

    fn remove(&self, key: &str) {
        self.area.remove_item(&self.full_key(key));
    }

    fn scoped_keys(&self, adapter: &'static str) -> Vec<String> {
        match self.area.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!("{} storage could not list keys: {}", adapter, e);
                Vec::new()
            }
        }
    }

    fn clear(&self, adapter: &'static str) {
        if self.prefix.is_empty() {
            self.area.clear();
            return;
        }
        for key in self.scoped_keys(adapter) {
            self.remove(&key);
        }
    }
}

/// Which platform area an adapter is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaKind {
    /// Survives restarts, shared by every context
    Persistent,
    /// Lives as long as one context
    Session,
}

impl AreaKind {
    fn label(self) -> &'static str {
        match self {
            AreaKind::Persistent => "local",
            AreaKind::Session => "session",
        }
    }
}

/// Synchronous adapter over a prefixed storage area
#[derive(Clone)]
pub struct ScopedStorageAdapter {
    scope: ScopedArea,
    kind: AreaKind,
}

impl ScopedStorageAdapter {
    /// Adapter over the persistent area
    pub fn persistent(area: Arc<dyn StorageArea>, prefix: impl Into<String>) -> Self {
        Self {
            scope: ScopedArea::new(area, prefix),
            kind: AreaKind::Persistent,
        }
    }

    /// Adapter over a session area
    pub fn session(area: Arc<dyn StorageArea>, prefix: impl Into<String>) -> Self {
        Self {
            scope: ScopedArea::new(area, prefix),
            kind: AreaKind::Session,
        }
    }

    pub fn kind(&self) -> AreaKind {
        self.kind
    }

    pub fn scope(&self) -> &ScopedArea {
        &self.scope
    }
}

impl StorageAdapter for ScopedStorageAdapter {
    fn name(&self) -> &'static str {
        self.kind.label()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        future::ready(self.scope.get(self.name(), key)).boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        future::ready(self.scope.set(self.name(), key, value)).boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        self.scope.remove(key);
        future::ready(()).boxed()
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        self.scope.clear(self.name());
        future::ready(()).boxed()
    }

    fn keys(&self) -> BoxFuture<'_, Option<Vec<String>>> {
        future::ready(Some(self.scope.scoped_keys(self.name()))).boxed()
    }
}
