//! Storage layer
//!
//! Uniform get/set/remove/clear contract over heterogeneous backends.
//!
//! ## Adapters
//!
//! - **memory**: always available, used when no platform storage exists
//! - **local** / **session**: prefixed views over a synchronous [`StorageArea`]
//! - **document**: asynchronous store, one SQLite file and table, opened lazily
//!
//! Reads degrade to `None`, writes surface [`StorageError`], and capacity
//! failures are always reported as [`QuotaExceededError`].

pub mod adapter;
pub mod area;
pub mod document;
pub mod error;
pub mod scoped;

pub use adapter::{MemoryAdapter, StorageAdapter};
pub use area::{AreaError, MemoryArea, SqliteArea, StorageArea, StorageEvent, StorageEvents};
pub use document::{DocumentStoreAdapter, DocumentStoreOptions, KeyedQueue};
pub use error::{QuotaExceededError, StorageError, StorageResult};
pub use scoped::{is_quota_error, AreaKind, ScopedArea, ScopedStorageAdapter};
