//! Persistate Core Library
//!
//! Persistence, cross-context sync and undo/redo history for observable
//! JSON state stores.
//!
//! # Architecture
//!
//! A [`Store`] calls its commit hooks after every change. Three engines
//! observe those commits independently:
//!
//! - **Persistence**: debounced, versioned and optionally compressed writes
//!   to a pluggable [`StorageAdapter`]
//! - **Sync**: debounced broadcast of the full state to other contexts on
//!   the same channel, with echo suppression on the receiving side
//! - **History**: a bounded undo/redo timeline with batching
//!
//! # Quick Start
//!
//! ```text
//! let adapter = Arc::new(MemoryAdapter::new());
//! let store = Store::builder("todos", json!({"items": []}))
//!     .persist(PersistOptions::new("todos", adapter))
//!     .sync(SyncOptions::default())
//!     .history(HistoryOptions::default())
//!     .open()
//!     .await;
//!
//! store.set("filter", json!("done"), Some("filter"));
//! store.undo();
//! store.flush().await;
//! ```
//!
//! # Modules
//!
//! - `store`: Observable store and builder (main entry point)
//! - `storage`: Storage adapters and areas
//! - `codec`: Versioned envelopes, migrations and compression
//! - `persistence`: Debounced persistence pipeline
//! - `sync`: Cross-context sync engine and transports
//! - `history`: Undo/redo timeline
//! - `hooks`: Commit observers
//! - `config`: Library configuration

pub mod codec;
pub mod config;
pub mod debounce;
pub mod history;
pub mod hooks;
pub mod persistence;
pub mod storage;
pub mod store;
pub mod sync;

pub use codec::{Codec, CodecError, Compressor, Envelope, JsonCodec, Migrations};
pub use config::{Backend, Config};
pub use history::{HistoryEntry, HistoryManager, HistoryOptions, BATCH_ACTION};
pub use hooks::{Commit, CommitHooks, CommitObserver, ObserverId};
pub use persistence::{PersistOptions, PersistencePipeline};
pub use storage::{
    DocumentStoreAdapter, DocumentStoreOptions, MemoryAdapter, MemoryArea, QuotaExceededError,
    ScopedStorageAdapter, SqliteArea, StorageAdapter, StorageArea, StorageError,
};
pub use store::{Store, StoreBuilder};
pub use sync::{BroadcastHub, SyncEngine, SyncMessage, SyncOptions, TransportError, TransportKind};
