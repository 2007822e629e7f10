//! Cross-context state sync
//!
//! Each store with sync enabled owns a [`SyncEngine`] bound to a named
//! channel. After a local commit settles, the engine publishes the full
//! state; engines on the same channel apply it key by key.
//!
//! ## Transports
//!
//! - Broadcast channel through a [`BroadcastHub`] (preferred)
//! - Change events of a shared storage area (fallback)

mod engine;
mod message;
mod transport;

pub use engine::{
    StateTarget, SyncEngine, SyncOptions, CHANNEL_PREFIX, DEFAULT_SYNC_DEBOUNCE,
};
pub use message::SyncMessage;
pub use transport::{
    sync_key, BroadcastChannel, BroadcastHub, Inbox, StorageEventTransport, Transport,
    TransportError, TransportKind,
};
