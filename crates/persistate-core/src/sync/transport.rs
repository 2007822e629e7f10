//! Sync transports
//!
//! - [`BroadcastChannel`]: primary transport. Endpoints opened on the same
//!   [`BroadcastHub`] under the same name see each other's posts, never
//!   their own.
//! - [`StorageEventTransport`]: fallback. Posts by writing the message to a
//!   well-known key of a shared [`StorageArea`] and listens for change
//!   events on that key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use super::message::SyncMessage;
use crate::storage::{StorageArea, StorageEvents};

/// Messages buffered per endpoint before slow listeners start losing them
const CHANNEL_CAPACITY: usize = 256;

/// Errors raised by sync transports
#[derive(Error, Debug)]
pub enum TransportError {
    /// Transport cannot be created in this environment
    #[error("Sync transport unavailable: {0}")]
    Unavailable(String),

    /// Transport was closed
    #[error("Sync transport is closed")]
    Closed,

    /// Message could not be delivered
    #[error("Failed to publish sync message: {0}")]
    Publish(String),
}

/// Which transport an engine ended up with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Broadcast,
    StorageEvents,
}

/// Outbound half of a transport
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn post(&self, message: &SyncMessage) -> Result<(), TransportError>;

    fn close(&self);
}

/// Inbound half of a transport
pub struct Inbox {
    source: InboxSource,
}

enum InboxSource {
    Channel {
        rx: broadcast::Receiver<Frame>,
        endpoint: Uuid,
    },
    Storage {
        events: StorageEvents,
        key: String,
    },
}

impl Inbox {
    /// Wait for the next raw payload from another context
    ///
    /// Returns `None` once the transport can deliver nothing more.
    pub async fn recv(&mut self) -> Option<String> {
        match &mut self.source {
            InboxSource::Channel { rx, endpoint } => loop {
                match rx.recv().await {
                    Ok(frame) if frame.origin == *endpoint => continue,
                    Ok(frame) => return Some(frame.payload.to_string()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Sync listener lagged, {} messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            InboxSource::Storage { events, key } => loop {
                let event = events.recv().await?;
                if event.key.as_deref() != Some(key.as_str()) {
                    continue;
                }
                if let Some(value) = event.new_value {
                    return Some(value);
                }
            },
        }
    }
}

// ==================== Broadcast Channel ====================

#[derive(Debug, Clone)]
struct Frame {
    origin: Uuid,
    payload: Arc<str>,
}

#[derive(Debug)]
struct HubInner {
    channels: Mutex<HashMap<String, broadcast::Sender<Frame>>>,
    available: AtomicBool,
}

/// Registry of named broadcast channels shared by every context
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A hub on which every open fails, for environments without the primitive
    pub fn unavailable() -> Self {
        Self::build(false)
    }

    /// Process-wide hub
    pub fn global() -> Self {
        static GLOBAL: OnceLock<BroadcastHub> = OnceLock::new();
        GLOBAL.get_or_init(BroadcastHub::new).clone()
    }

    fn build(available: bool) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(HashMap::new()),
                available: AtomicBool::new(available),
            }),
        }
    }

    /// Refuse further opens, existing endpoints keep working
    pub fn shutdown(&self) {
        self.inner.available.store(false, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Open an endpoint on the channel called `name`
    pub fn open(&self, name: &str) -> Result<(BroadcastChannel, Inbox), TransportError> {
        if !self.is_available() {
            return Err(TransportError::Unavailable(format!(
                "broadcast channels are not supported here ('{}')",
                name
            )));
        }

        let sender = {
            let mut channels = self.inner.channels.lock().unwrap_or_else(|e| e.into_inner());
            // Forget channels whose endpoints are all gone
            channels.retain(|_, sender| sender.receiver_count() > 0);
            channels
                .entry(name.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        };

        let endpoint = Uuid::new_v4();
        let inbox = Inbox {
            source: InboxSource::Channel {
                rx: sender.subscribe(),
                endpoint,
            },
        };

        Ok((
            BroadcastChannel {
                name: name.to_string(),
                endpoint,
                sender,
                closed: AtomicBool::new(false),
            },
            inbox,
        ))
    }
}

/// Endpoint on a named broadcast channel
pub struct BroadcastChannel {
    name: String,
    endpoint: Uuid,
    sender: broadcast::Sender<Frame>,
    closed: AtomicBool,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post an already encoded payload
    pub fn post_raw(&self, payload: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        // Sending fails only when nobody is listening, which is fine
        let _ = self.sender.send(Frame {
            origin: self.endpoint,
            payload: Arc::from(payload),
        });
        Ok(())
    }
}

impl Transport for BroadcastChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn post(&self, message: &SyncMessage) -> Result<(), TransportError> {
        let payload = message
            .encode()
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        self.post_raw(&payload)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ==================== Storage Event Fallback ====================

/// Fallback transport over a shared storage area's change events
pub struct StorageEventTransport {
    area: Arc<dyn StorageArea>,
    key: String,
    closed: AtomicBool,
}

impl StorageEventTransport {
    /// Open the fallback transport for channel `name`
    ///
    /// Fails when the area does not emit change events.
    pub fn open(area: Arc<dyn StorageArea>, name: &str) -> Result<(Self, Inbox), TransportError> {
        let events = area.subscribe().ok_or_else(|| {
            TransportError::Unavailable("storage area does not emit change events".to_string())
        })?;
        let key = sync_key(name);

        let inbox = Inbox {
            source: InboxSource::Storage {
                events,
                key: key.clone(),
            },
        };

        Ok((
            Self {
                area,
                key,
                closed: AtomicBool::new(false),
            },
            inbox,
        ))
    }

    /// Key the messages are written to
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Transport for StorageEventTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StorageEvents
    }

    fn post(&self, message: &SyncMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let payload = message
            .encode()
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        self.area
            .set_item(&self.key, &payload)
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Storage key used by the fallback transport for channel `name`
pub fn sync_key(name: &str) -> String {
    format!("{}:sync", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryArea, SqliteArea};
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_skips_own_posts() {
        let hub = BroadcastHub::new();
        let (tab_a, mut inbox_a) = hub.open("todos").unwrap();
        let (tab_b, mut inbox_b) = hub.open("todos").unwrap();

        tab_a.post_raw("from a").unwrap();
        tab_b.post_raw("from b").unwrap();

        assert_eq!(inbox_b.recv().await.as_deref(), Some("from a"));
        assert_eq!(inbox_a.recv().await.as_deref(), Some("from b"));
    }

    #[tokio::test]
    async fn test_channels_are_isolated_by_name() {
        let hub = BroadcastHub::new();
        let (todos, _todos_inbox) = hub.open("todos").unwrap();
        let (_settings, mut settings_inbox) = hub.open("settings").unwrap();
        let (_other_todos, mut other_todos_inbox) = hub.open("todos").unwrap();

        todos.post_raw("todo payload").unwrap();

        assert_eq!(other_todos_inbox.recv().await.as_deref(), Some("todo payload"));
        assert!(settings_inbox.source_is_empty());
    }

    #[test]
    fn test_unavailable_hub() {
        let hub = BroadcastHub::unavailable();
        assert!(matches!(hub.open("x"), Err(TransportError::Unavailable(_))));

        let hub = BroadcastHub::new();
        assert!(hub.open("x").is_ok());
        hub.shutdown();
        assert!(hub.open("x").is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_posts() {
        let hub = BroadcastHub::new();
        let (channel, _inbox) = hub.open("x").unwrap();

        channel.close();
        let msg = SyncMessage::state_update(json!({}), None);
        assert!(matches!(channel.post(&msg), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_storage_fallback_delivers_to_other_context() {
        let area = MemoryArea::new();
        let (tab_a, _inbox_a) = StorageEventTransport::open(Arc::new(area.context()), "todos").unwrap();
        let (_tab_b, mut inbox_b) =
            StorageEventTransport::open(Arc::new(area.context()), "todos").unwrap();

        // Unrelated keys are ignored
        area.context().set_item("todos", "persisted state").unwrap();

        let msg = SyncMessage::state_update(json!({"n": 1}), Some("add"));
        tab_a.post(&msg).unwrap();

        let raw = inbox_b.recv().await.unwrap();
        assert_eq!(SyncMessage::decode(&raw).unwrap(), msg);
        assert_eq!(tab_a.key(), "todos:sync");
    }

    #[test]
    fn test_storage_fallback_needs_events() {
        let area = Arc::new(SqliteArea::open_in_memory().unwrap());
        assert!(matches!(
            StorageEventTransport::open(area, "todos"),
            Err(TransportError::Unavailable(_))
        ));
    }

    impl Inbox {
        fn source_is_empty(&mut self) -> bool {
            match &mut self.source {
                InboxSource::Channel { rx, .. } => rx.is_empty(),
                InboxSource::Storage { .. } => true,
            }
        }
    }
}
