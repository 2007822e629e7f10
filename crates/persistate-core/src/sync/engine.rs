//! Cross-context sync engine
//!
//! Publishes the full state after local commits and applies state published
//! by other contexts sharing the channel.
//!
//! ## Echo suppression
//!
//! Applying a remote update commits to the local store, which would publish
//! it straight back. While an update is being applied the engine holds an
//! `applying` depth and skips publishing. Each apply raises the depth and a
//! task spawned after it lowers it again, so the guard stays up until the
//! listener yields and never drops while a later apply is still running.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::SyncMessage;
use super::transport::{BroadcastHub, Inbox, StorageEventTransport, Transport, TransportKind};
use crate::debounce::Debouncer;
use crate::hooks::{Commit, CommitObserver};
use crate::storage::StorageArea;

/// Default delay between the last local commit and its broadcast
pub const DEFAULT_SYNC_DEBOUNCE: Duration = Duration::from_millis(50);

/// Prefix of derived channel names
pub const CHANNEL_PREFIX: &str = "persistate:";

/// The state a sync engine reads from and applies into
pub trait StateTarget: Send + Sync {
    /// Commit a single top-level key
    fn assign(&self, key: &str, value: Value);
}

/// Configuration for a sync engine
#[derive(Clone)]
pub struct SyncOptions {
    /// Channel name, derived from the store name when unset
    pub channel: Option<String>,
    pub debounce: Duration,
    /// Hub for the primary transport, `None` skips it
    pub hub: Option<BroadcastHub>,
    /// Shared area for the fallback transport
    pub fallback_area: Option<Arc<dyn StorageArea>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            channel: None,
            debounce: DEFAULT_SYNC_DEBOUNCE,
            hub: Some(BroadcastHub::global()),
            fallback_area: None,
        }
    }
}

impl std::fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOptions")
            .field("channel", &self.channel)
            .field("debounce", &self.debounce)
            .field("hub", &self.hub.is_some())
            .field("fallback_area", &self.fallback_area.is_some())
            .finish()
    }
}

impl SyncOptions {
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_hub(mut self, hub: Option<BroadcastHub>) -> Self {
        self.hub = hub;
        self
    }

    pub fn with_fallback_area(mut self, area: Arc<dyn StorageArea>) -> Self {
        self.fallback_area = Some(area);
        self
    }

    /// Channel name for a store called `store_name`
    pub fn channel_name(&self, store_name: &str) -> String {
        self.channel
            .clone()
            .unwrap_or_else(|| format!("{}{}", CHANNEL_PREFIX, store_name))
    }
}

struct EngineInner {
    channel: String,
    transport: Mutex<Option<Box<dyn Transport>>>,
    kind: Option<TransportKind>,
    listener: Mutex<Option<JoinHandle<()>>>,
    debouncer: Debouncer,
    runtime: Handle,
    /// Latest local commit waiting for the debounce window
    pending: Mutex<Option<(Value, Option<String>)>>,
    /// Remote applies not yet released
    applying: AtomicUsize,
    closed: AtomicBool,
    published: AtomicU64,
    received: watch::Sender<u64>,
}

/// Per-store sync engine
///
/// Register it as a commit observer on the store it was started for.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Open a transport for `channel` and start listening
    ///
    /// Tries the broadcast hub first, then the fallback area. With neither
    /// available the engine is inert: commits are accepted and dropped.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(channel: String, options: &SyncOptions, target: Weak<dyn StateTarget>) -> Self {
        let runtime = Handle::current();
        let selected = select_transport(&channel, options);
        let kind = selected.as_ref().map(|(transport, _)| transport.kind());
        let (transport, inbox) = match selected {
            Some((transport, inbox)) => (Some(transport), Some(inbox)),
            None => (None, None),
        };

        let inner = Arc::new(EngineInner {
            channel,
            transport: Mutex::new(transport),
            kind,
            listener: Mutex::new(None),
            debouncer: Debouncer::with_runtime(options.debounce, runtime.clone()),
            runtime: runtime.clone(),
            pending: Mutex::new(None),
            applying: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            received: watch::channel(0).0,
        });

        if let Some(inbox) = inbox {
            let handle = runtime.spawn(listen(inbox, Arc::downgrade(&inner), target));
            *lock(&inner.listener) = Some(handle);
        }

        Self { inner }
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Transport in use, `None` when sync is inert
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.inner.kind
    }

    /// Whether a remote update is being applied right now
    pub fn is_applying(&self) -> bool {
        self.inner.applying.load(Ordering::SeqCst) > 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of messages posted so far
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Watch the number of remote updates applied so far
    pub fn received(&self) -> watch::Receiver<u64> {
        self.inner.received.subscribe()
    }

    /// Stop listening and close the transport
    ///
    /// Cancels a pending broadcast. Calling it again does nothing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.debouncer.cancel();
        lock(&self.inner.pending).take();
        if let Some(transport) = lock(&self.inner.transport).take() {
            transport.close();
        }
        if let Some(listener) = lock(&self.inner.listener).take() {
            listener.abort();
        }
        debug!("Closed sync engine on '{}'", self.inner.channel);
    }
}

impl CommitObserver for SyncEngine {
    fn on_commit(&self, commit: &Commit<'_>) {
        let inner = &self.inner;
        if inner.applying.load(Ordering::SeqCst) > 0 {
            debug!("Not broadcasting commit applied from '{}'", inner.channel);
            return;
        }
        if inner.closed.load(Ordering::SeqCst) || inner.kind.is_none() {
            return;
        }

        *lock(&inner.pending) = Some((commit.next.clone(), commit.action.map(str::to_string)));

        let publisher = Arc::clone(inner);
        inner.debouncer.trigger(async move {
            publisher.publish_pending();
        });
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl EngineInner {
    fn publish_pending(&self) {
        let Some((state, action)) = lock(&self.pending).take() else {
            return;
        };
        let message = SyncMessage::state_update(state, action.as_deref());

        let transport = lock(&self.transport);
        let Some(transport) = transport.as_ref() else {
            return;
        };
        match transport.post(&message) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::SeqCst);
                debug!("Published state update on '{}'", self.channel);
            }
            Err(e) => warn!("Failed to publish on '{}': {}", self.channel, e),
        }
    }

    fn receive(self: &Arc<Self>, raw: &str, target: &dyn StateTarget) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let message = match SyncMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring payload on '{}': {}", self.channel, e);
                return;
            }
        };
        let SyncMessage::StateUpdate { state, .. } = message;
        let Value::Object(entries) = state else {
            warn!("Ignoring non-object state on '{}'", self.channel);
            return;
        };

        self.applying.fetch_add(1, Ordering::SeqCst);
        for (key, value) in entries {
            target.assign(&key, value);
        }
        self.received.send_modify(|count| *count += 1);

        let engine = Arc::clone(self);
        self.runtime.spawn(async move {
            engine.applying.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

fn select_transport(
    channel: &str,
    options: &SyncOptions,
) -> Option<(Box<dyn Transport>, Inbox)> {
    if let Some(hub) = &options.hub {
        match hub.open(channel) {
            Ok((transport, inbox)) => {
                debug!("Syncing '{}' over broadcast channel", channel);
                return Some((Box::new(transport), inbox));
            }
            Err(e) => warn!("{}, trying fallback", e),
        }
    }

    if let Some(area) = &options.fallback_area {
        match StorageEventTransport::open(Arc::clone(area), channel) {
            Ok((transport, inbox)) => {
                info!("Syncing '{}' over storage events", channel);
                return Some((Box::new(transport), inbox));
            }
            Err(e) => warn!("{}", e),
        }
    }

    warn!("No sync transport for '{}', changes stay local", channel);
    None
}

async fn listen(mut inbox: Inbox, engine: Weak<EngineInner>, target: Weak<dyn StateTarget>) {
    while let Some(raw) = inbox.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        // Target still under construction or already gone
        let Some(target) = target.upgrade() else {
            continue;
        };
        engine.receive(&raw, target.as_ref());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryArea;
    use serde_json::json;
    use std::sync::OnceLock;

    /// Minimal store stand-in that forwards commits to its engine
    #[derive(Default)]
    struct Tab {
        state: Mutex<Value>,
        engine: OnceLock<SyncEngine>,
        assigned: AtomicUsize,
        /// Blocking time spent in each `assign`
        apply_delay: Duration,
    }

    impl Tab {
        fn commit(&self, key: &str, value: Value, action: Option<&str>) {
            let (previous, next) = {
                let mut state = self.state.lock().unwrap();
                if !state.is_object() {
                    *state = json!({});
                }
                let previous = state.clone();
                state[key] = value;
                (previous, state.clone())
            };
            if let Some(engine) = self.engine.get() {
                engine.on_commit(&Commit {
                    previous: &previous,
                    next: &next,
                    action,
                });
            }
        }

        fn engine(&self) -> &SyncEngine {
            self.engine.get().unwrap()
        }

        fn snapshot(&self) -> Value {
            self.state.lock().unwrap().clone()
        }
    }

    impl StateTarget for Tab {
        fn assign(&self, key: &str, value: Value) {
            self.assigned.fetch_add(1, Ordering::SeqCst);
            if !self.apply_delay.is_zero() {
                std::thread::sleep(self.apply_delay);
            }
            self.commit(key, value, None);
        }
    }

    fn open_tab(channel: &str, options: &SyncOptions) -> Arc<Tab> {
        start_tab(channel, options, Tab::default())
    }

    fn start_tab(channel: &str, options: &SyncOptions, tab: Tab) -> Arc<Tab> {
        let tab = Arc::new(tab);
        let target: Weak<dyn StateTarget> = Arc::downgrade(&tab) as Weak<dyn StateTarget>;
        let engine = SyncEngine::start(channel.to_string(), options, target);
        assert!(tab.engine.set(engine).is_ok());
        tab
    }

    fn hub_options(hub: &BroadcastHub) -> SyncOptions {
        SyncOptions::default().with_hub(Some(hub.clone()))
    }

    #[test]
    fn test_channel_name() {
        let options = SyncOptions::default();
        assert_eq!(options.channel_name("todos"), "persistate:todos");
        assert_eq!(options.with_channel("shared").channel_name("todos"), "shared");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_reaches_other_tab_without_echo() {
        let hub = BroadcastHub::new();
        let a = open_tab("todos", &hub_options(&hub));
        let b = open_tab("todos", &hub_options(&hub));
        assert_eq!(a.engine().transport_kind(), Some(TransportKind::Broadcast));

        let mut received = b.engine().received();
        a.commit("count", json!(1), Some("increment"));
        received.changed().await.unwrap();

        assert_eq!(b.snapshot(), json!({"count": 1}));
        assert_eq!(b.assigned.load(Ordering::SeqCst), 1);

        // Give any echo a chance to travel back
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(a.engine().published(), 1);
        assert_eq!(b.engine().published(), 0);
        assert_eq!(a.assigned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_debounced_into_one_message() {
        let hub = BroadcastHub::new();
        let a = open_tab("todos", &hub_options(&hub));
        let b = open_tab("todos", &hub_options(&hub));

        for i in 0..10 {
            a.commit("count", json!(i), None);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(a.engine().published(), 1);
        assert_eq!(*b.engine().received().borrow(), 1);
        assert_eq!(b.snapshot(), json!({"count": 9}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_apply_per_key() {
        let hub = BroadcastHub::new();
        let a = open_tab("todos", &hub_options(&hub));
        let b = open_tab("todos", &hub_options(&hub));

        b.commit("local", json!("kept"), None);
        tokio::time::sleep(Duration::from_millis(200)).await;

        a.commit("title", json!("x"), None);
        a.commit("done", json!(true), None);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Keys missing from the remote state are left alone
        assert_eq!(
            b.snapshot(),
            json!({"local": "kept", "title": "x", "done": true})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_storage_events() {
        let area = MemoryArea::new();
        let options_for = |area: &MemoryArea| {
            SyncOptions::default()
                .with_hub(Some(BroadcastHub::unavailable()))
                .with_fallback_area(Arc::new(area.context()))
        };
        let a = open_tab("todos", &options_for(&area));
        let b = open_tab("todos", &options_for(&area));
        assert_eq!(a.engine().transport_kind(), Some(TransportKind::StorageEvents));

        a.commit("count", json!(3), None);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(b.snapshot(), json!({"count": 3}));
        assert_eq!(b.engine().published(), 0);
        assert!(area.get_item("todos:sync").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inert_without_transport() {
        let options = SyncOptions::default().with_hub(None);
        let a = open_tab("todos", &options);

        assert_eq!(a.engine().transport_kind(), None);
        a.commit("count", json!(1), None);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(a.engine().published(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_stops_traffic() {
        let hub = BroadcastHub::new();
        let a = open_tab("todos", &hub_options(&hub));
        let b = open_tab("todos", &hub_options(&hub));

        a.commit("count", json!(1), None);
        a.engine().close();
        a.engine().close();
        assert!(a.engine().is_closed());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(a.engine().published(), 0);
        assert_eq!(b.snapshot(), Value::Null);

        // A closed engine no longer listens either
        b.commit("count", json!(2), None);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(a.assigned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_payloads_are_ignored() {
        let hub = BroadcastHub::new();
        let b = open_tab("todos", &hub_options(&hub));
        let (raw, _inbox) = hub.open("todos").unwrap();

        raw.post_raw(r#"{"type":"presence","peer":"x"}"#).unwrap();
        raw.post_raw("garbage").unwrap();
        raw.post_raw(r#"{"type":"state-update","state":[1,2],"timestamp":1}"#)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(b.assigned.load(Ordering::SeqCst), 0);
        assert_eq!(*b.engine().received().borrow(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_covers_rest_of_apply_tick() {
        let hub = BroadcastHub::new();
        let b = open_tab("todos", &hub_options(&hub));
        let payload = SyncMessage::state_update(json!({"count": 5}), None)
            .encode()
            .unwrap();

        b.engine().inner.receive(&payload, b.as_ref());
        assert!(b.engine().is_applying());

        // Commits made before the listener yields are treated as remote
        b.commit("extra", json!(1), None);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!b.engine().is_applying());

        b.commit("extra", json!(2), None);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(b.engine().published(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_back_to_back_updates_are_not_rebroadcast() {
        let hub = BroadcastHub::new();
        let options = hub_options(&hub).with_debounce(Duration::from_millis(10));
        let slow = Tab {
            apply_delay: Duration::from_millis(20),
            ..Tab::default()
        };
        let b = start_tab("todos", &options, slow);
        let (peer, _inbox) = hub.open("todos").unwrap();

        let mut received = b.engine().received();
        for i in 0..6 {
            let frame = SyncMessage::state_update(json!({"count": i}), None)
                .encode()
                .unwrap();
            peer.post_raw(&frame).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), received.wait_for(|n| *n >= 6))
            .await
            .unwrap()
            .unwrap();

        // Well past the debounce window
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!b.engine().is_applying());
        assert_eq!(b.engine().published(), 0);
        assert_eq!(b.snapshot(), json!({"count": 5}));
    }
}
