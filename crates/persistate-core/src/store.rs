//! Observable state store
//!
//! The `Store` owns a JSON object state and drives the persistence, sync and
//! history engines through its commit hooks:
//!
//! ```text
//!            ┌─▶ PersistencePipeline (debounced write)
//! commit ────┼─▶ SyncEngine          (debounced broadcast)
//!            ├─▶ history recorder    (undo/redo timeline)
//!            └─▶ subscribers
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::builder("todos", json!({"items": []}))
//!     .persist(PersistOptions::new("todos", adapter))
//!     .sync(SyncOptions::default())
//!     .history(HistoryOptions::default())
//!     .open()
//!     .await;
//!
//! store.set("filter", json!("done"), Some("filter"));
//! store.undo();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::{Backend, Config};
use crate::history::{HistoryManager, HistoryOptions};
use crate::hooks::{Commit, CommitHooks, CommitObserver, ObserverId};
use crate::persistence::{PersistOptions, PersistencePipeline};
use crate::storage::{DocumentStoreAdapter, ScopedStorageAdapter, SqliteArea, StorageAdapter};
use crate::sync::{StateTarget, SyncEngine, SyncOptions};

/// Builder for a [`Store`]
#[derive(Debug)]
pub struct StoreBuilder {
    name: String,
    initial: Value,
    persist: Option<PersistOptions>,
    sync: Option<SyncOptions>,
    history: Option<HistoryOptions>,
}

impl StoreBuilder {
    pub fn persist(mut self, options: PersistOptions) -> Self {
        self.persist = Some(options);
        self
    }

    pub fn sync(mut self, options: SyncOptions) -> Self {
        self.sync = Some(options);
        self
    }

    pub fn history(mut self, options: HistoryOptions) -> Self {
        self.history = Some(options);
        self
    }

    /// Persist to the configured on-disk backend and take timings from `config`
    ///
    /// Sync is enabled only when the config says so.
    pub fn with_config(mut self, config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", config.data_dir))?;

        let adapter: Arc<dyn StorageAdapter> = match config.backend {
            Backend::Area => {
                let path = config.area_path();
                let area = SqliteArea::open(&path)
                    .with_context(|| format!("Failed to open storage area: {:?}", path))?;
                Arc::new(ScopedStorageAdapter::persistent(Arc::new(area), ""))
            }
            // Opened lazily on first use
            Backend::Documents => {
                Arc::new(DocumentStoreAdapter::new(config.document_store_options()))
            }
        };

        self.persist = Some(
            PersistOptions::new(self.name.clone(), adapter)
                .with_debounce(config.persist_debounce())
                .with_compression(config.compress),
        );
        self.history = Some(config.history_options());
        self.sync = config
            .sync_enabled
            .then(|| SyncOptions::default().with_debounce(config.sync_debounce()));
        Ok(self)
    }

    /// Load persisted state and start the configured engines
    ///
    /// Must be called inside a tokio runtime.
    pub async fn open(self) -> Arc<Store> {
        let persistence = self.persist.map(|options| Arc::new(PersistencePipeline::new(options)));

        let mut state = self.initial;
        if let Some(pipeline) = &persistence {
            if let Some(stored) = pipeline.load().await {
                install(&mut state, stored);
            }
        }

        let name = self.name;
        let sync_options = self.sync;
        let history = self
            .history
            .map(|options| Mutex::new(HistoryManager::new(&state, options)));

        let store = Arc::new_cyclic(|weak: &Weak<Store>| {
            let hooks = CommitHooks::new();

            if let Some(pipeline) = &persistence {
                hooks.register(Arc::clone(pipeline) as Arc<dyn CommitObserver>);
            }

            let sync = sync_options.map(|options| {
                let target: Weak<dyn StateTarget> = weak.clone();
                let engine = Arc::new(SyncEngine::start(
                    options.channel_name(&name),
                    &options,
                    target,
                ));
                hooks.register(Arc::clone(&engine) as Arc<dyn CommitObserver>);
                engine
            });

            if history.is_some() {
                let recorder = weak.clone();
                hooks.register(Arc::new(move |commit: &Commit<'_>| {
                    if let Some(store) = recorder.upgrade() {
                        store.record(commit);
                    }
                }));
            }

            Store {
                name: name.clone(),
                state: Mutex::new(state),
                hooks,
                persistence,
                sync,
                history,
                restoring: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }
        });

        info!("Opened store '{}'", store.name);
        store
    }
}

/// Observable JSON state with persistence, sync and history
pub struct Store {
    name: String,
    state: Mutex<Value>,
    hooks: CommitHooks,
    persistence: Option<Arc<PersistencePipeline>>,
    sync: Option<Arc<SyncEngine>>,
    history: Option<Mutex<HistoryManager<Value>>>,
    /// Set while undo/redo installs a state, keeps it out of the timeline
    restoring: AtomicBool,
    destroyed: AtomicBool,
}

impl Store {
    pub fn builder(name: impl Into<String>, initial: Value) -> StoreBuilder {
        StoreBuilder {
            name: name.into(),
            initial,
            persist: None,
            sync: None,
            history: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ==================== State ====================

    /// Copy of the whole state
    pub fn state(&self) -> Value {
        self.lock_state().clone()
    }

    /// Copy of one top-level key
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock_state().get(key).cloned()
    }

    /// Assign one top-level key
    pub fn set(&self, key: &str, value: Value, action: Option<&str>) {
        self.update(action, |state| {
            object_mut(state).insert(key.to_string(), value);
        });
    }

    /// Mutate the state in place and commit the result
    pub fn update<F>(&self, action: Option<&str>, mutate: F)
    where
        F: FnOnce(&mut Value),
    {
        let (previous, next) = {
            let mut state = self.lock_state();
            let previous = state.clone();
            mutate(&mut state);
            (previous, state.clone())
        };
        self.commit(&previous, &next, action);
    }

    /// Swap in a whole new state
    pub fn replace(&self, next: Value, action: Option<&str>) {
        self.update(action, |state| *state = next);
    }

    fn commit(&self, previous: &Value, next: &Value, action: Option<&str>) {
        if previous == next {
            return;
        }
        self.hooks.notify(previous, next, action);
    }

    // ==================== History ====================

    /// Restore the previous state, returns it
    pub fn undo(&self) -> Option<Value> {
        let restored = self.with_history_mut(HistoryManager::undo)??;
        self.restore(restored.clone(), "undo");
        Some(restored)
    }

    /// Re-apply an undone state, returns it
    pub fn redo(&self) -> Option<Value> {
        let restored = self.with_history_mut(HistoryManager::redo)??;
        self.restore(restored.clone(), "redo");
        Some(restored)
    }

    pub fn start_batch(&self) {
        self.with_history_mut(HistoryManager::start_batch);
    }

    pub fn end_batch(&self) {
        self.with_history_mut(HistoryManager::end_batch);
    }

    pub fn clear_history(&self) {
        self.with_history_mut(HistoryManager::clear);
    }

    pub fn can_undo(&self) -> bool {
        self.with_history(HistoryManager::can_undo).unwrap_or(false)
    }

    pub fn can_redo(&self) -> bool {
        self.with_history(HistoryManager::can_redo).unwrap_or(false)
    }

    /// Inspect the timeline, `None` when history is disabled
    pub fn with_history<R>(&self, inspect: impl FnOnce(&HistoryManager<Value>) -> R) -> Option<R> {
        let history = self.history.as_ref()?;
        let history = history.lock().unwrap_or_else(|e| e.into_inner());
        Some(inspect(&history))
    }

    fn with_history_mut<R>(
        &self,
        change: impl FnOnce(&mut HistoryManager<Value>) -> R,
    ) -> Option<R> {
        let history = self.history.as_ref()?;
        let mut history = history.lock().unwrap_or_else(|e| e.into_inner());
        Some(change(&mut history))
    }

    /// Install a state from the timeline without recording it
    fn restore(&self, next: Value, action: &str) {
        self.restoring.store(true, Ordering::SeqCst);
        self.replace(next, Some(action));
        self.restoring.store(false, Ordering::SeqCst);
    }

    fn record(&self, commit: &Commit<'_>) {
        if self.restoring.load(Ordering::SeqCst) {
            return;
        }
        self.with_history_mut(|history| history.push(commit.previous, commit.next, commit.action));
    }

    // ==================== Observers ====================

    /// Call `listener` after every commit
    pub fn subscribe<F>(&self, listener: F) -> ObserverId
    where
        F: Fn(&Commit<'_>) + Send + Sync + 'static,
    {
        self.hooks.register(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.hooks.unregister(id)
    }

    // ==================== Lifecycle ====================

    pub fn persistence(&self) -> Option<&PersistencePipeline> {
        self.persistence.as_deref()
    }

    pub fn sync_engine(&self) -> Option<&SyncEngine> {
        self.sync.as_deref()
    }

    /// Write the pending state now instead of waiting for the debounce
    pub async fn flush(&self) {
        if let Some(pipeline) = &self.persistence {
            pipeline.flush().await;
        }
    }

    /// Stop syncing with other contexts
    ///
    /// Cancels a pending broadcast and closes the transport. Local state,
    /// history and persistence keep working. Calling it again does nothing.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = &self.sync {
            engine.close();
        }
        debug!("Destroyed store '{}'", self.name);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Value> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateTarget for Store {
    fn assign(&self, key: &str, value: Value) {
        self.set(key, value, None);
    }
}

/// Merge a loaded state over the initial one
///
/// Objects merge key by key so fields added since the state was saved keep
/// their initial values. Anything else replaces the initial state.
fn install(state: &mut Value, loaded: Value) {
    match (state.as_object_mut(), loaded) {
        (Some(current), Value::Object(loaded)) => current.extend(loaded),
        (_, loaded) => *state = loaded,
    }
}

/// The state as an object, replacing a non-object state with an empty one
fn object_mut(state: &mut Value) -> &mut Map<String, Value> {
    if !state.is_object() {
        *state = Value::Object(Map::new());
    }
    match state {
        Value::Object(map) => map,
        _ => unreachable!("state was just made an object"),
    }
}
