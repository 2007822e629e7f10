//! Persistence pipeline
//!
//! Observes commits and writes the latest state to a storage adapter:
//!
//! ```text
//! commit ──debounce──▶ serialize ──compress?──▶ adapter.set(key, payload)
//! ```
//!
//! Writes coalesce: only the last state seen inside a debounce window is
//! written. Capacity failures go to the quota callback instead of being
//! raised. Loading is not debounced; it runs once when the store opens and
//! applies migrations before the value reaches the live state.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::{compression, deserialize, serialize, Codec, Compressor, JsonCodec, Migrations};
use crate::debounce::Debouncer;
use crate::hooks::{Commit, CommitObserver};
use crate::storage::{QuotaExceededError, StorageAdapter, StorageError};

/// Default debounce window for writes
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(100);

/// Called with the rejected key and payload size when a write does not fit
pub type QuotaCallback = Arc<dyn Fn(&QuotaExceededError) + Send + Sync>;

/// How and where a store is persisted
#[derive(Clone)]
pub struct PersistOptions {
    /// Key the state is stored under
    pub key: String,
    pub adapter: Arc<dyn StorageAdapter>,
    /// Version written into the envelope and targeted by migrations
    pub version: Option<u32>,
    pub debounce: Duration,
    pub compress: bool,
    pub codec: Arc<dyn Codec>,
    pub migrations: Arc<Migrations>,
    pub on_quota_exceeded: Option<QuotaCallback>,
}

impl fmt::Debug for PersistOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistOptions")
            .field("key", &self.key)
            .field("adapter", &self.adapter.name())
            .field("version", &self.version)
            .field("debounce", &self.debounce)
            .field("compress", &self.compress)
            .field("migrations", &self.migrations)
            .finish()
    }
}

impl PersistOptions {
    pub fn new(key: impl Into<String>, adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            key: key.into(),
            adapter,
            version: None,
            debounce: DEFAULT_PERSIST_DEBOUNCE,
            compress: false,
            codec: Arc::new(JsonCodec),
            migrations: Arc::new(Migrations::new()),
            on_quota_exceeded: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_migrations(mut self, migrations: Migrations) -> Self {
        self.migrations = Arc::new(migrations);
        self
    }

    pub fn on_quota_exceeded<F>(mut self, callback: F) -> Self
    where
        F: Fn(&QuotaExceededError) + Send + Sync + 'static,
    {
        self.on_quota_exceeded = Some(Arc::new(callback));
        self
    }
}

struct PipelineInner {
    options: PersistOptions,
    compressor: Compressor,
    /// Latest state not yet written
    pending: Mutex<Option<Value>>,
}

impl PipelineInner {
    fn take_pending(&self) -> Option<Value> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn encode(&self, state: &Value) -> Option<String> {
        let options = &self.options;
        match serialize(state, options.version, options.codec.as_ref()) {
            Ok(text) if options.compress => Some(self.compressor.compress(&text)),
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Not persisting '{}': {}", options.key, e);
                None
            }
        }
    }

    async fn write_pending(&self) {
        let Some(state) = self.take_pending() else {
            return;
        };
        let Some(payload) = self.encode(&state) else {
            return;
        };

        let key = &self.options.key;
        match self.options.adapter.set(key, &payload).await {
            Ok(()) => debug!(
                "Persisted '{}' to {} storage ({} bytes)",
                key,
                self.options.adapter.name(),
                payload.len()
            ),
            Err(StorageError::QuotaExceeded(quota)) => match &self.options.on_quota_exceeded {
                Some(callback) => callback(&quota),
                None => warn!("{}", quota),
            },
            Err(e) => warn!("Failed to persist '{}': {}", key, e),
        }
    }
}

/// Debounced writer for one store
pub struct PersistencePipeline {
    inner: Arc<PipelineInner>,
    debouncer: Debouncer,
}

impl PersistencePipeline {
    /// Create a pipeline on the current tokio runtime
    pub fn new(options: PersistOptions) -> Self {
        let debouncer = Debouncer::new(options.debounce);
        Self {
            inner: Arc::new(PipelineInner {
                options,
                compressor: Compressor::native(),
                pending: Mutex::new(None),
            }),
            debouncer,
        }
    }

    /// Replace the compressor (e.g. to force the uncompressed path)
    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.compressor = compressor;
        }
        self
    }

    pub fn options(&self) -> &PersistOptions {
        &self.inner.options
    }

    /// Read the stored state
    ///
    /// Returns `None` when nothing is stored or the payload is unreadable.
    /// Migrations run when a target version is configured.
    pub async fn load(&self) -> Option<Value> {
        let options = &self.inner.options;
        let raw = options.adapter.get(&options.key).await?;
        let text = compression::decompress(&raw);
        let envelope = deserialize(&text, options.codec.as_ref())?;

        let stored_version = envelope.version_or_default();
        let value = match options.version {
            Some(target) => options.migrations.run(envelope.value, stored_version, target),
            None => envelope.value,
        };

        debug!(
            "Loaded '{}' from {} storage (version {})",
            options.key,
            options.adapter.name(),
            stored_version
        );
        Some(value)
    }

    /// Queue `state` to be written once the debounce window closes
    pub fn schedule(&self, state: &Value) {
        *self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());

        let inner = Arc::clone(&self.inner);
        self.debouncer.trigger(async move {
            inner.write_pending().await;
        });
    }

    /// Write the pending state now
    pub async fn flush(&self) {
        self.debouncer.cancel();
        self.inner.write_pending().await;
    }

    /// Whether a state is waiting to be written
    pub fn has_pending(&self) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Drop any pending write and remove the stored state
    pub async fn clear_persisted(&self) {
        self.debouncer.cancel();
        self.inner.take_pending();
        self.inner.options.adapter.remove(&self.inner.options.key).await;
    }
}

impl CommitObserver for PersistencePipeline {
    fn on_commit(&self, commit: &Commit<'_>) {
        self.schedule(commit.next);
    }
}
