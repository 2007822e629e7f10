//! Undo/redo history
//!
//! A bounded timeline of snapshots around a `current` state:
//!
//! ```text
//! past (oldest .. newest)   current   future (next redo last)
//! ```
//!
//! Every entry owns its own copy of the state. Values passed in are cloned,
//! values handed out are clones, so nothing stored here aliases live state.
//!
//! ## Batches
//!
//! Between [`HistoryManager::start_batch`] and [`HistoryManager::end_batch`]
//! pushes are buffered. Ending the batch records one entry holding the state
//! from before the first buffered push, so the whole gesture undoes in one
//! step.

use std::collections::VecDeque;

use chrono::Utc;
use tracing::debug;

/// Action label of an entry recorded by [`HistoryManager::end_batch`]
pub const BATCH_ACTION: &str = "batch";

/// Default maximum number of `past` entries
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// History configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryOptions {
    /// Maximum number of undo steps kept, oldest are evicted first
    pub limit: usize,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// One snapshot on the timeline
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry<T> {
    pub state: T,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub action: Option<String>,
}

impl<T> HistoryEntry<T> {
    fn new(state: T, action: Option<String>) -> Self {
        Self {
            state,
            timestamp: Utc::now().timestamp_millis(),
            action,
        }
    }
}

/// Undo/redo timeline for one store
#[derive(Debug, Clone)]
pub struct HistoryManager<T: Clone> {
    past: VecDeque<HistoryEntry<T>>,
    future: Vec<HistoryEntry<T>>,
    current: T,
    limit: usize,
    /// `(previous, next)` pairs pushed during the active batch
    batch: Option<Vec<(T, T)>>,
}

impl<T: Clone> HistoryManager<T> {
    pub fn new(initial: &T, options: HistoryOptions) -> Self {
        Self {
            past: VecDeque::new(),
            future: Vec::new(),
            current: initial.clone(),
            limit: options.limit,
            batch: None,
        }
    }

    /// Record a commit from `previous` to `next`
    pub fn push(&mut self, previous: &T, next: &T, action: Option<&str>) {
        if let Some(buffer) = self.batch.as_mut() {
            buffer.push((previous.clone(), next.clone()));
            return;
        }

        self.record(HistoryEntry::new(previous.clone(), action.map(str::to_string)));
        self.future.clear();
        self.current = next.clone();
    }

    /// Step back, returns the restored state
    pub fn undo(&mut self) -> Option<T> {
        let entry = self.past.pop_back()?;
        let current = std::mem::replace(&mut self.current, entry.state);
        self.future.push(HistoryEntry::new(current, entry.action));
        Some(self.current.clone())
    }

    /// Step forward again, returns the restored state
    pub fn redo(&mut self) -> Option<T> {
        let entry = self.future.pop()?;
        let current = std::mem::replace(&mut self.current, entry.state);
        self.record(HistoryEntry::new(current, entry.action));
        Some(self.current.clone())
    }

    /// Undo until `past[index]` is current
    ///
    /// Returns `None` and changes nothing for an index out of range.
    pub fn jump_to(&mut self, index: usize) -> Option<T> {
        if index >= self.past.len() {
            return None;
        }

        let mut restored = None;
        while self.past.len() > index {
            restored = self.undo();
        }
        restored
    }

    /// Start buffering pushes, does nothing if a batch is already active
    pub fn start_batch(&mut self) {
        if self.batch.is_none() {
            self.batch = Some(Vec::new());
        }
    }

    /// Collapse the buffered pushes into one entry
    ///
    /// An empty batch records nothing.
    pub fn end_batch(&mut self) {
        let Some(buffer) = self.batch.take() else {
            return;
        };
        let steps = buffer.len();
        let mut pairs = buffer.into_iter();
        let Some((first_previous, first_next)) = pairs.next() else {
            return;
        };
        let last_next = pairs.last().map_or(first_next, |(_, next)| next);

        self.record(HistoryEntry::new(first_previous, Some(BATCH_ACTION.to_string())));
        self.future.clear();
        self.current = last_next;
        debug!("Collapsed {} commits into one history entry", steps);
    }

    /// Forget past and future, keep `current`
    pub fn clear(&mut self) {
        self.past.clear();
        self.future.clear();
    }

    pub fn can_undo(&self) -> bool {
        !self.past.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.future.is_empty()
    }

    pub fn past_len(&self) -> usize {
        self.past.len()
    }

    pub fn future_len(&self) -> usize {
        self.future.len()
    }

    pub fn current(&self) -> &T {
        &self.current
    }

    /// Past entries, oldest first
    pub fn past(&self) -> impl Iterator<Item = &HistoryEntry<T>> {
        self.past.iter()
    }

    /// Future entries, next redo first
    pub fn future(&self) -> impl Iterator<Item = &HistoryEntry<T>> {
        self.future.iter().rev()
    }

    pub fn is_batching(&self) -> bool {
        self.batch.is_some()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn record(&mut self, entry: HistoryEntry<T>) {
        self.past.push_back(entry);
        while self.past.len() > self.limit {
            self.past.pop_front();
        }
    }
}
