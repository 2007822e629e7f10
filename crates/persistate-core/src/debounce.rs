//! Debounce timer
//!
//! Collapses bursts of triggers into one action that runs once no trigger
//! arrived for the configured delay. Every trigger cancels the pending timer
//! and arms a new one, so at most one timer is pending at any time.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Single-slot debounce timer on a tokio runtime
pub struct Debouncer {
    delay: Duration,
    runtime: Handle,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// Create a debouncer on the current runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(delay: Duration) -> Self {
        Self::with_runtime(delay, Handle::current())
    }

    pub fn with_runtime(delay: Duration, runtime: Handle) -> Self {
        Self {
            delay,
            runtime,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancel the pending timer and arm a new one running `action`
    ///
    /// Once the timer fires the action runs as its own task, so a later
    /// trigger cancels only timers that have not fired yet.
    pub fn trigger<F>(&self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let runtime = self.runtime.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            runtime.spawn(action);
        });

        if let Some(previous) = self.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Cancel the pending timer, returns whether one was pending
    pub fn cancel(&self) -> bool {
        match self.lock().take() {
            Some(timer) => {
                let was_pending = !timer.is_finished();
                timer.abort();
                was_pending
            }
            None => false,
        }
    }

    /// Whether a timer is armed and has not fired yet
    pub fn is_pending(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
