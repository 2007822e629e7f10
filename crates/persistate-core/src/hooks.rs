//! Post-commit hook
//!
//! The owning store calls every registered observer after each commit with
//! the previous state, the next state and an optional action label.
//! Observers are independent of each other and must not rely on running
//! before or after any sibling.

use std::sync::{Arc, Mutex};

use serde_json::Value;

/// One committed state transition
#[derive(Debug, Clone, Copy)]
pub struct Commit<'a> {
    pub previous: &'a Value,
    pub next: &'a Value,
    pub action: Option<&'a str>,
}

/// Something that reacts to commits
pub trait CommitObserver: Send + Sync {
    fn on_commit(&self, commit: &Commit<'_>);
}

impl<F> CommitObserver for F
where
    F: Fn(&Commit<'_>) + Send + Sync,
{
    fn on_commit(&self, commit: &Commit<'_>) {
        self(commit)
    }
}

/// Handle returned by [`CommitHooks::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Ordered set of commit observers
#[derive(Default)]
pub struct CommitHooks {
    observers: Mutex<Vec<(ObserverId, Arc<dyn CommitObserver>)>>,
    next_id: Mutex<u64>,
}

impl CommitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer at the end of the set
    pub fn register(&self, observer: Arc<dyn CommitObserver>) -> ObserverId {
        let id = {
            let mut next_id = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            *next_id += 1;
            ObserverId(*next_id)
        };
        self.lock().push((id, observer));
        id
    }

    /// Remove an observer, returns whether it was registered
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    /// Call every observer in registration order
    ///
    /// Observers are called without holding the set's lock, so an observer
    /// may register or unregister others; such changes apply from the next
    /// commit on.
    pub fn notify(&self, previous: &Value, next: &Value, action: Option<&str>) {
        let observers: Vec<Arc<dyn CommitObserver>> = self
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        let commit = Commit {
            previous,
            next,
            action,
        };
        for observer in observers {
            observer.on_commit(&commit);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ObserverId, Arc<dyn CommitObserver>)>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn CommitObserver> {
        let log = Arc::clone(log);
        Arc::new(move |commit: &Commit<'_>| {
            log.lock()
                .unwrap()
                .push(format!("{}:{}", name, commit.action.unwrap_or("-")));
        })
    }

    #[test]
    fn test_notify_in_registration_order() {
        let hooks = CommitHooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        hooks.register(recorder(&log, "persist"));
        hooks.register(recorder(&log, "sync"));
        hooks.notify(&json!({}), &json!({"a": 1}), Some("add"));

        assert_eq!(*log.lock().unwrap(), vec!["persist:add", "sync:add"]);
    }

    #[test]
    fn test_unregister() {
        let hooks = CommitHooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = hooks.register(recorder(&log, "first"));
        hooks.register(recorder(&log, "second"));

        assert!(hooks.unregister(first));
        assert!(!hooks.unregister(first));
        assert_eq!(hooks.len(), 1);

        hooks.notify(&json!({}), &json!({}), None);
        assert_eq!(*log.lock().unwrap(), vec!["second:-"]);
    }

    #[test]
    fn test_commit_carries_both_states() {
        let hooks = CommitHooks::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);

        hooks.register(Arc::new(move |commit: &Commit<'_>| {
            *sink.lock().unwrap() = Some((commit.previous.clone(), commit.next.clone()));
        }));
        hooks.notify(&json!({"n": 1}), &json!({"n": 2}), None);

        assert_eq!(
            seen.lock().unwrap().clone(),
            Some((json!({"n": 1}), json!({"n": 2})))
        );
    }
}
