//! Migration runner
//!
//! Upgrades persisted data one version at a time. A migration registered
//! under version `n` turns version `n - 1` data into version `n` data.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use tracing::{debug, warn};

/// Upgrade function for one version step
pub type MigrationFn = Box<dyn Fn(Value) -> Value + Send + Sync>;

/// Registered migrations, keyed by the version they produce
#[derive(Default)]
pub struct Migrations {
    steps: BTreeMap<u32, MigrationFn>,
}

impl fmt::Debug for Migrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrations")
            .field("versions", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Migrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step producing `version`, replacing any previous one
    pub fn register<F>(mut self, version: u32, migrate: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.steps.insert(version, Box::new(migrate));
        self
    }

    /// Highest version with a registered step
    pub fn latest_version(&self) -> Option<u32> {
        self.steps.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Upgrade `data` from version `from` to version `to`
    ///
    /// Applies the steps for `from + 1 ..= to` in ascending order. Versions
    /// without a step pass the data through unchanged. Downgrades are not
    /// supported; the data is returned as is.
    pub fn run(&self, data: Value, from: u32, to: u32) -> Value {
        if from > to {
            warn!(
                "Stored data is version {} but target is {}, skipping migrations",
                from, to
            );
            return data;
        }
        if from == to {
            return data;
        }

        self.steps
            .range(from + 1..=to)
            .fold(data, |acc, (version, migrate)| {
                debug!("Migrating persisted data to version {}", version);
                migrate(acc)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_field(name: &'static str) -> impl Fn(Value) -> Value + Send + Sync {
        move |mut value| {
            if let Value::Object(map) = &mut value {
                map.insert(name.to_string(), json!(true));
            }
            value
        }
    }

    #[test]
    fn test_runs_steps_in_order() {
        let migrations = Migrations::new()
            .register(3, |v| json!({"v3": v}))
            .register(2, |v| json!({"v2": v}));

        let result = migrations.run(json!("data"), 1, 3);

        // f3(f2(data))
        assert_eq!(result, json!({"v3": {"v2": "data"}}));
    }

    #[test]
    fn test_missing_step_is_pass_through() {
        let migrations = Migrations::new()
            .register(2, add_field("two"))
            .register(4, add_field("four"));

        let result = migrations.run(json!({}), 1, 4);
        assert_eq!(result, json!({"two": true, "four": true}));
    }

    #[test]
    fn test_only_steps_above_stored_version_run() {
        let migrations = Migrations::new()
            .register(2, add_field("two"))
            .register(3, add_field("three"));

        assert_eq!(migrations.run(json!({}), 2, 3), json!({"three": true}));
        assert_eq!(migrations.run(json!({}), 3, 3), json!({}));
    }

    #[test]
    fn test_downgrade_leaves_data_alone() {
        let migrations = Migrations::new().register(2, add_field("two"));
        assert_eq!(migrations.run(json!({"a": 1}), 5, 2), json!({"a": 1}));
    }

    #[test]
    fn test_latest_version() {
        assert_eq!(Migrations::new().latest_version(), None);

        let migrations = Migrations::new()
            .register(7, add_field("seven"))
            .register(3, add_field("three"));
        assert_eq!(migrations.latest_version(), Some(7));
        assert_eq!(migrations.len(), 2);
    }
}
