//! Library configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/persistate/config.toml)
//! 3. Environment variables (PERSISTATE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::history::{HistoryOptions, DEFAULT_HISTORY_LIMIT};
use crate::storage::DocumentStoreOptions;

/// Environment variable prefix
const ENV_PREFIX: &str = "PERSISTATE";

/// Database name used by the document store backend
pub const DOCUMENT_DATABASE: &str = "persistate";

/// Object store name used by the document store backend
pub const DOCUMENT_STORE: &str = "state";

/// On-disk backend used by stores built from a config
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Key-value storage area in a single SQLite file
    #[default]
    Area,
    /// Document store database under `documents/`
    Documents,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "area" => Ok(Self::Area),
            "documents" | "document" => Ok(Self::Documents),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

/// Persistence, sync and history settings shared by every store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory for on-disk backends (document store, storage areas)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Where persisted state is written
    #[serde(default)]
    pub backend: Backend,

    /// Quiet period before a commit is written to storage
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,

    /// Quiet period before a commit is broadcast to other contexts
    #[serde(default = "default_sync_debounce_ms")]
    pub sync_debounce_ms: u64,

    /// Maximum number of undo steps
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Whether persisted payloads are compressed
    #[serde(default)]
    pub compress: bool,

    /// Whether stores sync across contexts
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: Backend::default(),
            persist_debounce_ms: default_persist_debounce_ms(),
            sync_debounce_ms: default_sync_debounce_ms(),
            history_limit: default_history_limit(),
            compress: false,
            sync_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (PERSISTATE_DATA_DIR, PERSISTATE_HISTORY_LIMIT, ...)
    /// 2. Config file (~/.config/persistate/config.toml or PERSISTATE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Unparseable numbers are ignored with a warning.
    fn apply_env_overrides(&mut self) {
        if let Some(val) = env_var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }

        if let Some(val) = env_var("BACKEND") {
            match val.parse() {
                Ok(backend) => self.backend = backend,
                Err(e) => warn!("Ignoring {}_BACKEND: {}", ENV_PREFIX, e),
            }
        }

        if let Some(ms) = env_parse("PERSIST_DEBOUNCE_MS") {
            self.persist_debounce_ms = ms;
        }

        if let Some(ms) = env_parse("SYNC_DEBOUNCE_MS") {
            self.sync_debounce_ms = ms;
        }

        if let Some(limit) = env_parse("HISTORY_LIMIT") {
            self.history_limit = limit;
        }

        if let Some(val) = env_var("COMPRESS") {
            self.compress = parse_flag(&val);
        }

        if let Some(val) = env_var("SYNC_ENABLED") {
            self.sync_enabled = parse_flag(&val);
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with PERSISTATE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Some(path) = env_var("CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("persistate")
            .join("config.toml")
    }

    /// Directory holding document store databases
    pub fn document_store_path(&self) -> PathBuf {
        self.data_dir.join("documents")
    }

    /// Document store location for the `documents` backend
    pub fn document_store_options(&self) -> DocumentStoreOptions {
        DocumentStoreOptions::new(self.document_store_path(), DOCUMENT_DATABASE, DOCUMENT_STORE)
    }

    /// Database file backing the persistent storage area
    pub fn area_path(&self) -> PathBuf {
        self.data_dir.join("local-storage.db")
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn sync_debounce(&self) -> Duration {
        Duration::from_millis(self.sync_debounce_ms)
    }

    pub fn history_options(&self) -> HistoryOptions {
        HistoryOptions {
            limit: self.history_limit,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}_{}={:?}: not a number", ENV_PREFIX, name, raw);
            None
        }
    }
}

fn parse_flag(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("persistate")
}

fn default_persist_debounce_ms() -> u64 {
    100
}

fn default_sync_debounce_ms() -> u64 {
    50
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "PERSISTATE_DATA_DIR",
        "PERSISTATE_BACKEND",
        "PERSISTATE_PERSIST_DEBOUNCE_MS",
        "PERSISTATE_SYNC_DEBOUNCE_MS",
        "PERSISTATE_HISTORY_LIMIT",
        "PERSISTATE_COMPRESS",
        "PERSISTATE_SYNC_ENABLED",
        "PERSISTATE_CONFIG",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.persist_debounce(), Duration::from_millis(100));
        assert_eq!(config.sync_debounce(), Duration::from_millis(50));
        assert_eq!(config.history_options(), HistoryOptions::default());
        assert!(!config.compress);
        assert!(config.sync_enabled);
        assert!(config.data_dir.ends_with("persistate"));
    }

    #[test]
    fn test_file_paths() {
        let config = Config {
            data_dir: PathBuf::from("/data/app"),
            ..Config::default()
        };

        assert_eq!(config.document_store_path(), PathBuf::from("/data/app/documents"));
        let options = config.document_store_options();
        assert_eq!(options.dir, Some(PathBuf::from("/data/app/documents")));
        assert_eq!(options.database, DOCUMENT_DATABASE);
        assert!(config.area_path().ends_with("local-storage.db"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("PERSISTATE_DATA_DIR", "/tmp/persistate-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/persistate-test"));
    }

    #[test]
    fn test_env_override_timings() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("PERSISTATE_PERSIST_DEBOUNCE_MS", "250");
        env::set_var("PERSISTATE_SYNC_DEBOUNCE_MS", " 10 ");
        env::set_var("PERSISTATE_HISTORY_LIMIT", "5");
        config.apply_env_overrides();

        assert_eq!(config.persist_debounce(), Duration::from_millis(250));
        assert_eq!(config.sync_debounce(), Duration::from_millis(10));
        assert_eq!(config.history_limit, 5);
    }

    #[test]
    fn test_env_override_invalid_number_is_ignored() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("PERSISTATE_HISTORY_LIMIT", "lots");
        config.apply_env_overrides();

        assert_eq!(config.history_limit, 50);
    }

    #[test]
    fn test_env_override_flags() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        assert!(config.sync_enabled);

        env::set_var("PERSISTATE_SYNC_ENABLED", "false");
        env::set_var("PERSISTATE_COMPRESS", "1");
        config.apply_env_overrides();
        assert!(!config.sync_enabled);
        assert!(config.compress);

        env::set_var("PERSISTATE_SYNC_ENABLED", "TRUE");
        env::set_var("PERSISTATE_COMPRESS", "no");
        config.apply_env_overrides();
        assert!(config.sync_enabled);
        assert!(!config.compress);
    }

    #[test]
    fn test_env_override_backend() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        assert_eq!(config.backend, Backend::Area);

        env::set_var("PERSISTATE_BACKEND", "Documents");
        config.apply_env_overrides();
        assert_eq!(config.backend, Backend::Documents);

        // Unknown names keep the current backend
        env::set_var("PERSISTATE_BACKEND", "indexeddb");
        config.apply_env_overrides();
        assert_eq!(config.backend, Backend::Documents);
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/persistate"),
            backend: Backend::Documents,
            persist_debounce_ms: 20,
            sync_debounce_ms: 5,
            history_limit: 10,
            compress: true,
            sync_enabled: false,
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("history_limit"));
        assert!(toml_str.contains("compress"));
        assert!(toml_str.contains("backend = \"documents\""));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            history_limit = 3
            compress = true
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.history_limit, 3);
        assert!(config.compress);
        // Unset fields keep their defaults
        assert_eq!(config.persist_debounce_ms, 100);
        assert!(config.sync_enabled);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::tempdir().unwrap();
        env::set_var("PERSISTATE_DATA_DIR", dir.path().join("data"));

        let path = dir.path().join("missing.toml");
        let config = Config::load_from_path(&path).unwrap();

        assert_eq!(config.history_limit, 50);
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_config_file_path_override() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("PERSISTATE_CONFIG", "/etc/persistate.toml");
        assert_eq!(
            Config::config_file_path(),
            PathBuf::from("/etc/persistate.toml")
        );
    }
}
