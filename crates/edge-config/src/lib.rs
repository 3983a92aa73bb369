//! # edge-config
//!
//! Configuration for the edge block-file cache.
//!
//! Loads configuration from:
//! 1. `~/.edge/config.toml` (global)
//! 2. `.edge/config.toml` (local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use edge_bfs::FsOptions;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogLevel;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> =
    Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Snapshot of the global config
pub fn config() -> Config {
    match CONFIG.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    match CONFIG.write() {
        Ok(mut guard) => *guard = new_config,
        Err(poisoned) => *poisoned.into_inner() = new_config,
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML encode error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let mut config = Self::load_from(global.as_deref(), Some(Path::new(".edge/config.toml")))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from explicit files; missing files are skipped.
    pub fn load_from(global: Option<&Path>, local: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = global.filter(|p| p.exists()) {
            debug!("Loading global config from {:?}", path);
            config = toml::from_str(&std::fs::read_to_string(path)?)?;
        }

        if let Some(path) = local.filter(|p| p.exists()) {
            debug!("Loading local config from {:?}", path);
            let local_config: Config = toml::from_str(&std::fs::read_to_string(path)?)?;
            config.merge(local_config);
        }

        Ok(config)
    }

    /// Global config path: ~/.edge/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".edge/config.toml"))
    }

    /// Merge another config; only values it actually sets win.
    fn merge(&mut self, other: Config) {
        let defaults = StorageConfig::default();
        if other.storage.dir != defaults.dir {
            self.storage.dir = other.storage.dir;
        }

        let (fs, theirs) = (&mut self.storage.fs, other.storage.fs);
        if theirs.max_open_files != 0 {
            fs.max_open_files = theirs.max_open_files;
        }
        if theirs.bytes_per_sync != 0 {
            fs.bytes_per_sync = theirs.bytes_per_sync;
        }
        if theirs.sync_timeout_secs != 0 {
            fs.sync_timeout_secs = theirs.sync_timeout_secs;
        }
        if theirs.max_sync_files != 0 {
            fs.max_sync_files = theirs.max_sync_files;
        }
        if theirs.read_threads != 0 {
            fs.read_threads = theirs.read_threads;
        }
        if theirs.write_threads != 0 {
            fs.write_threads = theirs.write_threads;
        }
        if theirs.compact_min_stale != 0 {
            fs.compact_min_stale = theirs.compact_min_stale;
        }
        if theirs.compact_stale_ratio > 0.0 {
            fs.compact_stale_ratio = theirs.compact_stale_ratio;
        }

        if other.log.level != LogConfig::default().level {
            self.log.level = other.log.level;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("EDGE_BFS_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
        if let Some(n) = lookup("EDGE_BFS_MAX_OPEN_FILES").and_then(|v| v.parse().ok()) {
            self.storage.fs.max_open_files = n;
        }
        if let Some(n) = lookup("EDGE_BFS_BYTES_PER_SYNC").and_then(|v| v.parse().ok()) {
            self.storage.fs.bytes_per_sync = n;
        }
        if let Some(level) = lookup("EDGE_LOG_LEVEL").and_then(|v| v.parse().ok()) {
            self.log.level = level;
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Cache directory; a leading `~/` is expanded
    pub dir: PathBuf,
    /// Engine tuning, zero means "compute a default"
    pub fs: FsOptions,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.edge/cache"),
            fs: FsOptions::default(),
        }
    }
}

impl StorageConfig {
    /// `dir` with `~` expanded to the home directory.
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(&self.dir)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.fs, FsOptions::default());
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml().unwrap();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[storage.fs]"));
        assert!(toml_str.contains("[log]"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = Config::default();
        config.storage.fs.max_open_files = 512;
        config.log.level = LogLevel::Debug;
        let parsed: Config = toml::from_str(&toml::to_string(&config).unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("EDGE_BFS_DIR", "/var/cache/edge"),
            ("EDGE_BFS_MAX_OPEN_FILES", "99"),
            ("EDGE_BFS_BYTES_PER_SYNC", "not-a-number"),
            ("EDGE_LOG_LEVEL", "trace"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.storage.dir, PathBuf::from("/var/cache/edge"));
        assert_eq!(config.storage.fs.max_open_files, 99);
        assert_eq!(config.storage.fs.bytes_per_sync, 0);
        assert_eq!(config.log.level, LogLevel::Trace);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/x")), home.join("x"));
        }
    }
}
