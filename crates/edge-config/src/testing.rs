//! Isolated cache environments for tests.
//!
//! # Usage
//!
//! ```ignore
//! use edge_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new()?;
//! let fs = edge_bfs::Fs::open(&env.cache_dir, env.config().storage.fs)?;
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Temporary cache directory plus a scratch area for input files
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Cache directory handed to the engine
    pub cache_dir: PathBuf,
    /// Scratch files (uploads, downloads)
    pub work_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let cache_dir = root.join("cache");
        let work_dir = root.join("work");
        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&work_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            cache_dir,
            work_dir,
            test_id,
        })
    }

    /// Config pointing at this environment, with small fixed engine limits
    /// so tests never measure the disk.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.dir = self.cache_dir.clone();
        cfg.storage.fs.max_open_files = 64;
        cfg.storage.fs.bytes_per_sync = 1 << 20;
        cfg
    }

    /// Write `config()` as TOML to `<work_dir>/config.toml`.
    pub fn write_config(&self) -> anyhow::Result<PathBuf> {
        let path = self.work_dir.join("config.toml");
        std::fs::write(&path, toml::to_string_pretty(&self.config())?)?;
        Ok(path)
    }

    /// Create a scratch file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.work_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}
