//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary pool root
//! - Temporary hosts root (per-backup manifests and refcounts)
//! - A share root that tests populate with files
//!
//! # Usage
//!
//! ```ignore
//! use hoard_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new().unwrap();
//! env.create_file("docs/a.txt", b"hello").unwrap();
//! let cfg = env.config();
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::layout;
use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    pub pool_root: PathBuf,
    pub hosts_root: PathBuf,
    /// Directory standing in for the backed-up share
    pub share_root: PathBuf,
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let pool_root = root.join("pool");
        let hosts_root = root.join("hosts");
        let share_root = root.join("share");

        std::fs::create_dir_all(&pool_root)?;
        std::fs::create_dir_all(&hosts_root)?;
        std::fs::create_dir_all(&share_root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            pool_root,
            hosts_root,
            share_root,
            test_id,
        })
    }

    /// Config pointing at this environment, with short lock timeouts
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.pool_root = self.pool_root.clone();
        cfg.storage.hosts_root = self.hosts_root.clone();
        cfg.locks.timeout_secs = 2;
        cfg.locks.poll_interval_ms = 10;
        cfg
    }

    /// Backup directory for `host`/`number`, created on demand
    pub fn backup_dir(&self, host: &str, number: u32) -> anyhow::Result<PathBuf> {
        let dir = layout::backup_dir(&self.hosts_root, host, number);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Create a file under the share root
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.share_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a directory under the share root
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.share_root.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn remove_file(&self, relative_path: &str) -> anyhow::Result<()> {
        std::fs::remove_file(self.share_root.join(relative_path))?;
        Ok(())
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.pool_root.exists());
        assert!(env.hosts_root.exists());
        assert!(env.share_root.exists());
    }

    #[test]
    fn test_environment_isolation() {
        let a = TestEnvironment::new().unwrap();
        let b = TestEnvironment::new().unwrap();
        assert_ne!(a.test_id, b.test_id);
        assert_ne!(a.pool_root, b.pool_root);
    }

    #[test]
    fn test_config_points_at_environment() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        assert_eq!(cfg.storage.pool_root, env.pool_root);
        assert_eq!(cfg.locks.timeout_secs, 2);
    }

    #[test]
    fn test_create_file_nested() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("a/b/c.txt", b"x").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"x");
        assert!(env.backup_dir("host", 1).unwrap().is_dir());
    }
}
