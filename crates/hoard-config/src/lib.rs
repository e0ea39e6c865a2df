//! # hoard-config
//!
//! Configuration management for the hoard backup store.
//!
//! Loads configuration from:
//! 1. `~/.hoard/config.toml` (global)
//! 2. `.hoard/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod layout;
pub mod logging;
pub mod mangle;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    pub integrity: IntegrityConfig,
    pub pipeline: PipelineConfig,
    pub locks: LockConfig,
    pub journal: JournalConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        Self::load_from(global.as_deref(), Some(Path::new(".hoard/config.toml")))
    }

    /// Load config from explicit global/project files, then apply env overrides.
    ///
    /// Missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = global.filter(|p| p.exists()) {
            debug!("Loading global config from {:?}", global_path);
            let contents = std::fs::read_to_string(global_path)?;
            config = toml::from_str(&contents)?;
        }

        if let Some(project_path) = project.filter(|p| p.exists()) {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Reject values that would make backups silently lose content.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "chunking.chunk_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Global config path: ~/.hoard/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".hoard/config.toml"))
    }

    /// Merge another config. Fields the other config leaves at their default keep our value.
    fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.storage.pool_root != defaults.storage.pool_root {
            self.storage.pool_root = other.storage.pool_root;
        }
        if other.storage.hosts_root != defaults.storage.hosts_root {
            self.storage.hosts_root = other.storage.hosts_root;
        }
        if other.chunking != defaults.chunking {
            self.chunking = other.chunking;
        }
        if other.integrity != defaults.integrity {
            self.integrity = other.integrity;
        }
        if other.pipeline.parallelism != defaults.pipeline.parallelism {
            self.pipeline.parallelism = other.pipeline.parallelism;
        }
        if other.pipeline.channel_capacity != defaults.pipeline.channel_capacity {
            self.pipeline.channel_capacity = other.pipeline.channel_capacity;
        }
        if other.locks != defaults.locks {
            self.locks = other.locks;
        }
        if other.journal != defaults.journal {
            self.journal = other.journal;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("HOARD_POOL_ROOT") {
            self.storage.pool_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("HOARD_HOSTS_ROOT") {
            self.storage.hosts_root = PathBuf::from(path);
        }
        if let Ok(threads) = std::env::var("HOARD_THREADS") {
            if let Ok(n) = threads.parse() {
                self.pipeline.parallelism = n;
            }
        }
        if let Ok(strict) = std::env::var("HOARD_STRICT_INTEGRITY") {
            self.integrity.strict = matches!(strict.as_str(), "1" | "true" | "yes");
        }
        if let Ok(timeout) = std::env::var("HOARD_LOCK_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.locks.timeout_secs = secs;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the content-addressed chunk pool
    pub pool_root: PathBuf,
    /// Root of the per-host backup directories
    pub hosts_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool_root: PathBuf::from("/var/lib/hoard/pool"),
            hosts_root: PathBuf::from("/var/lib/hoard/hosts"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum uncompressed chunk length in bytes
    pub chunk_size: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Reject chunk reads whose recomputed hash differs from the requested one.
    /// When false, mismatches are logged and the recomputed hash is returned.
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of files materialized concurrently
    pub parallelism: usize,
    /// Refcount records buffered between workers and the refcount writer
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallelism: 20,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            poll_interval_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Framing options shared by manifests and refcount files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub compress: bool,
    /// zlib level, 0-9
    pub compression_level: u32,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            compress: true,
            compression_level: 6,
        }
    }
}
