//! # hoard-manifest
//!
//! Authoritative record of one share's file tree across backups.
//!
//! A share is journaled while a backup runs and compacted into a snapshot
//! afterwards. [`IndexManifest`] is the in-memory replay of both and decides
//! which chunks can be taken from the pool as-is.
//!
//! ## Lifecycle
//!
//! ```text
//! Absent ──run──► Journaling ──compact──► Clean ──run──► Journaling ...
//!                                   │
//!                                remove ──► Absent
//! ```

pub mod backup;
pub mod entry;
pub mod index;
#[cfg(unix)]
pub mod local;
pub mod manifest;

pub use backup::{BackupOptions, BackupRun, ChunkFetcher, RunStats};
pub use entry::{AclEntry, AclTag, FileManifest, FileStat, JournalEntry};
pub use index::{normalize_path, IndexEntry, IndexManifest, ManifestStats};
#[cfg(unix)]
pub use local::LocalShare;
pub use manifest::{CompactStats, Manifest, ManifestState, Retain};

use thiserror::Error;

/// Errors that can occur during manifest operations
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] hoard_codec::CodecError),

    #[error(transparent)]
    Pool(#[from] hoard_pool::PoolError),

    #[error(transparent)]
    Lock(#[from] hoard_lock::LockError),

    #[error(transparent)]
    RefCnt(#[from] hoard_refcnt::RefCntError),

    #[error("Cannot fetch {path}: {reason}")]
    Fetch { path: String, reason: String },

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Invalid backup options: {0}")]
    InvalidOptions(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;
