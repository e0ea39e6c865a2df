//! # hoard-refcnt
//!
//! Garbage-collection accounting for pool chunks.
//!
//! A backup run appends `+1` deltas to its journal (`REFCNT`). Compaction folds
//! the journal into three persisted scopes:
//!
//! | Scope  | File                               |
//! |--------|------------------------------------|
//! | backup | `<hosts>/<host>/<n>/REFCNT.backup` |
//! | host   | `<hosts>/<host>/REFCNT.host`       |
//! | pool   | `<pool>/REFCNT.pool`               |
//!
//! Chunks whose pool-scope count dropped to zero or below are reported by
//! [`RefCntEngine::unused_chunks`]; removing them from the pool is up to the
//! caller.

mod descriptor;
mod engine;
mod journal;
mod record;

pub use descriptor::{pool_file, statistics_path, ReferenceCount, Scope};
pub use engine::{read_statistics, RefCntEngine, RefCntRecords};
pub use journal::RefCntJournal;
pub use record::{merge_into, PoolRefCount, RefCntMap, RefCntStatistics};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RefCntError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] hoard_codec::CodecError),

    #[error(transparent)]
    Lock(#[from] hoard_lock::LockError),

    #[error("Statistics error: {0}")]
    Stats(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RefCntError>;
