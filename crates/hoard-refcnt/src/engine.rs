//! Journal compaction and single-chunk adjustments.
//!
//! Every read-modify-write of a scope file happens under that file's lock
//! (`<scope>.lock`). Scopes are compacted one after the other, each under its
//! own lock: a failure part way leaves earlier scopes updated and the journal
//! in place.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use hoard_codec::{read_records_or_empty, remove_if_exists, write_records, write_records_atomic, FrameOptions};
use hoard_config::{log_refcnt_debug, log_refcnt_info, log_refcnt_warn, Config};
use hoard_lock::{lock_path_for, FileLocker, LockGuard, Locker};
use hoard_pool::ChunkHash;
use tracing::instrument;

use crate::descriptor::{statistics_path, ReferenceCount, Scope};
use crate::record::{merge_into, PoolRefCount, RefCntMap, RefCntStatistics};
use crate::Result;

/// Lazy sequence of records from one refcount file.
///
/// Ends quietly at the first unreadable frame; a missing or corrupt file is
/// the same as one with no references.
pub struct RefCntRecords {
    inner: Option<hoard_codec::FramedReader<PoolRefCount>>,
}

impl Iterator for RefCntRecords {
    type Item = PoolRefCount;

    fn next(&mut self) -> Option<PoolRefCount> {
        let reader = self.inner.as_mut()?;
        match reader.next() {
            Some(Ok(frame)) => Some(frame.record),
            Some(Err(e)) => {
                log_refcnt_warn!(error = %e, "stopping at unreadable refcount record");
                self.inner = None;
                None
            }
            None => {
                self.inner = None;
                None
            }
        }
    }
}

/// Reference-count engine over one set of framing options and a lock provider.
#[derive(Clone)]
pub struct RefCntEngine {
    locker: Arc<dyn Locker>,
    opts: FrameOptions,
}

impl RefCntEngine {
    pub fn new(locker: Arc<dyn Locker>, opts: FrameOptions) -> Self {
        Self { locker, opts }
    }

    /// Cross-process file locks and journal encoding from `cfg`.
    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            Arc::new(FileLocker::from_config(&cfg.locks)),
            FrameOptions::from(&cfg.journal),
        )
    }

    pub fn frame_options(&self) -> FrameOptions {
        self.opts
    }

    fn lock(&self, path: &Path) -> Result<LockGuard> {
        Ok(self.locker.acquire(&lock_path_for(path))?)
    }

    /// Append `source` to `path`, or replace `path` with it atomically.
    pub fn write_ref_cnt<I>(&self, source: I, path: &Path, append: bool) -> Result<u64>
    where
        I: IntoIterator<Item = PoolRefCount>,
    {
        let written = if append {
            write_records(path, source, self.opts)?
        } else {
            write_records_atomic(path, source, self.opts)?
        };
        Ok(written)
    }

    /// Records stored at `path`; empty when the file is missing or unreadable.
    pub fn read_ref_cnt(&self, path: &Path) -> RefCntRecords {
        let inner = match read_records_or_empty(path, self.opts) {
            Ok(reader) => Some(reader),
            Err(e) => {
                log_refcnt_warn!(path = %path.display(), error = %e, "cannot open refcount file");
                None
            }
        };
        RefCntRecords { inner }
    }

    /// Load a scope for rewriting. Unlike [`RefCntEngine::read_ref_cnt`], a
    /// damaged file is an error so it is never rewritten with records missing.
    fn read_map(&self, path: &Path) -> Result<RefCntMap> {
        let mut records = Vec::new();
        for frame in read_records_or_empty::<PoolRefCount, _>(path, self.opts)? {
            records.push(frame?.record);
        }
        let mut map = RefCntMap::new();
        merge_into(&mut map, records, 1);
        Ok(map)
    }

    /// Rewrite one scope file and, for host and pool, its statistics.
    fn store_scope(&self, scope: Scope, path: &Path, map: &RefCntMap) -> Result<RefCntStatistics> {
        write_records_atomic(path, map.values().copied(), self.opts)?;
        let stats = RefCntStatistics::collect(map.values());
        if scope.persists_statistics() {
            write_statistics(path, &stats)?;
        }
        Ok(stats)
    }

    /// Fold `deltas` (scaled by `sign`) into one scope file under its lock.
    fn apply_to_scope(
        &self,
        scope: Scope,
        path: &Path,
        deltas: &RefCntMap,
        sign: i64,
    ) -> Result<RefCntStatistics> {
        let _guard = self.lock(path)?;
        let mut map = self.read_map(path)?;
        merge_into(&mut map, deltas.values().copied(), sign);
        let stats = self.store_scope(scope, path, &map)?;
        log_refcnt_debug!(
            scope = %scope,
            path = %path.display(),
            chunks = stats.chunk_count,
            unused = stats.unused_count,
            "scope updated"
        );
        Ok(stats)
    }

    /// Merge the journal into the backup, host and pool scopes, then delete it.
    ///
    /// Returns the resulting statistics per scope. Scopes are not updated as an
    /// atomic set; a failure leaves the journal for a later retry.
    #[instrument(skip(self), level = "debug", fields(journal = %desc.journal.display()))]
    pub fn compact_ref_cnt(&self, desc: &ReferenceCount) -> Result<Vec<(Scope, RefCntStatistics)>> {
        let journal = {
            let _guard = self.lock(&desc.journal)?;
            self.read_map(&desc.journal)?
        };
        if journal.is_empty() {
            remove_if_exists(&desc.journal)?;
            return Ok(Vec::new());
        }

        let mut report = Vec::with_capacity(Scope::ALL.len());
        for scope in Scope::ALL {
            let stats = self.apply_to_scope(scope, desc.scope(scope), &journal, 1)?;
            report.push((scope, stats));
        }

        {
            let _guard = self.lock(&desc.journal)?;
            remove_if_exists(&desc.journal)?;
        }
        log_refcnt_info!(
            journal = %desc.journal.display(),
            chunks = journal.len(),
            "refcount journal compacted"
        );
        Ok(report)
    }

    /// Subtract a backup's scope from its host and pool scopes and delete it.
    #[instrument(skip(self), level = "debug", fields(backup = %desc.backup.display()))]
    pub fn remove_backup(&self, desc: &ReferenceCount) -> Result<()> {
        let _backup_guard = self.lock(&desc.backup)?;
        let backup = self.read_map(&desc.backup)?;

        for scope in [Scope::Host, Scope::Pool] {
            self.apply_to_scope(scope, desc.scope(scope), &backup, -1)?;
        }
        remove_if_exists(&desc.backup)?;
        log_refcnt_info!(backup = %desc.backup.display(), chunks = backup.len(), "backup references removed");
        Ok(())
    }

    fn adjust(&self, path: &Path, hash: &ChunkHash, delta: i64) -> Result<i64> {
        let _guard = self.lock(path)?;
        let mut map = self.read_map(path)?;
        let record = map.entry(*hash).or_insert(PoolRefCount {
            hash: *hash,
            ref_count: 0,
            size: 0,
            compressed_size: 0,
        });
        record.ref_count += delta;
        let count = record.ref_count;
        if count < 0 {
            log_refcnt_warn!(hash = %hash, count, path = %path.display(), "reference count below zero");
        }
        write_records_atomic(path, map.values().copied(), self.opts)?;
        Ok(count)
    }

    /// Add one reference to `hash` in the scope file at `path`. Returns the new count.
    pub fn incr(&self, path: &Path, hash: &ChunkHash) -> Result<i64> {
        self.adjust(path, hash, 1)
    }

    /// Drop one reference. Going below zero is allowed.
    pub fn decr(&self, path: &Path, hash: &ChunkHash) -> Result<i64> {
        self.adjust(path, hash, -1)
    }

    /// Hashes whose count in the pool scope file is zero or less.
    pub fn unused_chunks(&self, pool_scope: &Path) -> impl Iterator<Item = ChunkHash> {
        self.read_ref_cnt(pool_scope)
            .filter(PoolRefCount::is_unused)
            .map(|r| r.hash)
    }
}

fn write_statistics(scope_path: &Path, stats: &RefCntStatistics) -> Result<()> {
    let path = statistics_path(scope_path);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".stats-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    let mut writer = BufWriter::new(tmp.as_file());
    serde_json::to_writer_pretty(&mut writer, stats)?;
    writer.flush()?;
    drop(writer);
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(())
}

/// Statistics last written for the scope file at `scope_path`.
pub fn read_statistics(scope_path: &Path) -> Result<Option<RefCntStatistics>> {
    let path = statistics_path(scope_path);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
