//! Per-share manifest files and their lifecycle.
//!
//! ```text
//! <backup_dir>/<mangled-share>.filelist   walk results, before chunking
//! <backup_dir>/<mangled-share>.journal    chunk-resolved changes
//! <backup_dir>/<mangled-share>.manifest   compacted snapshot
//! <backup_dir>/<mangled-share>.lock       held by the active writer
//! ```
//!
//! Compaction writes the new snapshot to a temp file, syncs it and renames it
//! over the old one; only then are the journal and file list deleted. Replaying
//! a journal onto the snapshot it produced changes nothing, so a crash at any
//! point is repaired by compacting again.

use std::path::PathBuf;

use hoard_codec::{
    read_records, read_records_or_empty, remove_if_exists, write_records_atomic, CodecError,
    FrameOptions, FramedReader, FramedWriter,
};
use hoard_config::{log_manifest_debug, log_manifest_info, mangle};
use hoard_lock::{LockGuard, Locker};
use hoard_pool::ChunkPool;
use hoard_refcnt::PoolRefCount;
use tracing::instrument;

use crate::entry::{FileManifest, JournalEntry};
use crate::index::IndexManifest;
use crate::Result;

/// Which index entries survive compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retain {
    /// Everything not removed by a journal REMOVE
    #[default]
    All,
    /// Only entries flagged by the current scan
    Viewed,
}

/// Where a manifest is in its lifecycle, judged from the files present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestState {
    /// Nothing on disk
    Absent,
    /// Snapshot only
    Clean,
    /// Journal or file list pending
    Journaling,
}

/// Outcome of a compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactStats {
    pub entries: u64,
    pub dropped: u64,
}

/// Descriptor of the four files backing one (host, backup, share).
#[derive(Debug, Clone)]
pub struct Manifest {
    dir: PathBuf,
    share: Vec<u8>,
    stem: String,
    opts: FrameOptions,
}

impl Manifest {
    pub fn new(backup_dir: impl Into<PathBuf>, share: &[u8], opts: FrameOptions) -> Self {
        Self {
            dir: backup_dir.into(),
            share: share.to_vec(),
            stem: mangle::mangle(share),
            opts,
        }
    }

    pub fn share(&self) -> &[u8] {
        &self.share
    }

    pub fn frame_options(&self) -> FrameOptions {
        self.opts
    }

    fn artifact(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.stem))
    }

    pub fn file_list_path(&self) -> PathBuf {
        self.artifact("filelist")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.artifact("journal")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.artifact("manifest")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.artifact("lock")
    }

    /// A compacted snapshot is present.
    pub fn exists(&self) -> bool {
        self.snapshot_path().is_file()
    }

    pub fn state(&self) -> ManifestState {
        if self.journal_path().exists() || self.file_list_path().exists() {
            ManifestState::Journaling
        } else if self.exists() {
            ManifestState::Clean
        } else {
            ManifestState::Absent
        }
    }

    /// Take the writer lock. Journal writes assume the caller holds it.
    pub fn lock(&self, locker: &dyn Locker) -> Result<LockGuard> {
        Ok(locker.acquire(&self.lock_path())?)
    }

    /// Snapshot entries. A missing snapshot is `CodecError::NotFound`.
    pub fn read_snapshot(&self) -> Result<FramedReader<FileManifest>> {
        Ok(read_records(self.snapshot_path(), self.opts)?)
    }

    pub fn read_journal(&self) -> Result<FramedReader<JournalEntry>> {
        Ok(read_records_or_empty(self.journal_path(), self.opts)?)
    }

    pub fn read_file_list(&self) -> Result<FramedReader<JournalEntry>> {
        Ok(read_records_or_empty(self.file_list_path(), self.opts)?)
    }

    /// Replay snapshot then journal into a fresh index.
    #[instrument(skip(self), level = "debug", fields(share = %mangle::mangle(&self.share)))]
    pub fn load_index(&self) -> Result<IndexManifest> {
        let mut index = IndexManifest::new();

        match self.read_snapshot() {
            Ok(snapshot) => {
                for frame in snapshot {
                    index.insert(frame?.record);
                }
            }
            Err(crate::ManifestError::Codec(CodecError::NotFound { .. })) => {}
            Err(e) => return Err(e),
        }

        let base = index.len();
        let mut replayed = 0u64;
        for frame in self.read_journal()? {
            index.apply(frame?.record);
            replayed += 1;
        }

        log_manifest_debug!(snapshot = base, journal = replayed, entries = index.len(), "index loaded");
        Ok(index)
    }

    fn append<I, T, F>(&self, path: PathBuf, source: I, mut mapping: F) -> Result<u64>
    where
        I: IntoIterator<Item = T>,
        F: FnMut(T) -> Option<JournalEntry>,
    {
        let mut writer = FramedWriter::append(path, self.opts)?;
        for item in source {
            if let Some(entry) = mapping(item) {
                writer.push(&entry)?;
            }
        }
        Ok(writer.finish()?)
    }

    /// Append mapped entries to the journal; items mapped to `None` are skipped.
    pub fn write_journal_entry<I, T, F>(&self, source: I, mapping: F) -> Result<u64>
    where
        I: IntoIterator<Item = T>,
        F: FnMut(T) -> Option<JournalEntry>,
    {
        self.append(self.journal_path(), source, mapping)
    }

    /// Append mapped entries to the file list.
    pub fn write_file_list_entry<I, T, F>(&self, source: I, mapping: F) -> Result<u64>
    where
        I: IntoIterator<Item = T>,
        F: FnMut(T) -> Option<JournalEntry>,
    {
        self.append(self.file_list_path(), source, mapping)
    }

    /// Open the journal for incremental appends.
    pub fn journal_writer(&self) -> Result<FramedWriter<JournalEntry>> {
        Ok(FramedWriter::append(self.journal_path(), self.opts)?)
    }

    pub fn file_list_writer(&self) -> Result<FramedWriter<JournalEntry>> {
        Ok(FramedWriter::append(self.file_list_path(), self.opts)?)
    }

    /// Fold the journal into a new snapshot.
    pub fn compact(&self) -> Result<CompactStats> {
        let index = self.load_index()?;
        self.compact_with(index, Retain::All)
    }

    /// Write `index` as the new snapshot, then retire journal and file list.
    ///
    /// Nothing is deleted unless the new snapshot was fully written.
    #[instrument(skip(self, index), level = "debug", fields(share = %mangle::mangle(&self.share)))]
    pub fn compact_with(&self, index: IndexManifest, retain: Retain) -> Result<CompactStats> {
        let total = index.len() as u64;
        let kept = index
            .iter()
            .filter(|e| retain == Retain::All || e.mark_viewed)
            .count() as u64;

        let manifests = index
            .iter()
            .filter(|e| retain == Retain::All || e.mark_viewed)
            .map(|e| &e.manifest);
        write_records_atomic(self.snapshot_path(), manifests, self.opts)?;

        remove_if_exists(self.journal_path())?;
        remove_if_exists(self.file_list_path())?;

        let stats = CompactStats {
            entries: kept,
            dropped: total - kept,
        };
        log_manifest_info!(
            share = %mangle::mangle(&self.share),
            entries = stats.entries,
            dropped = stats.dropped,
            "manifest compacted"
        );
        Ok(stats)
    }

    /// Start this manifest from `previous`'s current state.
    ///
    /// Returns false when `previous` has nothing to offer.
    pub fn seed_from(&self, previous: &Manifest) -> Result<bool> {
        if previous.state() == ManifestState::Absent {
            return Ok(false);
        }
        let index = previous.load_index()?;
        write_records_atomic(self.snapshot_path(), index.iter().map(|e| &e.manifest), self.opts)?;
        Ok(true)
    }

    /// Delete every artifact of this manifest.
    pub fn remove(&self) -> Result<()> {
        for path in [
            self.file_list_path(),
            self.journal_path(),
            self.snapshot_path(),
            self.lock_path(),
        ] {
            remove_if_exists(path)?;
        }
        Ok(())
    }

    /// One `+1` reference per chunk of the snapshot, for rebuilding refcounts.
    pub fn generate_refcnt_from_manifest(
        &self,
        pool: &ChunkPool,
        chunk_size: u64,
    ) -> Result<Vec<PoolRefCount>> {
        let mut refs = Vec::new();
        for frame in self.read_snapshot()? {
            let manifest = frame?.record;
            for (hash, (_, len)) in manifest.chunks.iter().zip(manifest.chunk_ranges(chunk_size)) {
                refs.push(PoolRefCount {
                    hash: *hash,
                    ref_count: 1,
                    size: len,
                    compressed_size: pool.compressed_size(hash).unwrap_or(0),
                });
            }
        }
        Ok(refs)
    }
}
