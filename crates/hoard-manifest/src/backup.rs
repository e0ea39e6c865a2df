//! One backup run of a share: walk entries in, journal and refcount deltas out.
//!
//! ```text
//! entries ──► file list (ordered)
//!    │
//!    └─► window of N ──rayon──► materialized entries ──► journal (ordered)
//!                        │
//!                        └──► bounded channel ──► refcount journal writer
//! ```
//!
//! Chunks of a file whose expected hash is already pooled are only re-read
//! locally; everything else is fetched from the origin and written to the pool.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::thread;

use crossbeam_channel::{bounded, Sender};
use hoard_codec::FrameOptions;
use hoard_config::{log_manifest_debug, log_manifest_info, log_manifest_warn, mangle, Config};
use hoard_pool::{ChunkHash, ChunkInformation, ChunkPool};
use hoard_refcnt::{PoolRefCount, RefCntJournal, ReferenceCount};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::entry::{FileManifest, JournalEntry};
use crate::index::IndexManifest;
use crate::manifest::Manifest;
use crate::{ManifestError, Result};

/// Source of file bytes for chunks missing from the pool.
pub trait ChunkFetcher: Send + Sync {
    /// Reader over `len` bytes of `path` starting at `offset`.
    fn fetch(&self, path: &[u8], offset: u64, len: u64) -> Result<Box<dyn Read + Send + '_>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupOptions {
    pub chunk_size: u64,
    /// Entries materialized concurrently
    pub parallelism: usize,
    /// Refcount deltas buffered before workers block
    pub channel_capacity: usize,
    /// Journal a REMOVE for every prior entry the walk did not produce
    pub detect_removals: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for BackupOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            chunk_size: cfg.chunking.chunk_size,
            parallelism: cfg.pipeline.parallelism.max(1),
            channel_capacity: cfg.pipeline.channel_capacity.max(1),
            detect_removals: true,
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Entries written to the journal
    pub entries: u64,
    pub files: u64,
    pub chunks_written: u64,
    pub chunks_reused: u64,
    pub integrity_mismatches: u64,
    pub failed_entries: u64,
    pub removed: u64,
    /// Uncompressed bytes of all materialized chunks
    pub bytes: u64,
    pub refcnt_records: u64,
}

impl RunStats {
    fn absorb(&mut self, other: &RunStats) {
        self.files += other.files;
        self.chunks_written += other.chunks_written;
        self.chunks_reused += other.chunks_reused;
        self.integrity_mismatches += other.integrity_mismatches;
        self.bytes += other.bytes;
    }
}

/// Sha256 as a `Write` sink.
struct FileHasher(Sha256);

impl Write for FileHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reader that feeds everything it yields into a `FileHasher`.
struct TeeReader<'a, R> {
    inner: R,
    hasher: &'a mut FileHasher,
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.0.update(&buf[..n]);
        Ok(n)
    }
}

struct Materialized {
    entry: JournalEntry,
    refs: Vec<PoolRefCount>,
    stats: RunStats,
}

/// Drives one share of one backup.
pub struct BackupRun<'a> {
    manifest: &'a Manifest,
    pool: &'a ChunkPool,
    fetcher: &'a dyn ChunkFetcher,
    refcnt_journal: PathBuf,
    refcnt_opts: FrameOptions,
    opts: BackupOptions,
}

impl<'a> BackupRun<'a> {
    pub fn new(
        manifest: &'a Manifest,
        pool: &'a ChunkPool,
        fetcher: &'a dyn ChunkFetcher,
        refcnt: &ReferenceCount,
        opts: BackupOptions,
    ) -> Self {
        Self {
            manifest,
            pool,
            fetcher,
            refcnt_journal: refcnt.journal.clone(),
            refcnt_opts: manifest.frame_options(),
            opts,
        }
    }

    /// Encoding of the refcount journal (defaults to the manifest's).
    pub fn with_refcnt_options(mut self, opts: FrameOptions) -> Self {
        self.refcnt_opts = opts;
        self
    }

    /// Consume `entries`, appending to the file list, journal and refcount journal.
    ///
    /// `index` is the prior state of the share (see [`Manifest::load_index`]);
    /// its viewed flags are reset and then set for every path the walk produced.
    /// A failing entry is logged and skipped; its previous version stays.
    #[instrument(skip_all, level = "debug", fields(share = %mangle::mangle(self.manifest.share())))]
    pub fn run<I>(&self, entries: I, index: &mut IndexManifest) -> Result<RunStats>
    where
        I: IntoIterator<Item = JournalEntry>,
    {
        if self.opts.chunk_size == 0 {
            return Err(ManifestError::InvalidOptions("chunk size must be greater than zero".into()));
        }
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(self.opts.parallelism)
            .thread_name(|i| format!("hoard-backup-{i}"))
            .build()
            .map_err(|e| ManifestError::Io(io::Error::other(e)))?;

        let (tx, rx) = bounded::<PoolRefCount>(self.opts.channel_capacity);
        let journal_path = self.refcnt_journal.clone();
        let refcnt_opts = self.refcnt_opts;

        thread::scope(|s| -> Result<RunStats> {
            let refcnt_writer = s.spawn(move || -> Result<u64> {
                let mut journal = RefCntJournal::open(&journal_path, refcnt_opts)?;
                for delta in rx {
                    journal.record(&delta)?;
                }
                Ok(journal.finish()?)
            });

            let outcome = self.drive(entries, index, &workers, &tx);
            drop(tx);

            let written = refcnt_writer
                .join()
                .map_err(|_| ManifestError::Io(io::Error::other("refcount writer panicked")))??;
            let mut stats = outcome?;
            stats.refcnt_records = written;

            log_manifest_info!(
                share = %mangle::mangle(self.manifest.share()),
                entries = stats.entries,
                written = stats.chunks_written,
                reused = stats.chunks_reused,
                failed = stats.failed_entries,
                removed = stats.removed,
                "backup run finished"
            );
            Ok(stats)
        })
    }

    fn drive<I>(
        &self,
        entries: I,
        index: &mut IndexManifest,
        workers: &rayon::ThreadPool,
        tx: &Sender<PoolRefCount>,
    ) -> Result<RunStats>
    where
        I: IntoIterator<Item = JournalEntry>,
    {
        let mut file_list = self.manifest.file_list_writer()?;
        let mut journal = self.manifest.journal_writer()?;
        let mut stats = RunStats::default();

        index.reset_viewed();

        let mut entries = entries.into_iter().peekable();
        let mut window = Vec::with_capacity(self.opts.parallelism);
        while entries.peek().is_some() {
            window.clear();
            window.extend(entries.by_ref().take(self.opts.parallelism));

            for entry in &window {
                file_list.push(entry)?;
                // A REMOVE from the origin is journaled as-is; keep the sweep from repeating it.
                index.mark_viewed(entry.path());
            }

            let prior: &IndexManifest = index;
            let results: Vec<_> = workers.install(|| {
                window
                    .par_iter()
                    .map(|entry| {
                        let previous = prior.get(entry.path()).map(|e| &e.manifest);
                        let mut stored = Vec::new();
                        let outcome = self.materialize(entry.clone(), previous, &mut stored);
                        // A dead writer surfaces its own error when joined.
                        match &outcome {
                            Ok(done) => {
                                for delta in &done.refs {
                                    let _ = tx.send(*delta);
                                }
                            }
                            // Chunks pooled before the failure stay visible to GC as unused.
                            Err(_) => {
                                for info in &stored {
                                    let _ = tx.send(PoolRefCount {
                                        ref_count: 0,
                                        ..PoolRefCount::reference(info)
                                    });
                                }
                            }
                        }
                        outcome
                    })
                    .collect()
            });

            for (entry, result) in window.iter().zip(results) {
                match result {
                    Ok(done) => {
                        journal.push(&done.entry)?;
                        stats.entries += 1;
                        stats.absorb(&done.stats);
                    }
                    Err(e) => {
                        log_manifest_warn!(
                            path = %String::from_utf8_lossy(entry.path()),
                            error = %e,
                            "entry failed, keeping previous version"
                        );
                        stats.failed_entries += 1;
                        if let Some(previous) = prior.get(entry.path()) {
                            for delta in self.prior_refs(&previous.manifest) {
                                let _ = tx.send(delta);
                            }
                        }
                    }
                }
            }
        }

        if self.opts.detect_removals {
            for gone in index.unviewed() {
                let entry = JournalEntry::Remove {
                    path: gone.path.clone(),
                };
                file_list.push(&entry)?;
                journal.push(&entry)?;
                stats.entries += 1;
                stats.removed += 1;
            }
        }

        file_list.finish()?;
        journal.finish()?;
        Ok(stats)
    }

    /// References still held by a file that kept its previous version.
    fn prior_refs(&self, previous: &FileManifest) -> Vec<PoolRefCount> {
        previous
            .chunks
            .iter()
            .zip(previous.chunk_ranges(self.opts.chunk_size))
            .map(|(hash, (_, len))| PoolRefCount {
                hash: *hash,
                ref_count: 1,
                size: len,
                compressed_size: self.pool.compressed_size(hash).unwrap_or(0),
            })
            .collect()
    }

    /// Resolve the chunks of one entry. Chunks newly added to the pool are
    /// collected in `stored`, also when the entry fails part way.
    fn materialize(
        &self,
        entry: JournalEntry,
        previous: Option<&FileManifest>,
        stored: &mut Vec<ChunkInformation>,
    ) -> Result<Materialized> {
        let (mut manifest, is_add) = match entry {
            JournalEntry::Remove { .. } => {
                return Ok(Materialized {
                    entry,
                    refs: Vec::new(),
                    stats: RunStats::default(),
                })
            }
            JournalEntry::Add(m) => (m, true),
            JournalEntry::Modify(m) => (m, false),
        };

        let mut stats = RunStats::default();
        let mut refs = Vec::new();

        if manifest.is_regular_file() {
            // The origin's own chunk list wins; otherwise trust the previous
            // version when the metadata says the content did not change.
            let expected = if !manifest.chunks.is_empty() {
                std::mem::take(&mut manifest.chunks)
            } else {
                match previous {
                    Some(prev) if prev.is_regular_file() && prev.looks_unchanged(&manifest) => {
                        prev.chunks.clone()
                    }
                    _ => Vec::new(),
                }
            };

            let mut hasher = FileHasher(Sha256::new());
            let mut chunks = Vec::with_capacity(manifest.expected_chunk_count(self.opts.chunk_size));
            for (i, (offset, len)) in manifest.chunk_ranges(self.opts.chunk_size).enumerate() {
                let (info, fresh) = self.chunk(&manifest, expected.get(i), offset, len, &mut hasher, &mut stats)?;
                if fresh {
                    stored.push(info);
                }
                if info.size != len {
                    log_manifest_warn!(
                        path = %String::from_utf8_lossy(&manifest.path),
                        offset,
                        expected = len,
                        actual = info.size,
                        "chunk length differs from file size"
                    );
                }
                stats.bytes += info.size;
                chunks.push(info.hash);
                refs.push(PoolRefCount::reference(&info));
            }
            manifest.chunks = chunks;
            manifest.hash = Some(ChunkHash(hasher.0.finalize().into()));
            stats.files += 1;
        } else {
            manifest.chunks.clear();
            manifest.hash = None;
        }

        let entry = if is_add && previous.is_none() {
            JournalEntry::Add(manifest)
        } else {
            JournalEntry::Modify(manifest)
        };
        Ok(Materialized { entry, refs, stats })
    }

    /// Materialize one chunk: validate a pooled copy or fetch and store it.
    /// The flag is set when the chunk was newly written to the pool.
    fn chunk(
        &self,
        manifest: &FileManifest,
        expected: Option<&ChunkHash>,
        offset: u64,
        len: u64,
        hasher: &mut FileHasher,
        stats: &mut RunStats,
    ) -> Result<(ChunkInformation, bool)> {
        if let Some(hash) = expected.filter(|h| self.pool.exists(h)) {
            let checkpoint = hasher.0.clone();
            match self.pool.read(hash, &mut *hasher) {
                Ok(info) if info.hash == *hash => {
                    stats.chunks_reused += 1;
                    return Ok((info, false));
                }
                Ok(_) => {}
                Err(e) if e.is_damage() => {
                    log_manifest_warn!(hash = %hash, error = %e, "pooled chunk unreadable");
                }
                Err(e) => return Err(e.into()),
            }
            // The pooled copy is damaged: drop it and refetch from the origin.
            stats.integrity_mismatches += 1;
            hasher.0 = checkpoint;
            if let Err(e) = self.pool.remove(hash) {
                log_manifest_warn!(hash = %hash, error = %e, "cannot drop damaged chunk");
            }
        }

        let source = self.fetcher.fetch(&manifest.path, offset, len)?;
        let tee = TeeReader {
            inner: source.take(len),
            hasher,
        };
        let outcome = self.pool.write(tee, expected)?;
        if outcome.deduplicated {
            stats.chunks_reused += 1;
        } else {
            stats.chunks_written += 1;
        }
        if let Some(hash) = expected.filter(|h| **h != outcome.info.hash) {
            log_manifest_debug!(
                path = %String::from_utf8_lossy(&manifest.path),
                expected = %hash,
                actual = %outcome.info.hash,
                "chunk changed, using fetched content"
            );
        }
        Ok((outcome.info, !outcome.deduplicated))
    }
}
