//! # hoard-pool
//!
//! Content-addressed chunk pool shared by every host and backup.
//!
//! Chunks are identified by the SHA-256 of their uncompressed bytes and stored
//! zlib-compressed with a 3-level fan-out directory layout.
//!
//! ## Directory Layout
//!
//! ```text
//! <pool_root>/
//! ├── _new/                          # temp files whose hash is not known yet
//! └── ab/
//!     └── cd/
//!         └── ef/
//!             └── abcdef...-sha256.zz
//! ```
//!
//! A rename is the only way a chunk becomes visible, so readers never see a
//! half-written chunk.

mod hash;

pub use hash::{ChunkHash, HashingWriter};

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;

use hoard_config::{log_pool_debug, log_pool_error, log_pool_warn, Config, DEFAULT_CHUNK_SIZE};

/// Suffix of every stored chunk file.
pub const CHUNK_SUFFIX: &str = "-sha256.zz";

/// Directory for temp files written before their hash is known.
pub const NEW_DIR: &str = "_new";

const COPY_BUFFER: usize = 64 * 1024;

/// Errors that can occur during pool operations
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Chunk not found: {hash}")]
    NotFound { hash: ChunkHash },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        expected: ChunkHash,
        actual: ChunkHash,
    },

    #[error("Invalid chunk hash: {0}")]
    InvalidHash(String),
}

impl PoolError {
    /// The chunk file is there but its content cannot be trusted: it hashes to
    /// something else or is not a valid zlib stream.
    pub fn is_damage(&self) -> bool {
        match self {
            PoolError::IntegrityMismatch { .. } => true,
            PoolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// `EXDEV`: rename across filesystems.
#[cfg(unix)]
const CROSS_DEVICE: i32 = 18;
/// `ERROR_NOT_SAME_DEVICE`
#[cfg(windows)]
const CROSS_DEVICE: i32 = 17;

/// Pool tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Largest expected uncompressed chunk; bigger chunks are stored but logged.
    pub chunk_size: u64,
    /// Fail reads whose content does not hash to the requested hash.
    pub strict_integrity: bool,
    pub compression_level: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            strict_integrity: false,
            compression_level: 6,
        }
    }
}

impl From<&Config> for PoolOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            chunk_size: cfg.chunking.chunk_size,
            strict_integrity: cfg.integrity.strict,
            compression_level: cfg.journal.compression_level.min(9),
        }
    }
}

/// What the pool knows about one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInformation {
    pub hash: ChunkHash,
    /// Uncompressed length
    pub size: u64,
    /// Length on disk
    pub compressed_size: u64,
}

/// Result of [`ChunkPool::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub info: ChunkInformation,
    /// The chunk was already present and the new copy was discarded.
    pub deduplicated: bool,
}

/// Content-addressed chunk store
#[derive(Debug, Clone)]
pub struct ChunkPool {
    root: PathBuf,
    opts: PoolOptions,
}

impl ChunkPool {
    /// Open (or create) a pool at the given root directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::with_options(root, PoolOptions::default())
    }

    pub fn with_options<P: AsRef<Path>>(root: P, opts: PoolOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root, opts })
    }

    /// Open the pool described by `cfg.storage.pool_root`.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::with_options(&cfg.storage.pool_root, PoolOptions::from(cfg))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &PoolOptions {
        &self.opts
    }

    fn shard_dir(root: &Path, hex: &str) -> PathBuf {
        root.join(&hex[0..2]).join(&hex[2..4]).join(&hex[4..6])
    }

    fn path_in(root: &Path, hash: &ChunkHash) -> PathBuf {
        let hex = hash.to_hex();
        Self::shard_dir(root, &hex).join(format!("{hex}{CHUNK_SUFFIX}"))
    }

    /// Where the chunk with `hash` lives (whether or not it exists).
    pub fn chunk_path(&self, hash: &ChunkHash) -> PathBuf {
        Self::path_in(&self.root, hash)
    }

    /// Check if a chunk exists in the pool.
    pub fn exists(&self, hash: &ChunkHash) -> bool {
        self.chunk_path(hash).is_file()
    }

    /// On-disk size of a stored chunk.
    pub fn compressed_size(&self, hash: &ChunkHash) -> Option<u64> {
        fs::metadata(self.chunk_path(hash)).ok().map(|m| m.len())
    }

    /// Decompress a chunk into `sink`, re-hashing what is produced.
    ///
    /// The returned hash is the recomputed one. A mismatch with `hash` is
    /// logged; it only fails the read in strict mode.
    #[instrument(skip(self, sink), level = "debug")]
    pub fn read<W: Write + ?Sized>(&self, hash: &ChunkHash, sink: &mut W) -> Result<ChunkInformation> {
        let path = self.chunk_path(hash);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PoolError::NotFound { hash: *hash })
            }
            Err(e) => return Err(e.into()),
        };
        let compressed_size = file.metadata()?.len();

        let mut decoder = ZlibDecoder::new(BufReader::new(file));
        let mut tee = HashingWriter::new(sink);
        io::copy(&mut decoder, &mut tee)?;
        let (actual, size) = tee.finalize();

        if actual != *hash {
            log_pool_error!(
                expected = %hash,
                actual = %actual,
                path = %path.display(),
                "chunk content does not match its hash"
            );
            if self.opts.strict_integrity {
                return Err(PoolError::IntegrityMismatch {
                    expected: *hash,
                    actual,
                });
            }
        }

        Ok(ChunkInformation {
            hash: actual,
            size,
            compressed_size,
        })
    }

    /// Read a whole chunk into memory.
    pub fn get(&self, hash: &ChunkHash) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read(hash, &mut out)?;
        Ok(out)
    }

    /// Stream `source` into the pool.
    ///
    /// When the caller already knows the hash the temp file is created inside
    /// the target shard, otherwise under `_new/`. If the chunk turns out to be
    /// present already the new copy is discarded.
    #[instrument(skip(self, source), level = "debug")]
    pub fn write<R: Read>(&self, mut source: R, expected: Option<&ChunkHash>) -> Result<WriteOutcome> {
        let temp_dir = match expected {
            Some(h) => Self::shard_dir(&self.root, &h.to_hex()),
            None => self.root.join(NEW_DIR),
        };
        fs::create_dir_all(&temp_dir)?;

        let tmp = tempfile::Builder::new()
            .prefix(".chunk-")
            .suffix(".tmp")
            .tempfile_in(&temp_dir)?;

        let mut encoder = ZlibEncoder::new(
            BufWriter::new(tmp.as_file().try_clone()?),
            Compression::new(self.opts.compression_level),
        );
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..n]);
            encoder.write_all(&buf[..n])?;
            size += n as u64;
        }
        let file = encoder
            .finish()?
            .into_inner()
            .map_err(|e| e.into_error())?;
        file.sync_all()?;
        let compressed_size = file.metadata()?.len();
        let hash = ChunkHash(hasher.finalize().into());

        if size > self.opts.chunk_size {
            log_pool_warn!(
                hash = %hash,
                size,
                limit = self.opts.chunk_size,
                "chunk exceeds configured chunk size"
            );
        }
        if let Some(exp) = expected.filter(|e| **e != hash) {
            log_pool_error!(expected = %exp, actual = %hash, "written chunk hash differs from expected");
        }

        let info = ChunkInformation {
            hash,
            size,
            compressed_size,
        };
        let target = self.chunk_path(&hash);

        // Deduplication: the temp file is removed when `tmp` drops.
        if target.exists() {
            log_pool_debug!(hash = %hash, "chunk already stored");
            return Ok(WriteOutcome {
                info,
                deduplicated: true,
            });
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = tmp.persist(&target) {
            // Another writer published the same content first.
            if target.exists() {
                return Ok(WriteOutcome {
                    info,
                    deduplicated: true,
                });
            }
            return Err(PoolError::Io(e.error));
        }

        Ok(WriteOutcome {
            info,
            deduplicated: false,
        })
    }

    /// Store an in-memory buffer.
    pub fn store(&self, data: &[u8]) -> Result<WriteOutcome> {
        self.write(data, None)
    }

    /// Delete a chunk from the pool.
    pub fn remove(&self, hash: &ChunkHash) -> Result<()> {
        match fs::remove_file(self.chunk_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(PoolError::NotFound { hash: *hash }),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a chunk into another pool root (e.g. a quarantine area),
    /// keeping the sharded layout. Returns the new path.
    pub fn relocate<P: AsRef<Path>>(&self, hash: &ChunkHash, dest_root: P) -> Result<PathBuf> {
        let from = self.chunk_path(hash);
        if !from.is_file() {
            return Err(PoolError::NotFound { hash: *hash });
        }
        let to = Self::path_in(dest_root.as_ref(), hash);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&from, &to) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(CROSS_DEVICE) => {
                fs::copy(&from, &to)?;
                fs::remove_file(&from)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(to)
    }

    /// Iterate over every stored chunk hash (unordered).
    pub fn iter(&self) -> ChunkIterator {
        let walker = walkdir::WalkDir::new(&self.root)
            .max_depth(4)
            .into_iter()
            .filter_entry(not_new_dir as fn(&walkdir::DirEntry) -> bool);
        ChunkIterator { walker }
    }

    /// Get statistics about the pool.
    pub fn stats(&self) -> Result<PoolStats> {
        let mut stats = PoolStats::default();
        for hash in self.iter() {
            let hash = hash?;
            stats.chunk_count += 1;
            stats.compressed_bytes += self.compressed_size(&hash).unwrap_or(0);
        }
        Ok(stats)
    }
}

fn not_new_dir(entry: &walkdir::DirEntry) -> bool {
    entry.depth() != 1 || entry.file_name() != NEW_DIR
}

/// Statistics about the pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of unique chunks stored
    pub chunk_count: u64,
    /// Total bytes on disk
    pub compressed_bytes: u64,
}

impl PoolStats {
    pub fn avg_chunk_size(&self) -> u64 {
        if self.chunk_count == 0 {
            0
        } else {
            self.compressed_bytes / self.chunk_count
        }
    }
}

/// Iterator over pool hashes (3-level: ab/cd/ef/hash-sha256.zz)
pub struct ChunkIterator {
    walker: walkdir::FilterEntry<walkdir::IntoIter, fn(&walkdir::DirEntry) -> bool>,
}

impl Iterator for ChunkIterator {
    type Item = Result<ChunkHash>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(PoolError::Io(e.into()))),
            };
            if entry.depth() != 4 || !entry.file_type().is_file() {
                continue;
            }
            // Temp files and foreign files are skipped
            let Some(hex) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(CHUNK_SUFFIX))
            else {
                continue;
            };
            if let Ok(hash) = ChunkHash::from_hex(hex) {
                return Some(Ok(hash));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn pool() -> (TempDir, ChunkPool) {
        let temp = TempDir::new().unwrap();
        let pool = ChunkPool::new(temp.path()).unwrap();
        (temp, pool)
    }

    #[test]
    fn test_store_and_retrieve() {
        let (_temp, pool) = pool();

        let data = b"Hello, pool!";
        let out = pool.store(data).unwrap();
        assert!(!out.deduplicated);
        assert_eq!(out.info.size, data.len() as u64);
        assert_eq!(out.info.hash, ChunkHash::of(data));

        let mut sink = Vec::new();
        let info = pool.read(&out.info.hash, &mut sink).unwrap();
        assert_eq!(sink, data);
        assert_eq!(info, out.info);
    }

    #[test]
    fn test_deduplication() {
        let (_temp, pool) = pool();

        let data = b"Duplicate content";
        let first = pool.store(data).unwrap();
        let second = pool.store(data).unwrap();

        assert_eq!(first.info.hash, second.info.hash);
        assert!(second.deduplicated);
        assert_eq!(pool.stats().unwrap().chunk_count, 1);
    }

    #[test]
    fn test_not_found() {
        let (_temp, pool) = pool();
        let fake = ChunkHash([0u8; 32]);
        assert!(!pool.exists(&fake));
        assert!(matches!(pool.get(&fake), Err(PoolError::NotFound { .. })));
        assert!(matches!(pool.remove(&fake), Err(PoolError::NotFound { .. })));
    }

    #[test]
    fn test_sharded_path_format() {
        let (temp, pool) = pool();
        let hash = pool.store(b"sharding").unwrap().info.hash;
        let hex = hash.to_hex();

        let expected = temp
            .path()
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex[4..6])
            .join(format!("{hex}-sha256.zz"));
        assert_eq!(pool.chunk_path(&hash), expected);
        assert!(expected.is_file());
    }

    #[test]
    fn test_no_temp_files_left() {
        let (temp, pool) = pool();
        pool.store(b"one").unwrap();
        pool.store(b"one").unwrap();
        pool.write(&b"two"[..], Some(&ChunkHash::of(b"two"))).unwrap();

        let temps: Vec<_> = walkdir::WalkDir::new(temp.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(temps.is_empty());
    }

    #[test]
    fn test_soft_integrity_mismatch_returns_actual() {
        let (_temp, pool) = pool();
        let real = pool.store(b"real content").unwrap().info.hash;
        let claimed = ChunkHash::of(b"something else");

        // Plant the chunk under the wrong name.
        let wrong_path = pool.chunk_path(&claimed);
        fs::create_dir_all(wrong_path.parent().unwrap()).unwrap();
        fs::copy(pool.chunk_path(&real), &wrong_path).unwrap();

        let mut sink = Vec::new();
        let info = pool.read(&claimed, &mut sink).unwrap();
        assert_eq!(info.hash, real);
        assert_eq!(sink, b"real content");
    }

    #[test]
    fn test_strict_integrity_mismatch_fails() {
        let temp = TempDir::new().unwrap();
        let pool = ChunkPool::with_options(
            temp.path(),
            PoolOptions {
                strict_integrity: true,
                ..PoolOptions::default()
            },
        )
        .unwrap();
        let real = pool.store(b"real").unwrap().info.hash;
        let claimed = ChunkHash::of(b"fake");
        let wrong_path = pool.chunk_path(&claimed);
        fs::create_dir_all(wrong_path.parent().unwrap()).unwrap();
        fs::copy(pool.chunk_path(&real), &wrong_path).unwrap();

        let err = pool.read(&claimed, &mut io::sink()).unwrap_err();
        assert!(matches!(err, PoolError::IntegrityMismatch { actual, .. } if actual == real));
    }

    #[test]
    fn test_wrong_expected_hash_stores_actual() {
        let (_temp, pool) = pool();
        let bogus = ChunkHash::of(b"bogus");
        let out = pool.write(&b"payload"[..], Some(&bogus)).unwrap();
        assert_eq!(out.info.hash, ChunkHash::of(b"payload"));
        assert!(pool.exists(&out.info.hash));
        assert!(!pool.exists(&bogus));
    }

    #[test]
    fn test_oversized_chunk_still_stored() {
        let temp = TempDir::new().unwrap();
        let pool = ChunkPool::with_options(
            temp.path(),
            PoolOptions {
                chunk_size: 8,
                ..PoolOptions::default()
            },
        )
        .unwrap();
        let out = pool.store(b"more than eight bytes").unwrap();
        assert!(pool.exists(&out.info.hash));
    }

    #[test]
    fn test_iter_skips_new_dir() {
        let (temp, pool) = pool();
        let h1 = pool.store(b"iter1").unwrap().info.hash;
        let h2 = pool.store(b"iter2").unwrap().info.hash;

        let stray = temp.path().join(NEW_DIR).join("aa").join("bb").join("cc");
        fs::create_dir_all(&stray).unwrap();
        fs::write(stray.join(format!("{}{}", ChunkHash::of(b"x"), CHUNK_SUFFIX)), b"x").unwrap();

        let found: HashSet<_> = pool.iter().map(|h| h.unwrap()).collect();
        assert_eq!(found, HashSet::from([h1, h2]));
    }

    #[test]
    fn test_relocate_to_quarantine() {
        let (temp, pool) = pool();
        let hash = pool.store(b"doomed").unwrap().info.hash;
        let quarantine = temp.path().join("quarantine");

        let moved = pool.relocate(&hash, &quarantine).unwrap();
        assert!(!pool.exists(&hash));
        assert!(moved.starts_with(&quarantine));

        let q = ChunkPool::new(&quarantine).unwrap();
        assert_eq!(q.get(&hash).unwrap(), b"doomed");
    }

    #[test]
    fn test_relocate_failure_keeps_chunk() {
        let (temp, pool) = pool();
        let hash = pool.store(b"stays").unwrap().info.hash;
        let quarantine = temp.path().join("quarantine");

        // A non-empty directory where the chunk should land makes the rename fail.
        let blocked = ChunkPool::path_in(&quarantine, &hash);
        fs::create_dir_all(blocked.join("occupied")).unwrap();

        let err = pool.relocate(&hash, &quarantine).unwrap_err();
        assert!(matches!(err, PoolError::Io(_)));
        assert!(pool.exists(&hash));
        assert!(blocked.is_dir());
    }

    #[test]
    fn test_undecodable_chunk_is_damage() {
        let (_temp, pool) = pool();
        let hash = pool.store(b"will be overwritten").unwrap().info.hash;
        fs::write(pool.chunk_path(&hash), b"this is not a zlib stream at all").unwrap();

        let err = pool.get(&hash).unwrap_err();
        assert!(err.is_damage());
        assert!(!PoolError::NotFound { hash }.is_damage());
    }

    #[test]
    fn test_compressed_size_matches_file() {
        let (_temp, pool) = pool();
        let data = vec![7u8; 100_000];
        let out = pool.store(&data).unwrap();
        assert_eq!(pool.compressed_size(&out.info.hash), Some(out.info.compressed_size));
        assert!(out.info.compressed_size < out.info.size);
    }
}
