//! # hoard-codec
//!
//! Framed record files shared by manifests, journals and refcount scopes.
//!
//! ## Frame Layout
//!
//! ```text
//! [varint len][bincode record] [varint len][bincode record] ...
//! ```
//!
//! The frame sequence is optionally wrapped in zlib. Appending to a compressed
//! file adds one more zlib member; readers decode all members in order.
//!
//! A frame cut short at the end of the file is dropped silently: files may be
//! read while a writer is still appending to them. Damage anywhere before the
//! end of the file is reported as [`CodecError::Corrupt`].

mod varint;
mod zlib;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use hoard_config::{log_codec_debug, JournalConfig};

pub use zlib::MultiZlibDecoder;

/// Frames larger than this are treated as corruption rather than allocated.
pub const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("File not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Corrupt frame in {} at offset {offset}: {reason}", path.display())]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// How a framed file is encoded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOptions {
    pub compress: bool,
    pub level: u32,
}

impl FrameOptions {
    pub const PLAIN: FrameOptions = FrameOptions {
        compress: false,
        level: 0,
    };

    pub fn compressed() -> Self {
        Self {
            compress: true,
            level: 6,
        }
    }
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self::compressed()
    }
}

impl From<&JournalConfig> for FrameOptions {
    fn from(cfg: &JournalConfig) -> Self {
        Self {
            compress: cfg.compress,
            level: cfg.compression_level.min(9),
        }
    }
}

/// A decoded record and the offset of its frame in the (decompressed) stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Framed<T> {
    pub offset: u64,
    pub record: T,
}

enum Sink {
    Plain(BufWriter<File>),
    Zlib(ZlibEncoder<BufWriter<File>>),
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Sink::Plain(w) => w,
            Sink::Zlib(w) => w,
        }
    }

    fn finish(self) -> io::Result<()> {
        let buffered = match self {
            Sink::Plain(w) => w,
            Sink::Zlib(w) => w.finish()?,
        };
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

/// Streaming writer for one framed file.
///
/// Call [`FramedWriter::finish`] to flush and fsync; dropping the writer
/// without finishing leaves the file with an unspecified tail.
pub struct FramedWriter<T> {
    sink: Sink,
    scratch: Vec<u8>,
    count: u64,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Serialize> FramedWriter<T> {
    /// Open `path` for appending (created if absent).
    pub fn append<P: AsRef<Path>>(path: P, opts: FrameOptions) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_file(file, opts))
    }

    /// Wrap an already opened file.
    pub fn from_file(file: File, opts: FrameOptions) -> Self {
        let buffered = BufWriter::new(file);
        let sink = if opts.compress {
            Sink::Zlib(ZlibEncoder::new(buffered, Compression::new(opts.level)))
        } else {
            Sink::Plain(buffered)
        };
        Self {
            sink,
            scratch: Vec::new(),
            count: 0,
            _marker: PhantomData,
        }
    }

    pub fn push(&mut self, record: &T) -> Result<()> {
        let body = bincode::serialize(record)?;
        self.scratch.clear();
        varint::encode_u64(body.len() as u64, &mut self.scratch);
        let w = self.sink.writer();
        w.write_all(&self.scratch)?;
        w.write_all(&body)?;
        self.count += 1;
        Ok(())
    }

    /// Number of records pushed so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flush, finish the compression member and fsync. Returns the record count.
    pub fn finish(self) -> Result<u64> {
        self.sink.finish()?;
        Ok(self.count)
    }
}

/// Append `records` to `path`, creating it if needed.
pub fn write_records<T, I, P>(path: P, records: I, opts: FrameOptions) -> Result<u64>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
    P: AsRef<Path>,
{
    let mut writer = FramedWriter::append(path, opts)?;
    for record in records {
        writer.push(&record)?;
    }
    writer.finish()
}

/// Replace `path` with exactly `records`.
///
/// Records go to a temp file next to `path` which is renamed into place only
/// after it was fully written and synced; on failure `path` is untouched.
pub fn write_records_atomic<T, I, P>(path: P, records: I, opts: FrameOptions) -> Result<u64>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
    P: AsRef<Path>,
{
    write_atomic(path.as_ref(), opts, |writer| {
        for record in records {
            writer.push(&record)?;
        }
        Ok(())
    })
}

/// Like [`write_records_atomic`], but records are produced by a fallible closure.
pub fn write_atomic<T, F>(path: &Path, opts: FrameOptions, fill: F) -> Result<u64>
where
    T: Serialize,
    F: FnOnce(&mut FramedWriter<T>) -> Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let tmp = tempfile::Builder::new()
        .prefix(".hoard-")
        .suffix(".tmp")
        .tempfile_in(&dir)?;
    let mut writer = FramedWriter::from_file(tmp.as_file().try_clone()?, opts);
    fill(&mut writer)?;
    let count = writer.finish()?;
    tmp.persist(path).map_err(|e| CodecError::Io(e.error))?;

    log_codec_debug!(path = %path.display(), records = count, "file replaced");
    Ok(count)
}

/// Open `path` for reading. A missing file is `CodecError::NotFound`.
pub fn read_records<T, P>(path: P, opts: FrameOptions) -> Result<FramedReader<T>>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    match File::open(path) {
        Ok(file) => FramedReader::from_file(file, path, opts),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CodecError::NotFound {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Open `path` for reading; a missing file yields an empty sequence.
pub fn read_records_or_empty<T, P>(path: P, opts: FrameOptions) -> Result<FramedReader<T>>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    match read_records(path.as_ref(), opts) {
        Err(CodecError::NotFound { .. }) => Ok(FramedReader::empty(path.as_ref())),
        other => other,
    }
}

/// Remove a file, treating "already gone" as success. Returns whether it existed.
pub fn remove_if_exists<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// File reader that remembers whether it ran into the end of the file.
struct EofTracking {
    file: File,
    reached: Arc<AtomicBool>,
}

impl Read for EofTracking {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.reached.store(true, Ordering::Relaxed);
        }
        Ok(n)
    }
}

/// Lazy iterator over the frames of one file.
pub struct FramedReader<T> {
    source: Option<Box<dyn Read + Send>>,
    path: PathBuf,
    offset: u64,
    at_eof: Arc<AtomicBool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> FramedReader<T> {
    fn from_file(file: File, path: &Path, opts: FrameOptions) -> Result<Self> {
        let len = file.metadata()?.len();
        let at_eof = Arc::new(AtomicBool::new(false));
        let buffered = BufReader::new(EofTracking {
            file,
            reached: Arc::clone(&at_eof),
        });
        let source: Option<Box<dyn Read + Send>> = if len == 0 {
            None
        } else if opts.compress {
            Some(Box::new(MultiZlibDecoder::new(buffered)))
        } else {
            Some(Box::new(buffered))
        };
        Ok(Self {
            source,
            path: path.to_path_buf(),
            offset: 0,
            at_eof,
            _marker: PhantomData,
        })
    }

    fn empty(path: &Path) -> Self {
        Self {
            source: None,
            path: path.to_path_buf(),
            offset: 0,
            at_eof: Arc::new(AtomicBool::new(true)),
            _marker: PhantomData,
        }
    }

    /// Classify a read failure at the frame starting at `offset`.
    ///
    /// Only a failure after the file itself ran out is a partial trailing
    /// frame. Decoder errors earlier in the file mean the content is damaged.
    fn read_failed(&mut self, offset: u64, err: io::Error) -> Result<Option<Framed<T>>> {
        self.source = None;
        let decode_error = matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
        );
        if !decode_error {
            return Err(err.into());
        }
        if self.at_eof.load(Ordering::Relaxed) {
            log_codec_debug!(
                path = %self.path.display(),
                offset,
                error = %err,
                "dropping partial trailing frame"
            );
            return Ok(None);
        }
        Err(CodecError::Corrupt {
            path: self.path.clone(),
            offset,
            reason: err.to_string(),
        })
    }

    fn next_frame(&mut self) -> Result<Option<Framed<T>>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        let offset = self.offset;

        let (len, header) = match varint::read_u64(source) {
            Ok(Some(v)) => v,
            Ok(None) => {
                self.source = None;
                return Ok(None);
            }
            Err(e) => return self.read_failed(offset, e),
        };

        if len > MAX_FRAME_LEN {
            self.source = None;
            return Err(CodecError::Corrupt {
                path: self.path.clone(),
                offset,
                reason: format!("frame length {len} exceeds limit"),
            });
        }

        let mut body = vec![0u8; len as usize];
        if let Err(e) = source.read_exact(&mut body) {
            return self.read_failed(offset, e);
        }

        let record = bincode::deserialize(&body).map_err(|e| {
            self.source = None;
            CodecError::Corrupt {
                path: self.path.clone(),
                offset,
                reason: e.to_string(),
            }
        })?;

        self.offset = offset + header as u64 + len;
        Ok(Some(Framed { offset, record }))
    }
}

impl<T: DeserializeOwned> Iterator for FramedReader<T> {
    type Item = Result<Framed<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.source = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        name: String,
        n: i64,
    }

    fn rec(i: i64) -> Rec {
        Rec {
            name: format!("r{i}"),
            n: i,
        }
    }

    fn collect(path: &Path, opts: FrameOptions) -> Vec<Rec> {
        read_records::<Rec, _>(path, opts)
            .unwrap()
            .map(|f| f.unwrap().record)
            .collect()
    }

    #[test]
    fn test_plain_write_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plain");
        write_records(&path, (0..5).map(rec), FrameOptions::PLAIN).unwrap();
        assert_eq!(collect(&path, FrameOptions::PLAIN), (0..5).map(rec).collect::<Vec<_>>());
    }

    #[test]
    fn test_compressed_appends_accumulate() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("journal");
        let opts = FrameOptions::compressed();
        write_records(&path, (0..3).map(rec), opts).unwrap();
        write_records(&path, (3..6).map(rec), opts).unwrap();
        assert_eq!(collect(&path, opts), (0..6).map(rec).collect::<Vec<_>>());
    }

    #[test]
    fn test_offsets_are_frame_starts() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offsets");
        write_records(&path, (0..3).map(rec), FrameOptions::PLAIN).unwrap();

        let bytes = fs::read(&path).unwrap();
        let frames: Vec<_> = read_records::<Rec, _>(&path, FrameOptions::PLAIN)
            .unwrap()
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(frames[0].offset, 0);
        for f in &frames[1..] {
            let at = f.offset as usize;
            let (len, header) = varint::read_u64(&mut &bytes[at..]).unwrap().unwrap();
            let decoded: Rec = bincode::deserialize(&bytes[at + header..at + header + len as usize]).unwrap();
            assert_eq!(decoded, f.record);
        }
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cut");
        write_records(&path, (0..4).map(rec), FrameOptions::PLAIN).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        assert_eq!(collect(&path, FrameOptions::PLAIN), (0..3).map(rec).collect::<Vec<_>>());
    }

    #[test]
    fn test_truncated_compressed_tail_is_dropped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cutz");
        let opts = FrameOptions::compressed();
        write_records(&path, (0..2).map(rec), opts).unwrap();
        let intact = fs::metadata(&path).unwrap().len() as usize;
        write_records(&path, (2..200).map(rec), opts).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..intact + (bytes.len() - intact) / 2]).unwrap();

        let got = collect(&path, opts);
        assert!(got.len() >= 2);
        assert!(got.len() < 200);
        assert_eq!(got, (0..got.len() as i64).map(rec).collect::<Vec<_>>());
    }

    #[test]
    fn test_missing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("absent");
        assert!(matches!(
            read_records::<Rec, _>(&path, FrameOptions::PLAIN),
            Err(CodecError::NotFound { .. })
        ));
        assert_eq!(
            read_records_or_empty::<Rec, _>(&path, FrameOptions::PLAIN)
                .unwrap()
                .count(),
            0
        );
    }

    #[test]
    fn test_empty_file_reads_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty");
        File::create(&path).unwrap();
        assert!(collect(&path, FrameOptions::compressed()).is_empty());
    }

    #[test]
    fn test_atomic_replace() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("scope");
        let opts = FrameOptions::compressed();
        write_records(&path, (0..10).map(rec), opts).unwrap();
        write_records_atomic(&path, (100..102).map(rec), opts).unwrap();
        assert_eq!(collect(&path, opts), vec![rec(100), rec(101)]);

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_atomic_write_keeps_original() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("keep");
        let opts = FrameOptions::PLAIN;
        write_records(&path, (0..2).map(rec), opts).unwrap();

        let result = write_atomic::<Rec, _>(&path, opts, |w| {
            w.push(&rec(9))?;
            Err(CodecError::Io(io::Error::other("source failed")))
        });
        assert!(result.is_err());
        assert_eq!(collect(&path, opts), vec![rec(0), rec(1)]);
    }

    #[test]
    fn test_corrupt_frame_surfaces() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("corrupt");
        // length 2, then a body that is not a valid Rec
        fs::write(&path, [0x02, 0xff, 0xff]).unwrap();
        let mut reader = read_records::<Rec, _>(&path, FrameOptions::PLAIN).unwrap();
        assert!(matches!(reader.next(), Some(Err(CodecError::Corrupt { .. }))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_damage_inside_compressed_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot");
        let opts = FrameOptions::compressed();
        let noisy = |i: i64| Rec {
            name: format!("{:016x}", (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            n: i,
        };
        write_records_atomic(&path, (0..4000).map(noisy), opts).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        assert!(bytes.len() > 2 * 8192);
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let results: Vec<_> = read_records::<Rec, _>(&path, opts).unwrap().collect();
        assert!(matches!(results.last(), Some(Err(CodecError::Corrupt { .. }))));
    }

    #[test]
    fn test_garbage_compressed_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("garbage");
        fs::write(&path, vec![0x5a; 64 * 1024]).unwrap();
        let mut reader = read_records::<Rec, _>(&path, FrameOptions::compressed()).unwrap();
        assert!(matches!(reader.next(), Some(Err(CodecError::Corrupt { .. }))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_remove_if_exists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
