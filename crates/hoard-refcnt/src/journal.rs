use std::path::{Path, PathBuf};

use hoard_codec::{FrameOptions, FramedWriter};

use crate::{PoolRefCount, Result};

/// Appending writer for a backup's refcount journal.
///
/// Every record is a delta; nothing is merged until compaction.
pub struct RefCntJournal {
    path: PathBuf,
    writer: FramedWriter<PoolRefCount>,
}

impl RefCntJournal {
    pub fn open<P: AsRef<Path>>(path: P, opts: FrameOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = FramedWriter::append(&path, opts)?;
        Ok(Self { path, writer })
    }

    pub fn record(&mut self, delta: &PoolRefCount) -> Result<()> {
        self.writer.push(delta)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and fsync. Returns the number of deltas written by this writer.
    pub fn finish(self) -> Result<u64> {
        Ok(self.writer.finish()?)
    }
}
