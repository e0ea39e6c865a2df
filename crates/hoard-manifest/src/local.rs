//! A share read straight from a local directory.

use std::ffi::OsStr;
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use hoard_config::log_manifest_warn;

use crate::backup::ChunkFetcher;
use crate::entry::{FileManifest, FileStat, JournalEntry};
use crate::{ManifestError, Result};

/// Local directory exposed as an entry source and a chunk fetcher.
///
/// Entry paths are relative to the root, with a leading `/`.
#[derive(Debug, Clone)]
pub struct LocalShare {
    root: PathBuf,
}

impl LocalShare {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &[u8]) -> PathBuf {
        let relative = path.strip_prefix(b"/").unwrap_or(path);
        self.root.join(OsStr::from_bytes(relative))
    }

    /// Walk the share in path order, yielding one ADD per entry.
    ///
    /// Entries that cannot be read are logged and skipped.
    pub fn entries(&self) -> impl Iterator<Item = JournalEntry> + '_ {
        walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        log_manifest_warn!(error = %e, "skipping unreadable entry");
                        return None;
                    }
                };
                match self.describe(entry.path()) {
                    Ok(manifest) => Some(JournalEntry::Add(manifest)),
                    Err(e) => {
                        log_manifest_warn!(path = %entry.path().display(), error = %e, "skipping entry");
                        None
                    }
                }
            })
    }

    /// Manifest of one file under the root, without chunks.
    pub fn describe(&self, full_path: &Path) -> io::Result<FileManifest> {
        let relative = full_path.strip_prefix(&self.root).map_err(io::Error::other)?;
        let mut path = Vec::with_capacity(relative.as_os_str().len() + 1);
        path.push(b'/');
        path.extend_from_slice(relative.as_os_str().as_bytes());

        let meta = fs::symlink_metadata(full_path)?;
        let mut manifest = FileManifest::new(path, stat_of(&meta));
        if meta.file_type().is_symlink() {
            manifest.symlink = Some(fs::read_link(full_path)?.into_os_string().into_vec());
        }
        Ok(manifest)
    }
}

fn stat_of(meta: &Metadata) -> FileStat {
    let created = meta
        .created()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    FileStat {
        owner_id: meta.uid(),
        group_id: meta.gid(),
        size: meta.size(),
        mode: meta.mode(),
        last_modified: meta.mtime(),
        last_read: meta.atime(),
        created,
        dev: meta.dev(),
        rdev: meta.rdev(),
        ino: meta.ino(),
        nlink: meta.nlink(),
    }
}

impl ChunkFetcher for LocalShare {
    fn fetch(&self, path: &[u8], offset: u64, len: u64) -> Result<Box<dyn Read + Send + '_>> {
        let full = self.resolve(path);
        let mut file = File::open(&full).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ManifestError::PathNotFound(full.display().to_string()),
            _ => ManifestError::Fetch {
                path: full.display().to_string(),
                reason: e.to_string(),
            },
        })?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(file.take(len)))
    }
}
