//! File entries and journal records.

use std::collections::BTreeMap;

use hoard_pool::ChunkHash;
use serde::{Deserialize, Serialize};

/// File type bits of `st_mode`
pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/// `stat(2)` attributes. Times are seconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub owner_id: u32,
    pub group_id: u32,
    pub size: u64,
    pub mode: u32,
    pub last_modified: i64,
    pub last_read: i64,
    pub created: i64,
    pub dev: u64,
    pub rdev: u64,
    pub ino: u64,
    pub nlink: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclTag {
    UserObj,
    User(u32),
    GroupObj,
    Group(u32),
    Mask,
    Other,
}

/// One POSIX ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub tag: AclTag,
    /// rwx bits
    pub perm: u16,
}

/// Snapshot of one file-system entry.
///
/// Paths and symlink targets are raw bytes; they are never decoded as text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub path: Vec<u8>,
    pub stats: FileStat,
    pub xattr: BTreeMap<Vec<u8>, Vec<u8>>,
    pub acl: Vec<AclEntry>,
    /// One hash per chunk, in file order. Empty for anything but regular files.
    pub chunks: Vec<ChunkHash>,
    pub symlink: Option<Vec<u8>>,
    /// SHA-256 of the whole content
    pub hash: Option<ChunkHash>,
}

impl FileManifest {
    pub fn new(path: impl Into<Vec<u8>>, stats: FileStat) -> Self {
        Self {
            path: path.into(),
            stats,
            ..Self::default()
        }
    }

    pub fn file_type(&self) -> u32 {
        self.stats.mode & S_IFMT
    }

    pub fn is_regular_file(&self) -> bool {
        self.file_type() == S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == S_IFLNK
    }

    /// `ceil(size / chunk_size)` for regular files, 0 otherwise.
    pub fn expected_chunk_count(&self, chunk_size: u64) -> usize {
        if !self.is_regular_file() || chunk_size == 0 {
            return 0;
        }
        self.stats.size.div_ceil(chunk_size) as usize
    }

    /// `(offset, len)` of every chunk; the last one may be shorter.
    pub fn chunk_ranges(&self, chunk_size: u64) -> impl Iterator<Item = (u64, u64)> {
        let size = self.stats.size;
        (0..self.expected_chunk_count(chunk_size) as u64).map(move |i| {
            let offset = i * chunk_size;
            (offset, chunk_size.min(size - offset))
        })
    }

    /// Same content as `other` as far as metadata can tell.
    pub fn looks_unchanged(&self, other: &FileManifest) -> bool {
        self.stats.size == other.stats.size
            && self.stats.last_modified == other.stats.last_modified
            && self.file_type() == other.file_type()
    }
}

/// One change to a share's file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    Add(FileManifest),
    Modify(FileManifest),
    Remove { path: Vec<u8> },
}

impl JournalEntry {
    pub fn path(&self) -> &[u8] {
        match self {
            JournalEntry::Add(m) | JournalEntry::Modify(m) => &m.path,
            JournalEntry::Remove { path } => path,
        }
    }

    pub fn manifest(&self) -> Option<&FileManifest> {
        match self {
            JournalEntry::Add(m) | JournalEntry::Modify(m) => Some(m),
            JournalEntry::Remove { .. } => None,
        }
    }

    pub fn into_manifest(self) -> Option<FileManifest> {
        match self {
            JournalEntry::Add(m) | JournalEntry::Modify(m) => Some(m),
            JournalEntry::Remove { .. } => None,
        }
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, JournalEntry::Remove { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn regular(size: u64) -> FileManifest {
        FileManifest::new(
            b"/f".to_vec(),
            FileStat {
                size,
                mode: S_IFREG | 0o644,
                ..FileStat::default()
            },
        )
    }

    #[test]
    fn test_chunk_ranges_last_chunk_shorter() {
        let m = regular(10 * MIB);
        let ranges: Vec<_> = m.chunk_ranges(4 * MIB).collect();
        assert_eq!(
            ranges,
            vec![(0, 4 * MIB), (4 * MIB, 4 * MIB), (8 * MIB, 2 * MIB)]
        );
        assert_eq!(m.expected_chunk_count(4 * MIB), 3);
    }

    #[test]
    fn test_exact_multiple_and_empty() {
        assert_eq!(regular(8 * MIB).expected_chunk_count(4 * MIB), 2);
        assert_eq!(regular(0).expected_chunk_count(4 * MIB), 0);
        assert_eq!(regular(1).chunk_ranges(4 * MIB).collect::<Vec<_>>(), vec![(0, 1)]);
    }

    #[test]
    fn test_non_regular_has_no_chunks() {
        let mut dir = regular(4096);
        dir.stats.mode = S_IFDIR | 0o755;
        assert!(dir.is_dir());
        assert_eq!(dir.expected_chunk_count(4 * MIB), 0);

        let mut link = regular(12);
        link.stats.mode = S_IFLNK | 0o777;
        assert!(link.is_symlink());
        assert!(!link.is_regular_file());
    }

    #[test]
    fn test_journal_entry_accessors() {
        let add = JournalEntry::Add(regular(1));
        let rm = JournalEntry::Remove { path: b"/gone".to_vec() };
        assert_eq!(add.path(), b"/f");
        assert_eq!(rm.path(), b"/gone");
        assert!(rm.is_remove());
        assert!(rm.manifest().is_none());
        assert!(add.into_manifest().is_some());
    }
}
