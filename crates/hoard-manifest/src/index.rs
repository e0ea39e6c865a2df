//! In-memory view of a manifest, rebuilt by replaying snapshot and journal.

use std::collections::btree_map::{self, BTreeMap};

use serde::Serialize;

use crate::entry::{FileManifest, JournalEntry};

/// Normalize a raw path so equivalent spellings share one index key.
///
/// Collapses repeated slashes, drops a trailing slash (except for the root)
/// and ensures a leading slash.
pub fn normalize_path(path: &[u8]) -> Vec<u8> {
    let mut normalized = Vec::with_capacity(path.len() + 1);
    normalized.push(b'/');
    for &b in path {
        if b == b'/' && normalized.last() == Some(&b'/') {
            continue;
        }
        normalized.push(b);
    }
    if normalized.len() > 1 && normalized.last() == Some(&b'/') {
        normalized.pop();
    }
    normalized
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub manifest: FileManifest,
    /// Set when the current scan saw this path
    pub mark_viewed: bool,
}

/// Path-keyed map of the current file tree of one share.
///
/// Each backup run owns one index; nothing about it is global.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexManifest {
    entries: BTreeMap<Vec<u8>, IndexEntry>,
}

impl IndexManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one journal record into the index.
    pub fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Add(manifest) | JournalEntry::Modify(manifest) => {
                self.insert(manifest);
            }
            JournalEntry::Remove { path } => {
                self.entries.remove(&normalize_path(&path));
            }
        }
    }

    /// Insert or replace, keeping the viewed flag of a replaced entry.
    pub fn insert(&mut self, manifest: FileManifest) {
        let key = normalize_path(&manifest.path);
        match self.entries.entry(key) {
            btree_map::Entry::Occupied(mut slot) => slot.get_mut().manifest = manifest,
            btree_map::Entry::Vacant(slot) => {
                slot.insert(IndexEntry {
                    manifest,
                    mark_viewed: false,
                });
            }
        }
    }

    pub fn get(&self, path: &[u8]) -> Option<&IndexEntry> {
        self.entries.get(&normalize_path(path))
    }

    pub fn contains(&self, path: &[u8]) -> bool {
        self.get(path).is_some()
    }

    /// Flag `path` as seen by the current scan. Returns false if it is unknown.
    pub fn mark_viewed(&mut self, path: &[u8]) -> bool {
        match self.entries.get_mut(&normalize_path(path)) {
            Some(entry) => {
                entry.mark_viewed = true;
                true
            }
            None => false,
        }
    }

    pub fn reset_viewed(&mut self) {
        for entry in self.entries.values_mut() {
            entry.mark_viewed = false;
        }
    }

    /// Entries the current scan never saw: the files deleted since last time.
    pub fn unviewed(&self) -> impl Iterator<Item = &FileManifest> {
        self.entries
            .values()
            .filter(|e| !e.mark_viewed)
            .map(|e| &e.manifest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn into_manifests(self) -> impl Iterator<Item = FileManifest> {
        self.entries.into_values().map(|e| e.manifest)
    }

    pub fn stats(&self) -> ManifestStats {
        let mut stats = ManifestStats::default();
        for entry in self.entries.values() {
            let m = &entry.manifest;
            if m.is_dir() {
                stats.dir_count += 1;
            } else if m.is_symlink() {
                stats.symlink_count += 1;
            } else {
                stats.file_count += 1;
                stats.total_size += m.stats.size;
                stats.chunk_count += m.chunks.len() as u64;
            }
        }
        stats
    }
}

impl FromIterator<JournalEntry> for IndexManifest {
    fn from_iter<I: IntoIterator<Item = JournalEntry>>(iter: I) -> Self {
        let mut index = IndexManifest::new();
        for entry in iter {
            index.apply(entry);
        }
        index
    }
}

/// Statistics about a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestStats {
    pub file_count: u64,
    pub dir_count: u64,
    pub symlink_count: u64,
    pub total_size: u64,
    pub chunk_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{FileStat, S_IFDIR, S_IFREG};

    fn file(path: &str, size: u64) -> FileManifest {
        FileManifest::new(
            path.as_bytes().to_vec(),
            FileStat {
                size,
                mode: S_IFREG | 0o644,
                ..FileStat::default()
            },
        )
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(normalize_path(b"a//b/"), b"/a/b");
        assert_eq!(normalize_path(b"/"), b"/");
        assert_eq!(normalize_path(b""), b"/");
        // Non UTF-8 bytes survive untouched
        assert_eq!(normalize_path(b"/caf\xe9"), b"/caf\xe9");
    }

    #[test]
    fn test_replay_add_modify_remove() {
        let index: IndexManifest = [
            JournalEntry::Add(file("/a", 1)),
            JournalEntry::Add(file("/b", 2)),
            JournalEntry::Modify(file("a", 10)),
            JournalEntry::Remove { path: b"/b/".to_vec() },
        ]
        .into_iter()
        .collect();

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(b"/a").unwrap().manifest.stats.size, 10);
        assert!(!index.contains(b"/b"));
    }

    #[test]
    fn test_viewed_tracking() {
        let mut index = IndexManifest::new();
        for p in ["/a", "/b", "/c"] {
            index.insert(file(p, 1));
        }
        assert!(index.mark_viewed(b"/a"));
        assert!(index.mark_viewed(b"/c"));
        assert!(!index.mark_viewed(b"/zzz"));

        let gone: Vec<_> = index.unviewed().map(|m| m.path.clone()).collect();
        assert_eq!(gone, vec![b"/b".to_vec()]);

        // Replacing an entry keeps its flag
        index.insert(file("/a", 5));
        assert!(index.get(b"/a").unwrap().mark_viewed);

        index.reset_viewed();
        assert_eq!(index.unviewed().count(), 3);
    }

    #[test]
    fn test_stats() {
        let mut index = IndexManifest::new();
        let mut a = file("/a", 100);
        a.chunks = vec![hoard_pool::ChunkHash::of(b"x")];
        index.insert(a);
        index.insert(file("/b", 200));
        let mut dir = file("/d", 0);
        dir.stats.mode = S_IFDIR | 0o755;
        index.insert(dir);

        let stats = index.stats();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.dir_count, 1);
        assert_eq!(stats.total_size, 300);
        assert_eq!(stats.chunk_count, 1);
    }
}
