//! Reference-count records and per-scope aggregates.

use std::collections::BTreeMap;

use hoard_pool::{ChunkHash, ChunkInformation};
use serde::{Deserialize, Serialize};

/// How many manifests reference one chunk.
///
/// `ref_count` is signed: decrements may arrive before the matching increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRefCount {
    pub hash: ChunkHash,
    pub ref_count: i64,
    pub size: u64,
    pub compressed_size: u64,
}

impl PoolRefCount {
    /// A `+1` delta for a chunk just referenced by a manifest.
    pub fn reference(info: &ChunkInformation) -> Self {
        Self {
            hash: info.hash,
            ref_count: 1,
            size: info.size,
            compressed_size: info.compressed_size,
        }
    }

    /// Fold `other` (same hash) into `self`.
    pub fn absorb(&mut self, other: &PoolRefCount) {
        self.ref_count += other.ref_count;
        if other.size != 0 {
            self.size = other.size;
        }
        if other.compressed_size != 0 {
            self.compressed_size = other.compressed_size;
        }
    }

    pub fn is_unused(&self) -> bool {
        self.ref_count <= 0
    }
}

/// Records keyed by hash, ordered so rewritten scope files are deterministic.
pub type RefCntMap = BTreeMap<ChunkHash, PoolRefCount>;

/// Sum `records` into `map` by hash, scaling every count by `sign`.
pub fn merge_into<I>(map: &mut RefCntMap, records: I, sign: i64)
where
    I: IntoIterator<Item = PoolRefCount>,
{
    for mut record in records {
        record.ref_count *= sign;
        map.entry(record.hash)
            .and_modify(|existing| existing.absorb(&record))
            .or_insert(record);
    }
}

/// Aggregate view of one scope file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCntStatistics {
    /// Chunks with a positive count
    pub chunk_count: u64,
    /// Sum of positive counts
    pub ref_count: u64,
    /// Highest count of a single chunk
    pub max_ref_count: u64,
    /// Uncompressed bytes of referenced chunks
    pub size: u64,
    pub compressed_size: u64,
    /// Chunks with a count of zero or less (GC candidates)
    pub unused_count: u64,
    pub unused_size: u64,
}

impl RefCntStatistics {
    pub fn collect<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a PoolRefCount>,
    {
        let mut stats = Self::default();
        for record in records {
            if record.is_unused() {
                stats.unused_count += 1;
                stats.unused_size += record.compressed_size;
                continue;
            }
            let count = record.ref_count as u64;
            stats.chunk_count += 1;
            stats.ref_count += count;
            stats.max_ref_count = stats.max_ref_count.max(count);
            stats.size += record.size;
            stats.compressed_size += record.compressed_size;
        }
        stats
    }
}
