//! Cache of decoded data blocks, keyed by (file number, block offset).

use std::sync::Arc;

use crate::cache::LruCache;
use crate::sstable::Block;

/// Shared cache of decoded blocks across all open tables.
pub struct BlockCache {
    cache: LruCache<(u64, u64), Arc<Block>>,
}

impl BlockCache {
    /// `capacity_bytes` is converted into an entry budget assuming
    /// roughly 4 KiB blocks.
    pub fn new(capacity_bytes: usize) -> Self {
        let entries = std::cmp::max(16, capacity_bytes / 4096);
        Self {
            cache: LruCache::new(entries),
        }
    }

    pub fn get(&self, file_number: u64, offset: u64) -> Option<Arc<Block>> {
        self.cache.get(&(file_number, offset))
    }

    pub fn insert(&self, file_number: u64, offset: u64, block: Arc<Block>) {
        self.cache.insert((file_number, offset), block);
    }

    // Blocks of deleted files are not purged eagerly; file numbers are
    // never reused, so stale entries simply age out.

    pub fn len(&self) -> usize {
        self.cache.len()
    }
}
