//! Cache of open table readers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{BlockCache, LruCache};
use crate::sstable::{SSTableReader, TableIterator};
use crate::util::comparator::InternalKeyComparator;
use crate::util::filename::{legacy_table_file_path, table_file_path};
use crate::Result;

/// Keeps recently used table files open so reads skip the open/footer/
/// index parse on every lookup. Capacity tracks `max_open_files`.
pub struct TableCache {
    db_path: PathBuf,
    icmp: InternalKeyComparator,
    cache: LruCache<u64, Arc<SSTableReader>>,
    block_cache: Option<Arc<BlockCache>>,
}

impl TableCache {
    pub fn new(
        db_path: impl AsRef<Path>,
        icmp: InternalKeyComparator,
        capacity: usize,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            icmp,
            cache: LruCache::new(capacity),
            block_cache,
        }
    }

    /// Fetch or open the reader for `file_number`.
    pub fn get_table(&self, file_number: u64) -> Result<Arc<SSTableReader>> {
        if let Some(reader) = self.cache.get(&file_number) {
            return Ok(reader);
        }

        let path = table_file_path(&self.db_path, file_number);
        let opened = if path.exists() {
            SSTableReader::open(
                &path,
                file_number,
                self.icmp.clone(),
                self.block_cache.clone(),
            )
        } else {
            let legacy = legacy_table_file_path(&self.db_path, file_number);
            SSTableReader::open(
                &legacy,
                file_number,
                self.icmp.clone(),
                self.block_cache.clone(),
            )
        };

        let reader = Arc::new(opened?);
        self.cache.insert(file_number, Arc::clone(&reader));
        Ok(reader)
    }

    /// Cursor over the whole table.
    pub fn iter_table(
        &self,
        file_number: u64,
        verify_checksums: bool,
        fill_cache: bool,
    ) -> Result<TableIterator> {
        let reader = self.get_table(file_number)?;
        Ok(TableIterator::new(reader, verify_checksums, fill_cache))
    }

    /// Forget the handle for a deleted file.
    pub fn evict(&self, file_number: u64) {
        self.cache.remove(&file_number);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::sstable::SSTableWriter;
    use crate::types::{InternalKey, ValueType};
    use crate::util::comparator::BytewiseComparator;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator::new()))
    }

    fn write_table(dir: &Path, file_number: u64) {
        let path = table_file_path(dir, file_number);
        let mut writer = SSTableWriter::new(&path, &Options::default(), icmp()).unwrap();
        let key = InternalKey::new(Bytes::from("key"), 1, ValueType::Value);
        writer.add(&key.encode(), b"value").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_open_and_cache() {
        let dir = tempdir().unwrap();
        write_table(dir.path(), 5);

        let cache = TableCache::new(dir.path(), icmp(), 16, None);
        let first = cache.get_table(5).unwrap();
        let second = cache.get_table(5).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = tempdir().unwrap();
        let cache = TableCache::new(dir.path(), icmp(), 16, None);
        assert!(cache.get_table(99).is_err());
    }

    #[test]
    fn test_evict_drops_handle() {
        let dir = tempdir().unwrap();
        write_table(dir.path(), 7);

        let cache = TableCache::new(dir.path(), icmp(), 16, None);
        let first = cache.get_table(7).unwrap();
        cache.evict(7);
        assert_eq!(cache.len(), 0);

        // A later fetch reopens the file rather than reusing the handle.
        let second = cache.get_table(7).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
