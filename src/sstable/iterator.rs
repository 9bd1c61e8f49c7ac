//! Two-level iteration over a table file: index entries point at data
//! blocks, which are loaded lazily as the cursor moves.

use std::sync::Arc;

use crate::iterator::InternalIterator;
use crate::{Error, Result};

use super::block::{BlockHandle, BlockIterator};
use super::reader::SSTableReader;

/// Owned cursor over one table file.
pub struct TableIterator {
    table: Arc<SSTableReader>,
    verify_checksums: bool,
    fill_cache: bool,
    index_iter: BlockIterator,
    data_iter: Option<BlockIterator>,
    /// Handle backing `data_iter`, to skip redundant block loads.
    data_block_handle: Option<BlockHandle>,
    status: Option<Error>,
}

impl TableIterator {
    pub fn new(table: Arc<SSTableReader>, verify_checksums: bool, fill_cache: bool) -> Self {
        let index_iter = table.index_block().iter(table.comparator().clone());
        Self {
            table,
            verify_checksums,
            fill_cache,
            index_iter,
            data_iter: None,
            data_block_handle: None,
            status: None,
        }
    }

    fn record_error(&mut self, error: Error) {
        if self.status.is_none() {
            self.status = Some(error);
        }
        self.data_iter = None;
        self.data_block_handle = None;
    }

    /// Point `data_iter` at the block the index currently names.
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            self.data_block_handle = None;
            return;
        }

        let mut cursor = self.index_iter.value();
        let handle = match BlockHandle::decode(&mut cursor) {
            Ok(handle) => handle,
            Err(e) => {
                self.record_error(e);
                return;
            }
        };

        if self.data_block_handle == Some(handle) && self.data_iter.is_some() {
            return;
        }

        match self
            .table
            .read_block(&handle, self.verify_checksums, self.fill_cache)
        {
            Ok(block) => {
                self.data_iter = Some(block.iter(self.table.comparator().clone()));
                self.data_block_handle = Some(handle);
            }
            Err(e) => self.record_error(e),
        }
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self
            .data_iter
            .as_ref()
            .map(|iter| !iter.valid())
            .unwrap_or(true)
        {
            if !self.index_iter.valid() {
                self.data_iter = None;
                self.data_block_handle = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(iter) = self.data_iter.as_mut() {
                iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self
            .data_iter
            .as_ref()
            .map(|iter| !iter.valid())
            .unwrap_or(true)
        {
            if !self.index_iter.valid() {
                self.data_iter = None;
                self.data_block_handle = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(iter) = self.data_iter.as_mut() {
                iter.seek_to_last();
            }
        }
    }
}

impl InternalIterator for TableIterator {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map(|i| i.valid()).unwrap_or(false)
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = self.data_iter.as_mut() {
            iter.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = self.data_iter.as_mut() {
            iter.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator is valid").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator is valid").value()
    }

    fn status(&self) -> Result<()> {
        if let Some(e) = &self.status {
            return Err(e.clone());
        }
        self.index_iter.status()?;
        if let Some(iter) = &self.data_iter {
            iter.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::SSTableWriter;
    use super::*;
    use crate::options::Options;
    use crate::types::{parse_internal_key, InternalKey, ValueType, MAX_SEQUENCE};
    use crate::util::comparator::{BytewiseComparator, InternalKeyComparator};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator::new()))
    }

    fn ikey(user_key: &str, seq: u64) -> Bytes {
        InternalKey::new(Bytes::from(user_key.to_string()), seq, ValueType::Value).encode()
    }

    fn build_reader(dir: &std::path::Path, count: usize) -> Arc<SSTableReader> {
        let path = dir.join("000001.ldb");
        let mut options = Options::default();
        // Small blocks force multi-block tables even for modest data.
        options.block_size = 256;
        let mut writer = SSTableWriter::new(&path, &options, icmp()).unwrap();
        for i in 0..count {
            writer
                .add(
                    &ikey(&format!("key_{:04}", i), i as u64 + 1),
                    format!("value_{}", i).as_bytes(),
                )
                .unwrap();
        }
        writer.finish().unwrap();
        Arc::new(SSTableReader::open(&path, 1, icmp(), None).unwrap())
    }

    #[test]
    fn test_full_forward_scan() {
        let dir = tempdir().unwrap();
        let reader = build_reader(dir.path(), 500);
        let mut iter = TableIterator::new(reader, true, true);

        iter.seek_to_first();
        let mut count = 0;
        let mut last: Option<Vec<u8>> = None;
        while iter.valid() {
            if let Some(prev) = &last {
                assert!(icmp().compare(prev, iter.key()) == std::cmp::Ordering::Less);
            }
            last = Some(iter.key().to_vec());
            count += 1;
            iter.next();
        }
        assert_eq!(count, 500);
        iter.status().unwrap();
    }

    #[test]
    fn test_full_backward_scan() {
        let dir = tempdir().unwrap();
        let reader = build_reader(dir.path(), 300);
        let mut iter = TableIterator::new(reader, true, true);

        iter.seek_to_last();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.prev();
        }
        assert_eq!(count, 300);
    }

    #[test]
    fn test_seek_lands_on_block_boundary_keys() {
        let dir = tempdir().unwrap();
        let reader = build_reader(dir.path(), 500);
        let mut iter = TableIterator::new(reader, true, true);

        for probe in [0usize, 17, 255, 256, 499] {
            iter.seek(&ikey(&format!("key_{:04}", probe), MAX_SEQUENCE));
            assert!(iter.valid(), "seek to {} failed", probe);
            let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
            assert_eq!(user_key, format!("key_{:04}", probe).as_bytes());
        }

        iter.seek(&ikey("zzz", MAX_SEQUENCE));
        assert!(!iter.valid());
    }

    #[test]
    fn test_direction_change() {
        let dir = tempdir().unwrap();
        let reader = build_reader(dir.path(), 100);
        let mut iter = TableIterator::new(reader, true, true);

        iter.seek(&ikey("key_0050", MAX_SEQUENCE));
        assert!(iter.valid());
        iter.next();
        let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(user_key, b"key_0051");

        iter.prev();
        let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(user_key, b"key_0050");

        iter.prev();
        let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(user_key, b"key_0049");
    }
}
