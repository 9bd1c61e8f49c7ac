//! Table file construction.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::{Bytes, BytesMut};

use crate::options::{Compression, Options};
use crate::util::comparator::InternalKeyComparator;
use crate::{Error, Result};

use super::block_builder::BlockBuilder;
use super::filter::BloomFilterBuilder;
use super::{BlockCompression, BlockHandle, Footer, FOOTER_SIZE};

/// Builds one table file from entries added in internal-key order.
pub struct SSTableWriter {
    writer: BufWriter<File>,
    icmp: InternalKeyComparator,
    offset: u64,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_builder: Option<BloomFilterBuilder>,
    /// Last key added; used for index separators and ordering checks.
    last_key: Vec<u8>,
    /// Handle of the last finished data block, awaiting its index entry.
    pending_index_entry: Option<BlockHandle>,
    compression: BlockCompression,
    entry_count: u64,
    smallest_key: Option<Bytes>,
    largest_key: Option<Bytes>,
}

impl SSTableWriter {
    pub fn new(path: &Path, options: &Options, icmp: InternalKeyComparator) -> Result<Self> {
        let file = File::create(path)?;

        let compression = match options.compression {
            Compression::None => BlockCompression::None,
            Compression::Snappy => BlockCompression::Snappy,
        };
        let filter_builder = if options.filter_bits_per_key > 0 {
            Some(BloomFilterBuilder::new(options.filter_bits_per_key))
        } else {
            None
        };

        Ok(Self {
            writer: BufWriter::with_capacity(options.block_size * 4, file),
            icmp,
            offset: 0,
            data_block: BlockBuilder::new(options.block_size, options.block_restart_interval),
            // Index entries never share prefixes.
            index_block: BlockBuilder::new(options.block_size, 1),
            filter_builder,
            last_key: Vec::new(),
            pending_index_entry: None,
            compression,
            entry_count: 0,
            smallest_key: None,
            largest_key: None,
        })
    }

    /// Append an entry. `key` is an encoded internal key and must follow
    /// every previously added key in internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(
            self.last_key.is_empty()
                || self.icmp.compare(&self.last_key, key) == std::cmp::Ordering::Less,
            "keys must be added in internal-key order"
        );

        if let Some(handle) = self.pending_index_entry.take() {
            let separator = self.icmp.find_shortest_separator(&self.last_key, key);
            self.write_index_entry(&separator, handle);
        }

        if self.smallest_key.is_none() {
            self.smallest_key = Some(Bytes::copy_from_slice(key));
        }
        self.largest_key = Some(Bytes::copy_from_slice(key));

        if let Some(ref mut filter) = self.filter_builder {
            filter.add(crate::types::extract_user_key(key));
        }

        self.data_block.add(key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;

        if self.data_block.should_flush() {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }

        let block_data = self.data_block.finish_with_trailer(self.compression);
        let handle = self.write_raw_block(&block_data)?;
        self.pending_index_entry = Some(handle);
        self.data_block.reset();
        Ok(())
    }

    fn write_raw_block(&mut self, data: &[u8]) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, data.len() as u64);
        self.writer.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(handle)
    }

    fn write_index_entry(&mut self, key: &[u8], handle: BlockHandle) {
        let mut value = BytesMut::with_capacity(16);
        handle.encode_to(&mut value);
        self.index_block.add(key, &value);
    }

    /// Write the filter, index, and footer, then sync the file.
    pub fn finish(mut self) -> Result<SSTableInfo> {
        self.flush_data_block()?;

        if let Some(handle) = self.pending_index_entry.take() {
            let successor = self.icmp.find_short_successor(&self.last_key);
            self.write_index_entry(&successor, handle);
        }

        let filter_handle = match self.filter_builder.take() {
            Some(builder) if !builder.is_empty() => {
                let filter_data = builder.finish();
                self.write_raw_block(&filter_data)?
            }
            _ => BlockHandle::new(0, 0),
        };

        let index_data = self.index_block.finish_with_trailer(BlockCompression::None);
        let index_handle = self.write_raw_block(&index_data)?;

        let footer = Footer::new(index_handle, filter_handle);
        self.writer.write_all(&footer.encode())?;
        self.offset += FOOTER_SIZE as u64;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        let smallest_key = self
            .smallest_key
            .map(|k| crate::types::InternalKey::decode(&k))
            .transpose()
            .map_err(|_| Error::corruption("table writer tracked an invalid smallest key"))?;
        let largest_key = self
            .largest_key
            .map(|k| crate::types::InternalKey::decode(&k))
            .transpose()
            .map_err(|_| Error::corruption("table writer tracked an invalid largest key"))?;

        Ok(SSTableInfo {
            file_size: self.offset,
            entry_count: self.entry_count,
            smallest_key,
            largest_key,
        })
    }

    /// Bytes written so far, including the open data block estimate.
    pub fn file_size(&self) -> u64 {
        self.offset + self.data_block.current_size_estimate() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }
}

/// Summary of a finished table file.
#[derive(Debug, Clone)]
pub struct SSTableInfo {
    pub file_size: u64,
    pub entry_count: u64,
    pub smallest_key: Option<crate::types::InternalKey>,
    pub largest_key: Option<crate::types::InternalKey>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InternalKey, ValueType};
    use crate::util::comparator::BytewiseComparator;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator::new()))
    }

    fn ikey(user_key: &str, seq: u64) -> Bytes {
        InternalKey::new(Bytes::from(user_key.to_string()), seq, ValueType::Value).encode()
    }

    #[test]
    fn test_empty_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.ldb");

        let writer = SSTableWriter::new(&path, &Options::default(), icmp()).unwrap();
        let info = writer.finish().unwrap();

        assert_eq!(info.entry_count, 0);
        assert!(info.smallest_key.is_none());
        assert!(info.largest_key.is_none());
        assert!(info.file_size >= FOOTER_SIZE as u64);
    }

    #[test]
    fn test_tracks_key_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.ldb");

        let mut writer = SSTableWriter::new(&path, &Options::default(), icmp()).unwrap();
        for i in 0..100 {
            writer
                .add(&ikey(&format!("key_{:04}", i), i as u64 + 1), b"value")
                .unwrap();
        }
        let info = writer.finish().unwrap();

        assert_eq!(info.entry_count, 100);
        assert_eq!(info.smallest_key.unwrap().user_key(), b"key_0000");
        assert_eq!(info.largest_key.unwrap().user_key(), b"key_0099");
    }

    #[test]
    fn test_file_size_grows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.ldb");

        let mut writer = SSTableWriter::new(&path, &Options::default(), icmp()).unwrap();
        let before = writer.file_size();
        writer.add(&ikey("key", 1), &[0u8; 1024]).unwrap();
        assert!(writer.file_size() > before);
    }
}
