//! Table file reading.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::cache::BlockCache;
use crate::iterator::InternalIterator;
use crate::options::ReadOptions;
use crate::util::comparator::InternalKeyComparator;
use crate::{Error, Result};

use super::block::{Block, BlockHandle};
use super::filter::BloomFilter;
use super::{Footer, FOOTER_SIZE};

/// Open handle on one table file.
///
/// Reads go through positioned I/O, so a shared reader serves concurrent
/// lookups without interior locking.
pub struct SSTableReader {
    file: File,
    file_number: u64,
    file_size: u64,
    icmp: InternalKeyComparator,
    index_block: Arc<Block>,
    filter: Option<BloomFilter>,
    block_cache: Option<Arc<BlockCache>>,
}

impl SSTableReader {
    pub fn open(
        path: &Path,
        file_number: u64,
        icmp: InternalKeyComparator,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::corruption("file too small to be a table"));
        }

        let mut footer_buf = vec![0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer_buf, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_buf)?;

        let index_raw = read_raw_block(&file, &footer.index_handle)?;
        let index_block = Arc::new(Block::from_raw(&index_raw, true)?);

        // The filter block is stored verbatim, without a trailer.
        let filter = if footer.filter_handle.size() > 0 {
            let mut filter_raw = vec![0u8; footer.filter_handle.size() as usize];
            file.read_exact_at(&mut filter_raw, footer.filter_handle.offset())?;
            BloomFilter::from_bytes(Bytes::from(filter_raw))
        } else {
            None
        };

        Ok(Self {
            file,
            file_number,
            file_size,
            icmp,
            index_block,
            filter,
            block_cache,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bloom pre-check on a user key.
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        match &self.filter {
            Some(filter) => filter.may_contain(user_key),
            None => true,
        }
    }

    /// Fetch a data block, consulting and populating the block cache.
    pub fn read_block(
        &self,
        handle: &BlockHandle,
        verify_checksums: bool,
        fill_cache: bool,
    ) -> Result<Arc<Block>> {
        if let Some(cache) = &self.block_cache {
            if let Some(block) = cache.get(self.file_number, handle.offset()) {
                return Ok(block);
            }
        }

        let raw = read_raw_block(&self.file, handle)?;
        let block = Arc::new(Block::from_raw(&raw, verify_checksums)?);

        if fill_cache {
            if let Some(cache) = &self.block_cache {
                cache.insert(self.file_number, handle.offset(), Arc::clone(&block));
            }
        }
        Ok(block)
    }

    /// Find the first entry at or after `internal_key`.
    ///
    /// Returns the entry's encoded key and value; the caller decides
    /// whether the user key actually matches. `None` when the bloom filter
    /// rejects the key or the table holds nothing at or after it.
    pub fn internal_get(
        &self,
        options: &ReadOptions,
        internal_key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>> {
        if !self.may_contain(crate::types::extract_user_key(internal_key)) {
            return Ok(None);
        }

        let mut index_iter = self.index_block.iter(self.icmp.clone());
        index_iter.seek(internal_key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let mut cursor = index_iter.value();
        let handle = BlockHandle::decode(&mut cursor)?;
        let block = self.read_block(&handle, options.verify_checksums, options.fill_cache)?;

        let mut block_iter = block.iter(self.icmp.clone());
        block_iter.seek(internal_key);
        if !block_iter.valid() {
            block_iter.status()?;
            return Ok(None);
        }

        Ok(Some((
            Bytes::copy_from_slice(block_iter.key()),
            Bytes::copy_from_slice(block_iter.value()),
        )))
    }

    /// Approximate byte offset of `internal_key` within the file.
    pub fn approximate_offset_of(&self, internal_key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.icmp.clone());
        index_iter.seek(internal_key);

        if index_iter.valid() {
            let mut cursor = index_iter.value();
            if let Ok(handle) = BlockHandle::decode(&mut cursor) {
                return handle.offset();
            }
        }
        // Past the last block: everything except the metadata precedes it.
        self.file_size
    }

    /// The comparator the table was built with.
    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub(super) fn index_block(&self) -> &Arc<Block> {
        &self.index_block
    }
}

fn read_raw_block(file: &File, handle: &BlockHandle) -> Result<Vec<u8>> {
    let mut data = vec![0u8; handle.size() as usize + super::BLOCK_TRAILER_SIZE];
    file.read_exact_at(&mut data, handle.offset())?;
    Ok(data)
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("file_number", &self.file_number)
            .field("file_size", &self.file_size)
            .finish()
    }
}
