//! Block construction with prefix compression and restart points.

use bytes::{BufMut, Bytes, BytesMut};

use crate::util::coding::put_varint;
use crate::util::crc::{crc32, crc32_extend, mask_crc};

use super::{BlockCompression, BLOCK_TRAILER_SIZE};

/// Builds one block of sorted entries.
///
/// Keys share prefixes with their predecessor except at restart points,
/// which anchor the binary search performed by the block cursor.
pub struct BlockBuilder {
    buffer: BytesMut,
    restarts: Vec<u32>,
    /// Entries since the last restart point.
    counter: usize,
    restart_interval: usize,
    last_key: Vec<u8>,
    block_size: usize,
}

impl BlockBuilder {
    pub fn new(block_size: usize, restart_interval: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(block_size),
            restarts: vec![0],
            counter: 0,
            restart_interval,
            last_key: Vec::new(),
            block_size,
        }
    }

    /// Append an entry. Keys must arrive in comparator order; the builder
    /// itself only stores bytes.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.counter < self.restart_interval {
            let min_len = std::cmp::min(self.last_key.len(), key.len());
            let mut shared = 0;
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
            shared
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };

        let unshared = key.len() - shared;
        put_varint(&mut self.buffer, shared as u64);
        put_varint(&mut self.buffer, unshared as u64);
        put_varint(&mut self.buffer, value.len() as u64);
        self.buffer.put_slice(&key[shared..]);
        self.buffer.put_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Estimated finished size of the block.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Whether the block has reached its target size.
    pub fn should_flush(&self) -> bool {
        !self.buffer.is_empty() && self.current_size_estimate() >= self.block_size
    }

    /// Close the block: entries, restart array, restart count.
    pub fn finish(&mut self) -> Bytes {
        let mut out =
            BytesMut::with_capacity(self.buffer.len() + self.restarts.len() * 4 + 4);
        out.extend_from_slice(&self.buffer);
        for &restart in &self.restarts {
            out.put_u32_le(restart);
        }
        out.put_u32_le(self.restarts.len() as u32);
        out.freeze()
    }

    /// Close the block and append the trailer, compressing if the codec
    /// actually shrinks the contents.
    pub fn finish_with_trailer(&mut self, compression: BlockCompression) -> Bytes {
        let content = self.finish();

        let (payload, marker) = match compression {
            BlockCompression::None => (content, BlockCompression::None),
            BlockCompression::Snappy => match snap::raw::Encoder::new().compress_vec(&content) {
                Ok(compressed) if compressed.len() < content.len() => {
                    (Bytes::from(compressed), BlockCompression::Snappy)
                }
                _ => (content, BlockCompression::None),
            },
        };

        let mut out = BytesMut::with_capacity(payload.len() + BLOCK_TRAILER_SIZE);
        out.put_slice(&payload);

        let crc = mask_crc(crc32_extend(crc32(&payload), &[marker.to_byte()]));
        out.put_u32_le(crc);
        out.put_u8(marker.to_byte());
        out.freeze()
    }

    /// Clear the builder for the next block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
    }

    /// The last key added since the last reset.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}
