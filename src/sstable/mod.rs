//! Table files: immutable sorted runs of internal-key → value entries.
//!
//! File layout:
//!
//! ```text
//! +------------------+
//! | data block 1..N  |  prefix-compressed entries + restart array
//! +------------------+
//! | filter block     |  bloom filter over user keys (optional)
//! +------------------+
//! | index block      |  separator internal key -> data block handle
//! +------------------+
//! | footer           |  index handle, filter handle, magic
//! +------------------+
//! ```
//!
//! Every block is followed by a 5-byte trailer: masked CRC32 over the
//! block contents plus the compression-type byte.

mod block;
mod block_builder;
mod filter;
mod iterator;
mod reader;
mod writer;

pub use block::{Block, BlockHandle, BlockIterator};
pub use block_builder::BlockBuilder;
pub use filter::{BloomFilter, BloomFilterBuilder};
pub use iterator::TableIterator;
pub use reader::SSTableReader;
pub use writer::{SSTableInfo, SSTableWriter};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Footer magic number.
pub const FOOTER_MAGIC: u64 = 0x7a5c3d96e4b0f1d8;

/// Footer size: index handle (16) + filter handle (16) + magic (8).
pub const FOOTER_SIZE: usize = 40;

/// Block trailer: CRC (4) + compression type (1).
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Per-block compression marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BlockCompression {
    #[default]
    None = 0,
    Snappy = 1,
}

impl BlockCompression {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(BlockCompression::None),
            1 => Some(BlockCompression::Snappy),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Trailing section locating the index and filter blocks.
#[derive(Debug, Clone)]
pub struct Footer {
    pub index_handle: BlockHandle,
    pub filter_handle: BlockHandle,
}

impl Footer {
    pub fn new(index_handle: BlockHandle, filter_handle: BlockHandle) -> Self {
        Self {
            index_handle,
            filter_handle,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        self.index_handle.encode_to(&mut buf);
        self.filter_handle.encode_to(&mut buf);
        buf.put_u64_le(FOOTER_MAGIC);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(crate::Error::corruption("footer too short"));
        }

        let mut cursor = &data[data.len() - FOOTER_SIZE..];
        let index_handle = BlockHandle::decode(&mut cursor)?;
        let filter_handle = BlockHandle::decode(&mut cursor)?;

        if cursor.get_u64_le() != FOOTER_MAGIC {
            return Err(crate::Error::corruption("not a table file (bad magic)"));
        }

        Ok(Self {
            index_handle,
            filter_handle,
        })
    }
}
