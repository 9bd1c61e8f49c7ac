//! Per-table-file metadata.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::types::InternalKey;

/// Metadata for one table file.
///
/// Shared (via `Arc`) among every version that references the file. The
/// file is deleted from disk only once no live version names it and no
/// in-flight compaction holds it in the pending-output set.
#[derive(Debug)]
pub struct FileMetadata {
    number: u64,
    file_size: u64,
    smallest: InternalKey,
    largest: InternalKey,
    /// Seek budget: point reads that consult this file without resolving
    /// their key decrement it; at zero the file becomes a seek-compaction
    /// candidate.
    allowed_seeks: AtomicI64,
}

impl FileMetadata {
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        // One seek costs about as much as compacting 16 KiB, with a floor
        // so small files are not compacted after a handful of misses.
        let allowed_seeks = std::cmp::max(100, (file_size / 16384) as i64);

        Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn smallest(&self) -> &InternalKey {
        &self.smallest
    }

    pub fn largest(&self) -> &InternalKey {
        &self.largest
    }

    /// Spend one seek. True once the budget is exhausted.
    pub fn consume_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::Relaxed) - 1 <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;
    use bytes::Bytes;

    fn key(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(Bytes::copy_from_slice(user_key), seq, ValueType::Value)
    }

    #[test]
    fn test_basic_fields() {
        let meta = FileMetadata::new(7, 4096, key(b"aaa", 1), key(b"zzz", 9));
        assert_eq!(meta.number(), 7);
        assert_eq!(meta.file_size(), 4096);
        assert_eq!(meta.smallest().user_key(), b"aaa");
        assert_eq!(meta.largest().user_key(), b"zzz");
    }

    fn seeks_until_exhausted(meta: &FileMetadata) -> usize {
        let mut seeks = 1;
        while !meta.consume_seek() {
            seeks += 1;
        }
        seeks
    }

    #[test]
    fn test_seek_budget_floor() {
        // A tiny file still gets 100 allowed seeks.
        let meta = FileMetadata::new(1, 1024, key(b"a", 1), key(b"b", 1));
        assert_eq!(seeks_until_exhausted(&meta), 100);
    }

    #[test]
    fn test_seek_budget_scales_with_size() {
        let meta = FileMetadata::new(1, 32 * 1024 * 1024, key(b"a", 1), key(b"b", 1));
        assert_eq!(seeks_until_exhausted(&meta), (32 * 1024 * 1024) / 16384);
    }

    #[test]
    fn test_consume_seek_stays_exhausted() {
        let meta = FileMetadata::new(1, 0, key(b"a", 1), key(b"b", 1));
        assert_eq!(seeks_until_exhausted(&meta), 100);
        // Once exhausted, every further seek reports exhaustion too.
        assert!(meta.consume_seek());
        assert!(meta.consume_seek());
    }
}
