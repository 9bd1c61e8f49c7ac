//! Configuration.

use std::sync::Arc;

use crate::snapshot::Snapshot;
use crate::util::comparator::{BytewiseComparator, Comparator};

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which incoming writes are delayed by 1 ms each.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Level-0 file count at which writes stop until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Deepest level a freshly flushed memtable may be placed at when it does
/// not overlap the intermediate levels.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Approximate user-iterator bytes between read samples.
pub const READ_BYTES_PERIOD: u64 = 1024 * 1024;

/// Block compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Store blocks verbatim.
    None,
    /// Snappy-compress blocks, falling back to verbatim storage when the
    /// compressed form is not smaller.
    #[default]
    Snappy,
}

/// Options controlling an open database.
#[derive(Clone)]
pub struct Options {
    /// Create the database if the directory holds no CURRENT file.
    pub create_if_missing: bool,

    /// Fail `open` if the database already exists.
    pub error_if_exists: bool,

    /// Treat recoverable read errors (dropped log tails, bad checksums)
    /// as fatal corruption.
    pub paranoid_checks: bool,

    /// Memtable size that triggers a flush. Clamped to [64 KiB, 1 GiB].
    pub write_buffer_size: usize,

    /// Cap on open file handles. Clamped to [74, 50000].
    pub max_open_files: usize,

    /// Target uncompressed size of a table data block.
    pub block_size: usize,

    /// Entries between restart points within a block.
    pub block_restart_interval: usize,

    /// Capacity of the decoded-block cache in bytes. Zero disables it.
    pub block_cache_size: usize,

    /// Byte size at which a compaction output file is closed.
    /// Clamped to [1 MiB, 1 GiB].
    pub max_file_size: u64,

    /// Block compression codec.
    pub compression: Compression,

    /// Reuse the tail write-ahead log and manifest on recovery instead of
    /// starting fresh ones.
    pub reuse_logs: bool,

    /// Bloom filter bits per key in table files. Zero disables the filter.
    pub filter_bits_per_key: usize,

    /// User-key ordering. The persisted comparator name must match on
    /// reopen.
    pub comparator: Arc<dyn Comparator>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            block_cache_size: 8 * 1024 * 1024,
            max_file_size: 2 * 1024 * 1024,
            compression: Compression::default(),
            reuse_logs: false,
            filter_bits_per_key: 10,
            comparator: Arc::new(BytewiseComparator::new()),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp out-of-range fields into their supported windows.
    pub fn sanitize(&mut self) {
        self.write_buffer_size = self
            .write_buffer_size
            .clamp(64 * 1024, 1024 * 1024 * 1024);
        self.max_open_files = self.max_open_files.clamp(74, 50000);
        self.max_file_size = self
            .max_file_size
            .clamp(1024 * 1024, 1024 * 1024 * 1024);
    }

    /// Byte budget of a level; level 0 is scored by file count instead.
    ///
    /// Level 1 holds 10 MiB and each deeper level ten times its parent.
    pub fn max_bytes_for_level(&self, level: usize) -> f64 {
        let mut result = 10.0 * 1048576.0;
        let mut level = level;
        while level > 1 {
            result *= 10.0;
            level -= 1;
        }
        result
    }

    /// Maximum bytes of grandparent overlap before a compaction output is
    /// split.
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.max_file_size
    }

    /// Byte cap on the inputs of one expanded compaction.
    pub fn expanded_compaction_byte_size_limit(&self) -> u64 {
        25 * self.max_file_size
    }

    /// Handles the table cache may keep open.
    pub fn table_cache_capacity(&self) -> usize {
        // A few handles are reserved for the log, manifest, and CURRENT.
        self.max_open_files - 10
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_open_files", &self.max_open_files)
            .field("block_size", &self.block_size)
            .field("max_file_size", &self.max_file_size)
            .field("compression", &self.compression)
            .field("reuse_logs", &self.reuse_logs)
            .field("filter_bits_per_key", &self.filter_bits_per_key)
            .field("comparator", &self.comparator.name())
            .finish()
    }
}

/// Options for read operations.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Verify block checksums on every read.
    pub verify_checksums: bool,

    /// Whether blocks read for this operation should populate the block
    /// cache.
    pub fill_cache: bool,

    /// Read as of this snapshot instead of the current state.
    pub snapshot: Option<Snapshot>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for write operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Sync the write-ahead log before acknowledging the write.
    pub sync: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert!(opts.create_if_missing);
        assert!(!opts.error_if_exists);
        assert_eq!(opts.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(opts.comparator.name(), "stratumdb.BytewiseComparator");
    }

    #[test]
    fn test_sanitize_clamps() {
        let mut opts = Options::default();
        opts.write_buffer_size = 1;
        opts.max_open_files = 5;
        opts.max_file_size = 1;
        opts.sanitize();

        assert_eq!(opts.write_buffer_size, 64 * 1024);
        assert_eq!(opts.max_open_files, 74);
        assert_eq!(opts.max_file_size, 1024 * 1024);

        opts.write_buffer_size = usize::MAX;
        opts.max_open_files = usize::MAX;
        opts.max_file_size = u64::MAX;
        opts.sanitize();

        assert_eq!(opts.write_buffer_size, 1024 * 1024 * 1024);
        assert_eq!(opts.max_open_files, 50000);
        assert_eq!(opts.max_file_size, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_level_budgets() {
        let opts = Options::default();
        assert_eq!(opts.max_bytes_for_level(1), 10.0 * 1048576.0);
        assert_eq!(opts.max_bytes_for_level(2), 100.0 * 1048576.0);
        assert_eq!(opts.max_bytes_for_level(3), 1000.0 * 1048576.0);
    }

    #[test]
    fn test_compaction_byte_limits() {
        let opts = Options::default();
        assert_eq!(opts.max_grandparent_overlap_bytes(), 10 * opts.max_file_size);
        assert_eq!(
            opts.expanded_compaction_byte_size_limit(),
            25 * opts.max_file_size
        );
    }
}
