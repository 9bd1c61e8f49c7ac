//! Compaction execution state.
//!
//! The runtime drives the merge loop; this module holds the bookkeeping
//! that travels with one running compaction: the output files being
//! built, the snapshot floor the drop rules honor, and the per-level
//! timing/byte counters reported by the `stats` property.

use crate::compaction::Compaction;
use crate::sstable::SSTableWriter;
use crate::types::InternalKey;

/// One output file of a running compaction.
#[derive(Debug, Clone)]
pub struct CompactionOutput {
    pub number: u64,
    pub file_size: u64,
    pub smallest: Option<InternalKey>,
    pub largest: Option<InternalKey>,
}

/// Mutable state of one compaction run.
pub struct CompactionState {
    pub compaction: Compaction,
    /// Sequence numbers at or below this are invisible to every live
    /// snapshot; shadowed entries under it may be dropped.
    pub smallest_snapshot: u64,
    pub outputs: Vec<CompactionOutput>,
    /// Builder for the output currently being written.
    pub builder: Option<SSTableWriter>,
    pub total_bytes: u64,
}

impl CompactionState {
    pub fn new(compaction: Compaction, smallest_snapshot: u64) -> Self {
        Self {
            compaction,
            smallest_snapshot,
            outputs: Vec::new(),
            builder: None,
            total_bytes: 0,
        }
    }

    pub fn current_output(&mut self) -> &mut CompactionOutput {
        self.outputs.last_mut().expect("an output file is open")
    }
}

/// Per-level compaction counters, surfaced through the `stats` property.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionStats {
    pub micros: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl CompactionStats {
    pub fn add(&mut self, other: &CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}
