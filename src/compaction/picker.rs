//! Compaction descriptions.
//!
//! A [`Compaction`] names the files merged from level L and level L+1,
//! plus the grandparent (L+2) files used to split outputs so the next
//! compaction down is never forced to rewrite too much at once.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::options::{Options, NUM_LEVELS};
use crate::types::InternalKey;
use crate::util::comparator::InternalKeyComparator;
use crate::version::{FileMetadata, Version, VersionEdit};

/// Sum of file sizes.
pub fn total_file_size(files: &[Arc<FileMetadata>]) -> u64 {
    files.iter().map(|f| f.file_size()).sum()
}

/// A planned merge of level `level` into level `level + 1`.
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grandparent_overlap_bytes: u64,
    icmp: InternalKeyComparator,
    /// The version the inputs were picked from; held so its files stay
    /// live for the duration of the work.
    input_version: Arc<Version>,
    /// The edit that will delete the inputs and add the outputs.
    pub edit: VersionEdit,
    /// inputs[0] = level files, inputs[1] = level+1 files.
    pub(crate) inputs: [Vec<Arc<FileMetadata>>; 2],
    /// Level+2 files overlapping the compaction range.
    pub(crate) grandparents: Vec<Arc<FileMetadata>>,
    // State for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    // Per-level cursors for is_base_level_for_key; they only ever move
    // forward because keys arrive in order.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(
        options: &Options,
        icmp: InternalKeyComparator,
        level: usize,
        input_version: Arc<Version>,
    ) -> Self {
        Self {
            level,
            max_output_file_size: options.max_file_size,
            max_grandparent_overlap_bytes: options.max_grandparent_overlap_bytes(),
            icmp,
            input_version,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    /// The level being compacted from.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Byte size at which an output file is closed.
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetadata> {
        &self.inputs[which][i]
    }

    pub fn inputs(&self, which: usize) -> &[Arc<FileMetadata>] {
        &self.inputs[which]
    }

    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    /// A single level-L file, nothing overlapping at L+1, and little
    /// enough grandparent overlap can be renamed up a level instead of
    /// rewritten.
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap_bytes
    }

    /// Record every input file as deleted in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.delete_file(self.level + which, file.number());
            }
        }
    }

    /// True iff no level deeper than the output level has a file whose
    /// range covers `user_key`. Drives the tombstone drop rule: a
    /// deletion at its base level shadows nothing below and can go.
    ///
    /// Keys must be queried in ascending user-key order; the per-level
    /// cursors advance monotonically across the whole compaction.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let ucmp = self.icmp.user_comparator();
        for level in self.level + 2..NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, file.largest().user_key()) != Ordering::Greater {
                    if ucmp.compare(user_key, file.smallest().user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Whether the current output should be closed before appending
    /// `internal_key`, to bound how much of level+2 any one output file
    /// overlaps.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.compare(
                internal_key,
                &self.grandparents[self.grandparent_index].largest().encode(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes +=
                    self.grandparents[self.grandparent_index].file_size();
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap_bytes {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compaction")
            .field("level", &self.level)
            .field("level_inputs", &self.inputs[0].len())
            .field("level_plus_one_inputs", &self.inputs[1].len())
            .field("grandparents", &self.grandparents.len())
            .finish()
    }
}

/// Largest key across `files` by internal-key order.
fn find_largest_key<'a>(
    icmp: &InternalKeyComparator,
    files: &'a [Arc<FileMetadata>],
) -> Option<&'a InternalKey> {
    let mut largest: Option<&InternalKey> = None;
    for file in files {
        match largest {
            None => largest = Some(file.largest()),
            Some(current) => {
                if icmp.compare(&file.largest().encode(), &current.encode()) == Ordering::Greater {
                    largest = Some(file.largest());
                }
            }
        }
    }
    largest
}

/// The file in `level_files` whose smallest key shares `largest_key`'s
/// user key but sits after it in internal order, minimal among such.
fn find_smallest_boundary_file(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetadata>],
    largest_key: &InternalKey,
) -> Option<Arc<FileMetadata>> {
    let ucmp = icmp.user_comparator();
    let largest_encoded = largest_key.encode();

    let mut smallest_boundary: Option<&Arc<FileMetadata>> = None;
    for file in level_files {
        let file_smallest = file.smallest();
        if icmp.compare(&file_smallest.encode(), &largest_encoded) == Ordering::Greater
            && ucmp.compare(file_smallest.user_key(), largest_key.user_key()) == Ordering::Equal
        {
            let replace = match smallest_boundary {
                None => true,
                Some(current) => {
                    icmp.compare(&file_smallest.encode(), &current.smallest().encode())
                        == Ordering::Less
                }
            };
            if replace {
                smallest_boundary = Some(file);
            }
        }
    }
    smallest_boundary.cloned()
}

/// Pull boundary files into a compaction's input set.
///
/// Two files in one level may both hold records for the same user key at
/// different sequences (the older record as one file's largest key, the
/// newer as the next file's smallest). Compacting one without the other
/// would leave the newer record below the older one in the tree, so the
/// input set is grown until no such split user key remains on its upper
/// edge.
pub fn add_boundary_inputs(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetadata>],
    compaction_files: &mut Vec<Arc<FileMetadata>>,
) {
    let mut largest_key = match find_largest_key(icmp, compaction_files) {
        Some(key) => key.clone(),
        None => return,
    };

    while let Some(boundary) = find_smallest_boundary_file(icmp, level_files, &largest_key) {
        largest_key = boundary.largest().clone();
        compaction_files.push(boundary);
    }
}

/// Smallest and largest internal keys across `files`.
pub fn key_range(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetadata>],
) -> (InternalKey, InternalKey) {
    debug_assert!(!files.is_empty());
    let mut smallest = files[0].smallest().clone();
    let mut largest = files[0].largest().clone();
    for file in &files[1..] {
        if icmp.compare(&file.smallest().encode(), &smallest.encode()) == Ordering::Less {
            smallest = file.smallest().clone();
        }
        if icmp.compare(&file.largest().encode(), &largest.encode()) == Ordering::Greater {
            largest = file.largest().clone();
        }
    }
    (smallest, largest)
}
