//! Background merging of table files.
//!
//! A compaction merges the files of level L with the overlapping files of
//! level L+1 into new L+1 files, dropping entries that are shadowed below
//! every live snapshot and tombstones that have reached their base level.
//! Planning (input selection, boundary expansion, grandparent tracking)
//! lives in [`picker`]; the runtime executes the merge and installs the
//! resulting version edit.

pub mod compactor;
pub mod merge_iterator;
pub mod picker;

pub use compactor::{CompactionOutput, CompactionState, CompactionStats};
pub use merge_iterator::MergingIterator;
pub use picker::{add_boundary_inputs, key_range, total_file_size, Compaction};
