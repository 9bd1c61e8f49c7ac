//! File metadata, versions, version edits, and the version set.

mod file_metadata;
#[allow(clippy::module_inception)]
mod version;
mod version_edit;
mod version_set;

pub use file_metadata::FileMetadata;
pub use version::{find_file, some_file_overlaps_range, GetStats, LevelIterator, Version};
pub use version_edit::{NewFileEntry, VersionEdit};
pub use version_set::VersionSet;
