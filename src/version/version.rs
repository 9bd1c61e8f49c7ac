//! Versions: immutable snapshots of the level-to-files mapping.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::TableCache;
use crate::iterator::InternalIterator;
use crate::memtable::LookupResult;
use crate::options::{Options, ReadOptions, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};
use crate::types::{parse_internal_key, InternalKey, LookupKey, ValueType};
use crate::util::comparator::InternalKeyComparator;
use crate::version::FileMetadata;
use crate::{Error, Result};

/// Which file a lookup consulted without resolving its key; feeds
/// seek-triggered compaction.
#[derive(Debug, Clone)]
pub struct GetStats {
    pub seek_file: Arc<FileMetadata>,
    pub seek_file_level: usize,
}

/// One immutable snapshot of the tree.
///
/// Levels >= 1 hold files that are disjoint in user-key range and sorted
/// by smallest key; level 0 files may overlap and are ordered newest
/// first. Shared via `Arc`: readers, iterators, and compactions keep the
/// versions (and so the files) they work on alive.
pub struct Version {
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    options: Arc<Options>,
    files: [Vec<Arc<FileMetadata>>; NUM_LEVELS],
    /// Seek-compaction candidate, set under the database mutex.
    file_to_compact: Mutex<Option<(usize, Arc<FileMetadata>)>>,
    /// Cached size-compaction hint computed when the version is built.
    compaction_score: f64,
    compaction_level: usize,
}

impl Version {
    pub(crate) fn empty(
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
        options: Arc<Options>,
    ) -> Self {
        Self {
            icmp,
            table_cache,
            options,
            files: Default::default(),
            file_to_compact: Mutex::new(None),
            compaction_score: 0.0,
            compaction_level: 0,
        }
    }

    pub(crate) fn with_files(
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
        options: Arc<Options>,
        files: [Vec<Arc<FileMetadata>>; NUM_LEVELS],
    ) -> Self {
        Self {
            icmp,
            table_cache,
            options,
            files,
            file_to_compact: Mutex::new(None),
            compaction_score: 0.0,
            compaction_level: 0,
        }
    }

    pub(crate) fn set_compaction_hint(&mut self, score: f64, level: usize) {
        self.compaction_score = score;
        self.compaction_level = level;
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetadata>] {
        &self.files[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size()).sum()
    }

    pub fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    pub fn compaction_level(&self) -> usize {
        self.compaction_level
    }

    pub fn file_to_compact(&self) -> Option<(usize, Arc<FileMetadata>)> {
        self.file_to_compact.lock().clone()
    }

    pub(crate) fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Point lookup in leveled order.
    ///
    /// Level-0 candidates are consulted newest file first; deeper levels
    /// probe at most one file each. The returned stats name the first
    /// file that was consulted without resolving the key, if a second
    /// file had to be read.
    pub fn get(
        &self,
        options: &ReadOptions,
        key: &LookupKey,
    ) -> Result<(LookupResult, Option<GetStats>)> {
        let ucmp = self.icmp.user_comparator();
        let user_key = key.user_key();

        let mut stats: Option<GetStats> = None;
        let mut last_file_read: Option<(usize, Arc<FileMetadata>)> = None;

        let mut candidates: Vec<(usize, Arc<FileMetadata>)> = Vec::new();

        // Level 0: every file whose range covers the key, newest first.
        let mut l0: Vec<Arc<FileMetadata>> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(user_key, f.smallest().user_key()) != Ordering::Less
                    && ucmp.compare(user_key, f.largest().user_key()) != Ordering::Greater
            })
            .cloned()
            .collect();
        l0.sort_by(|a, b| b.number().cmp(&a.number()));
        candidates.extend(l0.into_iter().map(|f| (0, f)));

        // Deeper levels: binary search lands on at most one file.
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(&self.icmp, files, key.internal_key());
            if index < files.len() {
                let file = &files[index];
                if ucmp.compare(user_key, file.smallest().user_key()) != Ordering::Less {
                    candidates.push((level, Arc::clone(file)));
                }
            }
        }

        for (level, file) in candidates {
            if stats.is_none() {
                if let Some((seek_level, seek_file)) = last_file_read.take() {
                    // Second file consulted for one lookup: charge the
                    // first one.
                    stats = Some(GetStats {
                        seek_file,
                        seek_file_level: seek_level,
                    });
                }
            }
            last_file_read = Some((level, Arc::clone(&file)));

            let table = self.table_cache.get_table(file.number())?;
            if let Some((found_key, value)) = table.internal_get(options, key.internal_key())? {
                let (found_user_key, _, value_type) = parse_internal_key(&found_key)?;
                if ucmp.compare(found_user_key, user_key) == Ordering::Equal {
                    let result = match value_type {
                        ValueType::Value => LookupResult::Found(value),
                        ValueType::Deletion => LookupResult::Deleted,
                    };
                    return Ok((result, stats));
                }
            }
        }

        Ok((LookupResult::NotFound, stats))
    }

    /// Spend a seek against the file named by `stats`.
    ///
    /// True when the file's budget just ran out and it became the
    /// seek-compaction candidate, i.e. the caller should schedule a
    /// compaction.
    pub fn update_stats(&self, stats: &GetStats) -> bool {
        if stats.seek_file.consume_seek() {
            let mut candidate = self.file_to_compact.lock();
            if candidate.is_none() {
                *candidate = Some((stats.seek_file_level, Arc::clone(&stats.seek_file)));
                return true;
            }
        }
        false
    }

    /// Sample one key position from an iterator.
    ///
    /// If at least two files cover the key's user key, the first is
    /// charged a seek. True advises the caller to schedule compaction.
    pub fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        let Ok((user_key, _, _)) = parse_internal_key(internal_key) else {
            return false;
        };
        let ucmp = self.icmp.user_comparator();

        let mut matches = 0usize;
        let mut first: Option<(usize, Arc<FileMetadata>)> = None;

        for file in &self.files[0] {
            if ucmp.compare(user_key, file.smallest().user_key()) != Ordering::Less
                && ucmp.compare(user_key, file.largest().user_key()) != Ordering::Greater
            {
                matches += 1;
                if first.is_none() {
                    first = Some((0, Arc::clone(file)));
                }
                if matches >= 2 {
                    break;
                }
            }
        }

        if matches < 2 {
            for level in 1..NUM_LEVELS {
                let files = &self.files[level];
                if files.is_empty() {
                    continue;
                }
                let probe = LookupKey::new(user_key, crate::types::MAX_SEQUENCE);
                let index = find_file(&self.icmp, files, probe.internal_key());
                if index < files.len() {
                    let file = &files[index];
                    if ucmp.compare(user_key, file.smallest().user_key()) != Ordering::Less {
                        matches += 1;
                        if first.is_none() {
                            first = Some((level, Arc::clone(file)));
                        }
                        if matches >= 2 {
                            break;
                        }
                    }
                }
            }
        }

        if matches >= 2 {
            if let Some((level, file)) = first {
                return self.update_stats(&GetStats {
                    seek_file: file,
                    seek_file_level: level,
                });
            }
        }
        false
    }

    /// Whether any file at `level` overlaps the user-key range.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// Destination level for a flushed memtable covering the range.
    ///
    /// Pushes past empty levels while the next level stays clear and the
    /// grandparent overlap remains under budget, capped at
    /// [`MAX_MEM_COMPACT_LEVEL`].
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            let start = InternalKey::for_seek(
                bytes::Bytes::copy_from_slice(smallest_user_key),
                crate::types::MAX_SEQUENCE,
            );
            let limit = InternalKey::new(
                bytes::Bytes::copy_from_slice(largest_user_key),
                0,
                ValueType::Deletion,
            );

            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(
                    level + 1,
                    Some(smallest_user_key),
                    Some(largest_user_key),
                ) {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let overlaps =
                        self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                    let overlap_bytes: u64 = overlaps.iter().map(|f| f.file_size()).sum();
                    if overlap_bytes > self.options.max_grandparent_overlap_bytes() {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    /// Collect all files at `level` overlapping `[begin, end]`.
    ///
    /// For level 0 the search restarts with the widened range whenever a
    /// matched file extends it, until a fixed point covers every
    /// transitively overlapping file.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetadata>> {
        let ucmp = self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let mut inputs: Vec<Arc<FileMetadata>> = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let file = &self.files[level][i];
            i += 1;

            let file_start = file.smallest().user_key();
            let file_limit = file.largest().user_key();

            if let Some(begin) = &user_begin {
                if ucmp.compare(file_limit, begin) == Ordering::Less {
                    continue;
                }
            }
            if let Some(end) = &user_end {
                if ucmp.compare(file_start, end) == Ordering::Greater {
                    continue;
                }
            }

            inputs.push(Arc::clone(file));

            if level == 0 {
                // Overlapping level-0 files pull each other in; widen the
                // range and restart until it stops growing.
                let mut restart = false;
                if let Some(begin) = &user_begin {
                    if ucmp.compare(file_start, begin) == Ordering::Less {
                        user_begin = Some(file_start.to_vec());
                        restart = true;
                    }
                }
                if let Some(end) = &user_end {
                    if ucmp.compare(file_limit, end) == Ordering::Greater {
                        user_end = Some(file_limit.to_vec());
                        restart = true;
                    }
                }
                if restart {
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    /// Push one iterator per level-0 file and one concatenating iterator
    /// per non-empty deeper level.
    pub fn add_iterators(
        &self,
        options: &ReadOptions,
        iters: &mut Vec<Box<dyn InternalIterator>>,
    ) -> Result<()> {
        for file in &self.files[0] {
            iters.push(Box::new(self.table_cache.iter_table(
                file.number(),
                options.verify_checksums,
                options.fill_cache,
            )?));
        }

        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(Box::new(LevelIterator::new(
                    self.icmp.clone(),
                    Arc::clone(&self.table_cache),
                    self.files[level].clone(),
                    options.verify_checksums,
                    options.fill_cache,
                )));
            }
        }
        Ok(())
    }

    /// Approximate byte offset of `key` within the version's files.
    pub fn approximate_offset_of(&self, key: &InternalKey) -> u64 {
        let encoded = key.encode();
        let mut result = 0u64;

        for level in 0..NUM_LEVELS {
            for file in &self.files[level] {
                if self.icmp.compare(&file.largest().encode(), &encoded) != Ordering::Greater {
                    // Entirely before the probe.
                    result += file.file_size();
                } else if self.icmp.compare(&file.smallest().encode(), &encoded)
                    == Ordering::Greater
                {
                    // Entirely after; deeper files in a sorted level are
                    // too.
                    if level > 0 {
                        break;
                    }
                } else if let Ok(table) = self.table_cache.get_table(file.number()) {
                    result += table.approximate_offset_of(&encoded);
                }
            }
        }
        result
    }

    /// One line per populated level, for the `sstables` property.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for level in 0..NUM_LEVELS {
            if self.files[level].is_empty() {
                continue;
            }
            out.push_str(&format!("--- level {} ---\n", level));
            for file in &self.files[level] {
                out.push_str(&format!(
                    "{}:{}[{:?} .. {:?}]\n",
                    file.number(),
                    file.file_size(),
                    String::from_utf8_lossy(file.smallest().user_key()),
                    String::from_utf8_lossy(file.largest().user_key()),
                ));
            }
        }
        out
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<usize> = (0..NUM_LEVELS).map(|l| self.files[l].len()).collect();
        f.debug_struct("Version")
            .field("files_per_level", &counts)
            .field("compaction_score", &self.compaction_score)
            .finish()
    }
}

/// Index of the first file whose largest key is >= `target`, by binary
/// search over a sorted, disjoint level.
pub fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetadata>],
    target: &[u8],
) -> usize {
    files.partition_point(|f| icmp.compare(&f.largest().encode(), target) == Ordering::Less)
}

/// Whether any file in `files` overlaps `[smallest, largest]` (user
/// keys). `None` bounds are open.
pub fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint_sorted_files: bool,
    files: &[Arc<FileMetadata>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator();

    if !disjoint_sorted_files {
        // Level 0: check every file.
        return files.iter().any(|f| {
            let before = match largest_user_key {
                Some(largest) => {
                    ucmp.compare(f.smallest().user_key(), largest) == Ordering::Greater
                }
                None => false,
            };
            let after = match smallest_user_key {
                Some(smallest) => {
                    ucmp.compare(f.largest().user_key(), smallest) == Ordering::Less
                }
                None => false,
            };
            !before && !after
        });
    }

    // Binary search over the disjoint range space.
    let index = match smallest_user_key {
        Some(smallest) => {
            let probe = LookupKey::new(smallest, crate::types::MAX_SEQUENCE);
            find_file(icmp, files, probe.internal_key())
        }
        None => 0,
    };

    if index >= files.len() {
        return false;
    }
    match largest_user_key {
        Some(largest) => {
            ucmp.compare(files[index].smallest().user_key(), largest) != Ordering::Greater
        }
        None => true,
    }
}

/// Concatenating cursor over one sorted, disjoint level.
pub struct LevelIterator {
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    files: Vec<Arc<FileMetadata>>,
    verify_checksums: bool,
    fill_cache: bool,
    /// Index of the file backing `data_iter`; `files.len()` = exhausted.
    index: usize,
    data_iter: Option<crate::sstable::TableIterator>,
    status: Option<Error>,
}

impl LevelIterator {
    pub fn new(
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
        files: Vec<Arc<FileMetadata>>,
        verify_checksums: bool,
        fill_cache: bool,
    ) -> Self {
        let index = files.len();
        Self {
            icmp,
            table_cache,
            files,
            verify_checksums,
            fill_cache,
            index,
            data_iter: None,
            status: None,
        }
    }

    fn load_table(&mut self) {
        if self.index >= self.files.len() {
            self.data_iter = None;
            return;
        }
        match self.table_cache.iter_table(
            self.files[self.index].number(),
            self.verify_checksums,
            self.fill_cache,
        ) {
            Ok(iter) => self.data_iter = Some(iter),
            Err(e) => {
                if self.status.is_none() {
                    self.status = Some(e);
                }
                self.data_iter = None;
                self.index = self.files.len();
            }
        }
    }

    fn skip_forward(&mut self) {
        while self
            .data_iter
            .as_ref()
            .map(|i| !i.valid())
            .unwrap_or(true)
        {
            if self.index + 1 >= self.files.len() {
                self.index = self.files.len();
                self.data_iter = None;
                return;
            }
            self.index += 1;
            self.load_table();
            if let Some(iter) = self.data_iter.as_mut() {
                iter.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while self
            .data_iter
            .as_ref()
            .map(|i| !i.valid())
            .unwrap_or(true)
        {
            if self.index == 0 {
                self.index = self.files.len();
                self.data_iter = None;
                return;
            }
            self.index -= 1;
            self.load_table();
            if let Some(iter) = self.data_iter.as_mut() {
                iter.seek_to_last();
            }
        }
    }
}

impl InternalIterator for LevelIterator {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map(|i| i.valid()).unwrap_or(false)
    }

    fn seek_to_first(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.index = 0;
        self.load_table();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek_to_first();
        }
        self.skip_forward();
    }

    fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.index = self.files.len() - 1;
        self.load_table();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek_to_last();
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        if self.index >= self.files.len() {
            self.data_iter = None;
            return;
        }
        self.load_table();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek(target);
        }
        self.skip_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = self.data_iter.as_mut() {
            iter.next();
        }
        self.skip_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = self.data_iter.as_mut() {
            iter.prev();
        }
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator is valid").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator is valid").value()
    }

    fn status(&self) -> Result<()> {
        if let Some(e) = &self.status {
            return Err(e.clone());
        }
        if let Some(iter) = &self.data_iter {
            iter.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator::new()))
    }

    fn key(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(Bytes::copy_from_slice(user_key), seq, ValueType::Value)
    }

    fn file(number: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetadata> {
        Arc::new(FileMetadata::new(
            number,
            1024,
            key(smallest, 100),
            key(largest, 1),
        ))
    }

    fn version_with(files: [Vec<Arc<FileMetadata>>; NUM_LEVELS]) -> Version {
        let dir = tempdir().unwrap();
        let options = Arc::new(Options::default());
        let cache = Arc::new(TableCache::new(dir.path(), icmp(), 16, None));
        Version::with_files(icmp(), cache, options, files)
    }

    #[test]
    fn test_find_file() {
        let files = vec![file(1, b"c", b"e"), file(2, b"g", b"i"), file(3, b"k", b"m")];
        let cmp = icmp();

        let probe = |user_key: &[u8]| {
            let lkey = LookupKey::new(user_key, crate::types::MAX_SEQUENCE);
            find_file(&cmp, &files, lkey.internal_key())
        };

        assert_eq!(probe(b"a"), 0);
        assert_eq!(probe(b"d"), 0);
        assert_eq!(probe(b"e"), 0);
        assert_eq!(probe(b"f"), 1);
        assert_eq!(probe(b"j"), 2);
        assert_eq!(probe(b"z"), 3);
    }

    #[test]
    fn test_overlap_in_level_sorted() {
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        files[1] = vec![file(1, b"c", b"e"), file(2, b"g", b"i")];
        let version = version_with(files);

        assert!(version.overlap_in_level(1, Some(b"d"), Some(b"d")));
        assert!(version.overlap_in_level(1, Some(b"a"), Some(b"c")));
        assert!(version.overlap_in_level(1, Some(b"e"), Some(b"f")));
        assert!(!version.overlap_in_level(1, Some(b"f"), Some(b"f")));
        assert!(!version.overlap_in_level(1, Some(b"j"), Some(b"z")));
        assert!(version.overlap_in_level(1, None, Some(b"c")));
        assert!(version.overlap_in_level(1, Some(b"i"), None));
    }

    #[test]
    fn test_overlap_in_level_zero() {
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        files[0] = vec![file(2, b"a", b"m"), file(1, b"k", b"z")];
        let version = version_with(files);

        assert!(version.overlap_in_level(0, Some(b"l"), Some(b"l")));
        assert!(version.overlap_in_level(0, Some(b"z"), None));
        assert!(!version.overlap_in_level(0, Some(b"zz"), None));
    }

    #[test]
    fn test_get_overlapping_inputs_sorted_level() {
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        files[1] = vec![
            file(1, b"a", b"c"),
            file(2, b"e", b"g"),
            file(3, b"i", b"k"),
        ];
        let version = version_with(files);

        let inputs = version.get_overlapping_inputs(1, Some(&key(b"f", 1)), Some(&key(b"j", 1)));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number()).collect();
        assert_eq!(numbers, vec![2, 3]);

        let all = version.get_overlapping_inputs(1, None, None);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_get_overlapping_inputs_l0_expands_to_fixpoint() {
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        // c..e overlaps d..g which overlaps f..i; querying [d, d] must
        // pull in the whole chain.
        files[0] = vec![
            file(3, b"f", b"i"),
            file(2, b"d", b"g"),
            file(1, b"c", b"e"),
        ];
        let version = version_with(files);

        let inputs = version.get_overlapping_inputs(0, Some(&key(b"d", 1)), Some(&key(b"d", 1)));
        assert_eq!(inputs.len(), 3);
    }

    #[test]
    fn test_pick_level_for_memtable_output() {
        // Empty version: the output can sink to the cap.
        let version = version_with(Default::default());
        assert_eq!(
            version.pick_level_for_memtable_output(b"a", b"z"),
            MAX_MEM_COMPACT_LEVEL
        );

        // Overlap at level 0 pins the output at level 0.
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        files[0] = vec![file(1, b"a", b"m")];
        let version = version_with(files);
        assert_eq!(version.pick_level_for_memtable_output(b"c", b"d"), 0);

        // Overlap at level 1 stops the descent before it.
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        files[1] = vec![file(1, b"a", b"m")];
        let version = version_with(files);
        assert_eq!(version.pick_level_for_memtable_output(b"c", b"d"), 0);

        // Overlap only at level 2: flush may go to level 1.
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        files[2] = vec![file(1, b"a", b"m")];
        let version = version_with(files);
        assert_eq!(version.pick_level_for_memtable_output(b"c", b"d"), 1);
    }

    #[test]
    fn test_update_stats_flags_once() {
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        let f = file(1, b"a", b"m");
        files[1] = vec![Arc::clone(&f)];
        let version = version_with(files);

        let stats = GetStats {
            seek_file: Arc::clone(&f),
            seek_file_level: 1,
        };

        let mut advised = 0;
        for _ in 0..200 {
            if version.update_stats(&stats) {
                advised += 1;
            }
        }
        // Budget is 100 seeks; the candidate slot is set exactly once.
        assert_eq!(advised, 1);
        let (level, candidate) = version.file_to_compact().unwrap();
        assert_eq!(level, 1);
        assert_eq!(candidate.number(), 1);
    }

    #[test]
    fn test_record_read_sample_needs_two_files() {
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        files[0] = vec![file(2, b"a", b"m")];
        files[1] = vec![file(1, b"a", b"m")];
        let version = version_with(files);

        let probe = key(b"c", 1).encode();
        // Two files cover "c": each sample charges the level-0 file.
        for _ in 0..100 {
            version.record_read_sample(&probe);
        }
        let (level, candidate) = version.file_to_compact().unwrap();
        assert_eq!(level, 0);
        assert_eq!(candidate.number(), 2);
    }

    #[test]
    fn test_record_read_sample_single_file_no_charge() {
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        files[1] = vec![file(1, b"a", b"m")];
        let version = version_with(files);

        let probe = key(b"c", 1).encode();
        for _ in 0..500 {
            assert!(!version.record_read_sample(&probe));
        }
        assert!(version.file_to_compact().is_none());
    }
}
