//! The version set: the sequence of versions, the manifest log, and the
//! compaction planner state.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::cache::TableCache;
use crate::compaction::{
    add_boundary_inputs, key_range, total_file_size, Compaction, MergingIterator,
};
use crate::iterator::InternalIterator;
use crate::options::{Options, L0_COMPACTION_TRIGGER, NUM_LEVELS};
use crate::util::comparator::InternalKeyComparator;
use crate::util::filename::{manifest_file_path, parse_manifest_name, read_current_file, set_current_file};
use crate::version::{FileMetadata, Version, VersionEdit};
use crate::wal::{CorruptionReporter, LogReader, LogWriter};
use crate::{Error, Result};

/// Owns the current version, the live-version registry, the manifest
/// writer, the file-number allocator, and the compaction cursor state.
pub struct VersionSet {
    db_path: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    next_file_number: AtomicU64,
    manifest_file_number: AtomicU64,
    last_sequence: AtomicU64,
    log_number: AtomicU64,
    prev_log_number: AtomicU64,

    current: ArcSwap<Version>,
    /// Every published version still referenced somewhere. Entries whose
    /// last `Arc` dropped are pruned opportunistically.
    live_versions: Mutex<Vec<Weak<Version>>>,

    manifest_log: Mutex<Option<LogWriter>>,
    /// Per-level resume point (encoded internal key) for the round-robin
    /// size-compaction cursor; empty = start of level.
    compact_pointers: Mutex<[Vec<u8>; NUM_LEVELS]>,
}

impl VersionSet {
    pub fn new(
        db_path: &Path,
        options: Arc<Options>,
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
    ) -> Self {
        let empty = Arc::new(Version::empty(
            icmp.clone(),
            Arc::clone(&table_cache),
            Arc::clone(&options),
        ));
        Self {
            db_path: db_path.to_path_buf(),
            options,
            icmp,
            table_cache,
            next_file_number: AtomicU64::new(2),
            manifest_file_number: AtomicU64::new(1),
            last_sequence: AtomicU64::new(0),
            log_number: AtomicU64::new(0),
            prev_log_number: AtomicU64::new(0),
            live_versions: Mutex::new(vec![Arc::downgrade(&empty)]),
            current: ArcSwap::from(empty),
            manifest_log: Mutex::new(None),
            compact_pointers: Mutex::new(Default::default()),
        }
    }

    pub fn current(&self) -> Arc<Version> {
        self.current.load_full()
    }

    fn install(&self, version: Arc<Version>) {
        let mut live = self.live_versions.lock();
        live.retain(|w| w.strong_count() > 0);
        live.push(Arc::downgrade(&version));
        self.current.store(version);
    }

    /// Allocate a fresh file number.
    pub fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, AtomicOrdering::SeqCst)
    }

    /// Return an allocated-but-unused number to the allocator. Only the
    /// most recently allocated number can be taken back.
    pub fn reuse_file_number(&self, number: u64) {
        let _ = self.next_file_number.compare_exchange(
            number + 1,
            number,
            AtomicOrdering::SeqCst,
            AtomicOrdering::SeqCst,
        );
    }

    /// Ensure the allocator never hands out `number` again.
    pub fn mark_file_number_used(&self, number: u64) {
        self.next_file_number
            .fetch_max(number + 1, AtomicOrdering::SeqCst);
    }

    pub fn next_file_number_peek(&self) -> u64 {
        self.next_file_number.load(AtomicOrdering::SeqCst)
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number.load(AtomicOrdering::SeqCst)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(AtomicOrdering::SeqCst)
    }

    pub fn set_last_sequence(&self, seq: u64) {
        debug_assert!(seq >= self.last_sequence());
        self.last_sequence.store(seq, AtomicOrdering::SeqCst);
    }

    pub fn log_number(&self) -> u64 {
        self.log_number.load(AtomicOrdering::SeqCst)
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number.load(AtomicOrdering::SeqCst)
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current().num_files(level)
    }

    /// Union of file numbers referenced by any live version.
    pub fn live_files(&self) -> HashSet<u64> {
        let mut live = HashSet::new();
        let mut versions = self.live_versions.lock();
        versions.retain(|w| w.strong_count() > 0);
        for weak in versions.iter() {
            if let Some(version) = weak.upgrade() {
                for level in 0..NUM_LEVELS {
                    for file in version.files(level) {
                        live.insert(file.number());
                    }
                }
            }
        }
        live
    }

    /// Whether a size- or seek-triggered compaction is pending.
    pub fn needs_compaction(&self) -> bool {
        let current = self.current();
        current.compaction_score() >= 1.0 || current.file_to_compact().is_some()
    }

    /// Apply `edit` atop the current version, persist it to the manifest,
    /// and install the result.
    ///
    /// Called from the single background task and from open; callers do
    /// not hold the database mutex across the manifest I/O.
    pub fn log_and_apply(&self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(n) => debug_assert!(n >= self.log_number() && n < self.next_file_number_peek()),
            None => edit.set_log_number(self.log_number()),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number());
        }
        edit.set_next_file_number(self.next_file_number_peek());
        edit.set_last_sequence(self.last_sequence());

        let base = self.current();
        let mut builder = VersionBuilder::new(self, Arc::clone(&base));
        builder.apply(edit);
        let version = Arc::new(builder.finish());

        let mut manifest_guard = self.manifest_log.lock();
        let created = manifest_guard.is_none();
        let manifest_number = self.manifest_file_number();
        let manifest_path = manifest_file_path(&self.db_path, manifest_number);

        let write_result = (|| -> Result<()> {
            if created {
                let mut log = LogWriter::new(&manifest_path)?;
                // A fresh manifest starts with a snapshot of the state it
                // was branched from.
                let snapshot = self.snapshot_edit(&base);
                log.add_record(&snapshot.encode())?;
                *manifest_guard = Some(log);
            }
            let log = manifest_guard.as_mut().unwrap();
            log.add_record(&edit.encode())?;
            log.sync()?;
            if created {
                set_current_file(&self.db_path, manifest_number)?;
            }
            Ok(())
        })();

        if let Err(e) = write_result {
            if created {
                // Do not leave a half-written manifest behind.
                *manifest_guard = None;
                let _ = std::fs::remove_file(&manifest_path);
            }
            return Err(e);
        }
        drop(manifest_guard);

        self.install(version);
        self.log_number
            .store(edit.log_number.unwrap(), AtomicOrdering::SeqCst);
        self.prev_log_number
            .store(edit.prev_log_number.unwrap(), AtomicOrdering::SeqCst);
        Ok(())
    }

    /// An edit reproducing `version` from scratch.
    fn snapshot_edit(&self, version: &Version) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_comparator(self.icmp.user_comparator().name());

        let pointers = self.compact_pointers.lock();
        for (level, pointer) in pointers.iter().enumerate() {
            if !pointer.is_empty() {
                if let Ok(key) = crate::types::InternalKey::decode(pointer) {
                    edit.set_compact_pointer(level, key);
                }
            }
        }
        drop(pointers);

        for level in 0..NUM_LEVELS {
            for file in version.files(level) {
                edit.add_file(
                    level,
                    file.number(),
                    file.file_size(),
                    file.smallest().clone(),
                    file.largest().clone(),
                );
            }
        }
        edit
    }

    /// Rebuild state from CURRENT and the manifest it names.
    ///
    /// Returns true when the manifest could not be reused and the caller
    /// must persist a fresh one (which the next `log_and_apply` does).
    pub fn recover(&self) -> Result<bool> {
        let current_name = read_current_file(&self.db_path)?;
        let manifest_number = parse_manifest_name(&current_name)
            .ok_or_else(|| Error::corruption("CURRENT does not name a manifest"))?;
        let manifest_path = self.db_path.join(&current_name);

        struct Reporter {
            error: Option<Error>,
        }
        impl CorruptionReporter for Reporter {
            fn corruption(&mut self, bytes: u64, reason: &str) {
                if self.error.is_none() {
                    self.error = Some(Error::corruption(format!(
                        "manifest: {} ({} bytes dropped)",
                        reason, bytes
                    )));
                }
            }
        }

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        let mut builder = VersionBuilder::new(self, self.current());

        {
            let mut reporter = Reporter { error: None };
            let mut reader = LogReader::new(&manifest_path, Some(&mut reporter))?;

            while let Some(record) = reader.read_record()? {
                let edit = VersionEdit::decode(&record)?;

                if let Some(ref name) = edit.comparator {
                    if name != self.icmp.user_comparator().name() {
                        return Err(Error::invalid_argument(format!(
                            "comparator mismatch: manifest has {}, options supply {}",
                            name,
                            self.icmp.user_comparator().name()
                        )));
                    }
                }

                builder.apply(&edit);

                if edit.log_number.is_some() {
                    log_number = edit.log_number;
                }
                if edit.prev_log_number.is_some() {
                    prev_log_number = edit.prev_log_number;
                }
                if edit.next_file_number.is_some() {
                    next_file_number = edit.next_file_number;
                }
                if edit.last_sequence.is_some() {
                    last_sequence = edit.last_sequence;
                }
            }

            if let Some(e) = reporter.error {
                return Err(e);
            }
        }

        let next_file_number = next_file_number
            .ok_or_else(|| Error::corruption("manifest carries no next-file-number entry"))?;
        let log_number =
            log_number.ok_or_else(|| Error::corruption("manifest carries no log-number entry"))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::corruption("manifest carries no last-sequence entry"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.next_file_number
            .store(next_file_number, AtomicOrdering::SeqCst);
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);
        self.last_sequence
            .store(last_sequence, AtomicOrdering::SeqCst);
        self.log_number.store(log_number, AtomicOrdering::SeqCst);
        self.prev_log_number
            .store(prev_log_number, AtomicOrdering::SeqCst);

        let version = Arc::new(builder.finish());
        self.install(version);

        if self.reuse_manifest(&manifest_path, manifest_number)? {
            Ok(false)
        } else {
            self.manifest_file_number
                .store(self.new_file_number(), AtomicOrdering::SeqCst);
            Ok(true)
        }
    }

    /// Keep appending to the recovered manifest when allowed and small
    /// enough.
    fn reuse_manifest(&self, manifest_path: &Path, manifest_number: u64) -> Result<bool> {
        if !self.options.reuse_logs {
            return Ok(false);
        }
        let size = match std::fs::metadata(manifest_path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(false),
        };
        if size >= self.options.max_file_size {
            return Ok(false);
        }

        *self.manifest_log.lock() = Some(LogWriter::open_for_append(manifest_path)?);
        self.manifest_file_number
            .store(manifest_number, AtomicOrdering::SeqCst);
        tracing::debug!(manifest = manifest_number, "reusing manifest");
        Ok(true)
    }

    /// Pick the next automatic compaction: size-triggered first, then
    /// seek-triggered.
    pub fn pick_compaction(&self) -> Option<Compaction> {
        let current = self.current();

        let size_compaction = current.compaction_score() >= 1.0;
        let seek_compaction = current.file_to_compact();

        let mut compaction = if size_compaction {
            let level = current.compaction_level();
            debug_assert!(level + 1 < NUM_LEVELS);
            if current.files(level).is_empty() {
                return None;
            }

            let mut c = Compaction::new(
                &self.options,
                self.icmp.clone(),
                level,
                Arc::clone(&current),
            );

            // Resume after the last compacted key at this level, wrapping
            // to the first file when the cursor is past the end.
            let picked = {
                let pointers = self.compact_pointers.lock();
                let pointer = &pointers[level];
                current
                    .files(level)
                    .iter()
                    .find(|f| {
                        pointer.is_empty()
                            || self.icmp.compare(&f.largest().encode(), pointer)
                                == Ordering::Greater
                    })
                    .or_else(|| current.files(level).first())
                    .cloned()
            };
            c.inputs[0] = vec![picked?];

            if level == 0 {
                // Pull in every transitively overlapping level-0 file.
                let (smallest, largest) = key_range(&self.icmp, &c.inputs[0]);
                c.inputs[0] =
                    current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
                debug_assert!(!c.inputs[0].is_empty());
            }
            c
        } else if let Some((level, file)) = seek_compaction {
            if level + 1 >= NUM_LEVELS {
                return None;
            }
            let mut c = Compaction::new(
                &self.options,
                self.icmp.clone(),
                level,
                Arc::clone(&current),
            );
            c.inputs[0] = vec![file];
            c
        } else {
            return None;
        };

        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Plan a compaction covering `[begin, end]` at `level`, or None when
    /// nothing there overlaps.
    pub fn compact_range(
        &self,
        level: usize,
        begin: Option<&crate::types::InternalKey>,
        end: Option<&crate::types::InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Outside level 0 a manual range is chopped so one round never
        // rewrites unbounded amounts of data.
        if level > 0 {
            let limit = self.options.max_file_size;
            let mut total = 0u64;
            for i in 0..inputs.len() {
                total += inputs[i].file_size();
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(&self.options, self.icmp.clone(), level, current);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Complete a compaction plan: boundary-expand the level inputs, pick
    /// the overlapping level+1 files, optionally grow the level inputs
    /// while that does not change the level+1 set, and record the
    /// grandparents and the new compaction cursor.
    fn setup_other_inputs(&self, c: &mut Compaction) {
        let level = c.level();
        let current = Arc::clone(c.input_version());

        add_boundary_inputs(&self.icmp, current.files(level), &mut c.inputs[0]);
        let (smallest, largest) = key_range(&self.icmp, &c.inputs[0]);

        c.inputs[1] =
            current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(&self.icmp, current.files(level + 1), &mut c.inputs[1]);

        let mut all_inputs: Vec<Arc<FileMetadata>> = c.inputs[0].clone();
        all_inputs.extend(c.inputs[1].iter().cloned());
        let (mut all_start, mut all_limit) = key_range(&self.icmp, &all_inputs);

        let mut largest = largest;
        if !c.inputs[1].is_empty() {
            let mut expanded0 =
                current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(&self.icmp, current.files(level), &mut expanded0);

            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < self.options.expanded_compaction_byte_size_limit()
            {
                let (new_start, new_limit) = key_range(&self.icmp, &expanded0);
                let mut expanded1 = current.get_overlapping_inputs(
                    level + 1,
                    Some(&new_start),
                    Some(&new_limit),
                );
                add_boundary_inputs(&self.icmp, current.files(level + 1), &mut expanded1);

                if expanded1.len() == c.inputs[1].len() {
                    tracing::debug!(
                        level,
                        from = c.inputs[0].len(),
                        to = expanded0.len(),
                        "expanding compaction inputs"
                    );
                    largest = new_limit;
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;

                    let mut all: Vec<Arc<FileMetadata>> = c.inputs[0].clone();
                    all.extend(c.inputs[1].iter().cloned());
                    let range = key_range(&self.icmp, &all);
                    all_start = range.0;
                    all_limit = range.1;
                }
            }
        }
        if level + 2 < NUM_LEVELS {
            c.grandparents =
                current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // The next size compaction at this level resumes past the keys
        // consumed here; persisted through the resulting edit so the
        // cursor survives restarts.
        self.compact_pointers.lock()[level] = largest.encode().to_vec();
        c.edit.set_compact_pointer(level, largest);
    }

    /// Merging iterator over all of a compaction's input files.
    pub fn make_input_iterator(&self, c: &Compaction) -> Result<MergingIterator> {
        let verify = self.options.paranoid_checks;
        // Compaction reads are one-shot; do not displace hot blocks.
        let fill_cache = false;

        let mut iters: Vec<Box<dyn InternalIterator>> = Vec::new();
        for which in 0..2 {
            if c.inputs(which).is_empty() {
                continue;
            }
            if c.level() + which == 0 {
                for file in c.inputs(which) {
                    iters.push(Box::new(self.table_cache.iter_table(
                        file.number(),
                        verify,
                        fill_cache,
                    )?));
                }
            } else {
                iters.push(Box::new(crate::version::LevelIterator::new(
                    self.icmp.clone(),
                    Arc::clone(&self.table_cache),
                    c.inputs(which).to_vec(),
                    verify,
                    fill_cache,
                )));
            }
        }
        Ok(MergingIterator::new(self.icmp.clone(), iters))
    }

    /// One line per level with file counts, for the `stats` property.
    pub fn level_summary(&self) -> String {
        let current = self.current();
        let counts: Vec<String> = (0..NUM_LEVELS)
            .map(|l| current.num_files(l).to_string())
            .collect();
        format!("files[ {} ]", counts.join(" "))
    }
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("next_file_number", &self.next_file_number_peek())
            .field("last_sequence", &self.last_sequence())
            .field("log_number", &self.log_number())
            .finish()
    }
}

/// Accumulates edits atop a base version and produces the next version.
struct VersionBuilder<'a> {
    vset: &'a VersionSet,
    base: Arc<Version>,
    deleted: HashSet<(usize, u64)>,
    added: [Vec<Arc<FileMetadata>>; NUM_LEVELS],
}

impl<'a> VersionBuilder<'a> {
    fn new(vset: &'a VersionSet, base: Arc<Version>) -> Self {
        Self {
            vset,
            base,
            deleted: HashSet::new(),
            added: Default::default(),
        }
    }

    fn apply(&mut self, edit: &VersionEdit) {
        // The compaction cursor moves with the edit stream.
        {
            let mut pointers = self.vset.compact_pointers.lock();
            for (level, key) in &edit.compact_pointers {
                pointers[*level] = key.encode().to_vec();
            }
        }

        for &(level, number) in &edit.deleted_files {
            self.deleted.insert((level, number));
        }

        for (level, entry) in &edit.new_files {
            self.deleted.remove(&(*level, entry.number));
            self.added[*level].push(entry.to_metadata());
        }
    }

    fn finish(self) -> Version {
        let icmp = self.vset.icmp.clone();
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();

        for level in 0..NUM_LEVELS {
            let mut merged: Vec<Arc<FileMetadata>> = self
                .base
                .files(level)
                .iter()
                .filter(|f| !self.deleted.contains(&(level, f.number())))
                .cloned()
                .collect();
            merged.extend(
                self.added[level]
                    .iter()
                    .filter(|f| !self.deleted.contains(&(level, f.number())))
                    .cloned(),
            );

            if level == 0 {
                // Newest file first.
                merged.sort_by(|a, b| b.number().cmp(&a.number()));
            } else {
                merged.sort_by(|a, b| {
                    icmp.compare(&a.smallest().encode(), &b.smallest().encode())
                });
                // Sorted levels must stay disjoint.
                debug_assert!(merged.windows(2).all(|w| {
                    icmp.compare(&w[0].largest().encode(), &w[1].smallest().encode())
                        == Ordering::Less
                }));
            }
            files[level] = merged;
        }

        let mut version = Version::with_files(
            icmp,
            Arc::clone(&self.vset.table_cache),
            Arc::clone(&self.vset.options),
            files,
        );
        finalize(&self.vset.options, &mut version);
        version
    }
}

/// Compute the size-compaction hint for a freshly built version.
fn finalize(options: &Options, version: &mut Version) {
    let mut best_level = 0;
    let mut best_score = -1.0f64;

    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            // Level 0 is scored by file count: with a small write buffer
            // many level-0 files are normal, and every level-0 file is
            // consulted by every read, so the count matters more than
            // the bytes.
            version.num_files(0) as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            version.level_bytes(level) as f64 / options.max_bytes_for_level(level)
        };

        if score > best_score {
            best_score = score;
            best_level = level;
        }
    }

    version.set_compaction_hint(best_score, best_level);
}
