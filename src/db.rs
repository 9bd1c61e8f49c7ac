//! The database runtime.
//!
//! One mutex protects the mutable runtime state (memtables, writer queue,
//! pending outputs, background flags); one condition variable signals the
//! completion of background work. Writers serialize through a FIFO queue
//! whose head acts as leader, grouping queued batches into a single log
//! append. A single background task at a time flushes the immutable
//! memtable or runs the compaction the version set picked.

use std::collections::{HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cache::{BlockCache, TableCache};
use crate::compaction::{CompactionOutput, CompactionState, CompactionStats};
use crate::iterator::db_iterator::{IterResources, ReadSampler};
use crate::iterator::{DbIterator, InternalIterator};
use crate::memtable::{LookupResult, MemTable};
use crate::options::{
    Options, ReadOptions, WriteOptions, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
    NUM_LEVELS,
};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::sstable::SSTableWriter;
use crate::types::{
    parse_internal_key, InternalKey, LookupKey, ValueType, WriteBatch, BATCH_HEADER_SIZE,
    MAX_SEQUENCE,
};
use crate::util::comparator::InternalKeyComparator;
use crate::util::filename::{
    current_file_path, delete_file, list_db_files, lock_file_path, log_file_path,
    manifest_file_path, set_current_file, table_file_path, FileType,
};
use crate::util::info_log::InfoLog;
use crate::version::{GetStats, Version, VersionEdit, VersionSet};
use crate::wal::{CorruptionReporter, LogReader, LogWriter};
use crate::{Error, Result};

/// A queued write: one caller's batch plus its completion signalling.
struct Writer {
    /// The batch to commit; `None` requests a memtable rotation only.
    batch: Mutex<Option<WriteBatch>>,
    sync: bool,
    /// Whether this writer was enqueued without a batch.
    force: bool,
    done: AtomicBool,
    status: Mutex<Option<Result<()>>>,
    /// Waits on the database mutex.
    cv: Condvar,
}

impl Writer {
    fn new(batch: Option<WriteBatch>, sync: bool) -> Self {
        let force = batch.is_none();
        Self {
            batch: Mutex::new(batch),
            sync,
            force,
            done: AtomicBool::new(false),
            status: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn batch_size(&self) -> usize {
        self.batch
            .lock()
            .as_ref()
            .map(|b| b.approximate_size())
            .unwrap_or(0)
    }

    fn take_batch(&self) -> Option<WriteBatch> {
        self.batch.lock().take()
    }

    fn complete(&self, status: Result<()>) {
        *self.status.lock() = Some(status);
        self.done.store(true, AtomicOrdering::Release);
    }

    fn take_status(&self) -> Result<()> {
        self.status
            .lock()
            .take()
            .expect("writer completed with a status")
    }
}

/// A requested manual compaction of one level over a key range.
struct ManualCompaction {
    level: usize,
    done: bool,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

/// State guarded by the database mutex.
struct DbState {
    mem: Arc<MemTable>,
    /// Memtable being flushed, if any.
    imm: Option<Arc<MemTable>>,
    wal: Option<LogWriter>,
    log_file_number: u64,
    writers: VecDeque<Arc<Writer>>,
    /// Output files of in-flight flushes/compactions, protected from the
    /// obsolete-file sweep until their edit lands.
    pending_outputs: HashSet<u64>,
    background_compaction_scheduled: bool,
    manual_compaction: Option<Arc<Mutex<ManualCompaction>>>,
    /// Once set, writes fail fast and no further background work runs.
    bg_error: Option<Error>,
    stats: [CompactionStats; NUM_LEVELS],
    iterator_seed: u64,
}

struct DbInner {
    path: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    versions: Arc<VersionSet>,
    snapshots: Arc<SnapshotList>,
    mutex: Mutex<DbState>,
    /// Broadcast whenever a background task finishes a unit of work.
    background_work_finished: Condvar,
    shutting_down: AtomicBool,
    /// Mirror of `state.imm.is_some()`, readable without the mutex by a
    /// running compaction.
    has_imm: AtomicBool,
    info_log: InfoLog,
}

/// An embedded ordered key-value store.
///
/// Clone-free handle; share it across threads behind an `Arc` if needed.
/// Dropping the handle waits for background work and closes the database,
/// releasing the directory lock.
pub struct Database {
    inner: Arc<DbInner>,
    _lock_file: File,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        Self::open_with_options(path, Options::default())
    }

    /// Open (or create) the database at `path`.
    pub fn open_with_options(path: impl AsRef<Path>, mut options: Options) -> Result<Database> {
        options.sanitize();
        let path = path.as_ref().to_path_buf();
        let options = Arc::new(options);
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));

        let _ = std::fs::create_dir_all(&path);
        let lock_file = acquire_lock(&path)?;
        let info_log = InfoLog::open(&path)?;

        let block_cache = if options.block_cache_size > 0 {
            Some(Arc::new(BlockCache::new(options.block_cache_size)))
        } else {
            None
        };
        let table_cache = Arc::new(TableCache::new(
            &path,
            icmp.clone(),
            options.table_cache_capacity(),
            block_cache,
        ));
        let versions = Arc::new(VersionSet::new(
            &path,
            Arc::clone(&options),
            icmp.clone(),
            Arc::clone(&table_cache),
        ));

        if !current_file_path(&path).exists() {
            if !options.create_if_missing {
                return Err(Error::invalid_argument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    path.display()
                )));
            }
            initialize_db(&path, &options)?;
        } else if options.error_if_exists {
            return Err(Error::invalid_argument(format!(
                "{}: exists (error_if_exists is true)",
                path.display()
            )));
        }

        let mem = Arc::new(MemTable::new(icmp.clone()));
        let inner = Arc::new(DbInner {
            path,
            options,
            icmp,
            table_cache,
            versions,
            snapshots: Arc::new(SnapshotList::new()),
            mutex: Mutex::new(DbState {
                mem,
                imm: None,
                wal: None,
                log_file_number: 0,
                writers: VecDeque::new(),
                pending_outputs: HashSet::new(),
                background_compaction_scheduled: false,
                manual_compaction: None,
                bg_error: None,
                stats: Default::default(),
                iterator_seed: 0,
            }),
            background_work_finished: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            info_log,
        });

        let (save_manifest, mut edit) = inner.recover()?;

        let log_file_number = {
            let mut state = inner.mutex.lock();
            if state.wal.is_none() {
                let log_number = inner.versions.new_file_number();
                let log = LogWriter::new(&log_file_path(&inner.path, log_number))?;
                state.wal = Some(log);
                state.log_file_number = log_number;
            }
            state.log_file_number
        };

        if save_manifest {
            edit.set_prev_log_number(0);
            edit.set_log_number(log_file_number);
            inner.versions.log_and_apply(&mut edit)?;
        }

        {
            let mut state = inner.mutex.lock();
            inner.remove_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
        }

        Ok(Database {
            inner,
            _lock_file: lock_file,
        })
    }

    /// Store `value` at `key`.
    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    /// Remove `key`.
    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    /// Commit a batch atomically.
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write_internal(options.sync, Some(batch))
    }

    /// Point lookup.
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Bytes>> {
        let inner = &self.inner;
        let state = inner.mutex.lock();
        let sequence = match &options.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => inner.versions.last_sequence(),
        };
        let mem = Arc::clone(&state.mem);
        let imm = state.imm.clone();
        let current = inner.versions.current();
        drop(state);

        let lkey = LookupKey::new(key, sequence);
        let mut stats: Option<GetStats> = None;

        let result = match mem.get(&lkey) {
            LookupResult::Found(value) => Some(value),
            LookupResult::Deleted => None,
            LookupResult::NotFound => match imm.as_ref().map(|imm| imm.get(&lkey)) {
                Some(LookupResult::Found(value)) => Some(value),
                Some(LookupResult::Deleted) => None,
                _ => {
                    let (found, get_stats) = current.get(options, &lkey)?;
                    stats = get_stats;
                    match found {
                        LookupResult::Found(value) => Some(value),
                        LookupResult::Deleted | LookupResult::NotFound => None,
                    }
                }
            },
        };

        if let Some(stats) = stats {
            let mut state = inner.mutex.lock();
            if current.update_stats(&stats) {
                inner.maybe_schedule_compaction(&mut state);
            }
        }
        Ok(result)
    }

    /// Ordered cursor over the database at the read point `options`
    /// select.
    pub fn iter(&self, options: &ReadOptions) -> Result<DbIterator> {
        let inner = &self.inner;
        let mut state = inner.mutex.lock();
        let sequence = match &options.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => inner.versions.last_sequence(),
        };

        let mem = Arc::clone(&state.mem);
        let imm = state.imm.clone();
        let current = inner.versions.current();
        state.iterator_seed += 1;
        let seed = state.iterator_seed;
        drop(state);

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        children.push(Box::new(mem.iter()));
        if let Some(imm) = &imm {
            children.push(Box::new(imm.iter()));
        }
        current.add_iterators(options, &mut children)?;

        let merging = crate::compaction::MergingIterator::new(inner.icmp.clone(), children);
        Ok(DbIterator::new(
            inner.icmp.clone(),
            merging,
            sequence,
            Box::new(DbSampler {
                inner: Arc::clone(inner),
            }),
            seed,
            IterResources {
                mem,
                imm,
                version: current,
            },
        ))
    }

    /// Pin the current state for repeatable reads. Released on drop.
    pub fn snapshot(&self) -> Snapshot {
        let _state = self.inner.mutex.lock();
        self.inner
            .snapshots
            .acquire(self.inner.versions.last_sequence())
    }

    /// Flush the active memtable and wait until it reaches level 0.
    pub fn flush(&self) -> Result<()> {
        // An empty write forces the rotation.
        self.inner.write_internal(false, None)?;

        let mut state = self.inner.mutex.lock();
        while state.imm.is_some() && state.bg_error.is_none() {
            self.inner.background_work_finished.wait(&mut state);
        }
        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Compact every level holding data in `[begin, end]`; `None` bounds
    /// are open. Blocks until the walk completes.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let mut max_level_with_files = 1;
        {
            let _state = self.inner.mutex.lock();
            let current = self.inner.versions.current();
            for level in 1..NUM_LEVELS {
                if current.overlap_in_level(level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }

        self.flush()?;
        for level in 0..max_level_with_files {
            self.inner.compact_range_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Introspection properties: `num-files-at-level<N>`, `stats`,
    /// `sstables`, `approximate-memory-usage`.
    pub fn property(&self, name: &str) -> Option<String> {
        if let Some(rest) = name.strip_prefix("num-files-at-level") {
            let level: usize = rest.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(self.inner.versions.num_level_files(level).to_string());
        }

        match name {
            "stats" => {
                let state = self.inner.mutex.lock();
                let current = self.inner.versions.current();
                let mut out = String::from(
                    "                               Compactions\n\
                     Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                for level in 0..NUM_LEVELS {
                    let files = current.num_files(level);
                    let stats = &state.stats[level];
                    if stats.micros > 0 || files > 0 {
                        out.push_str(&format!(
                            "{:>3} {:>8} {:>8.0} {:>9.3} {:>8.3} {:>9.3}\n",
                            level,
                            files,
                            current.level_bytes(level) as f64 / 1048576.0,
                            stats.micros as f64 / 1e6,
                            stats.bytes_read as f64 / 1048576.0,
                            stats.bytes_written as f64 / 1048576.0,
                        ));
                    }
                }
                out.push_str(&format!(
                    "open table handles: {}\n",
                    self.inner.table_cache.len()
                ));
                Some(out)
            }
            "sstables" => Some(self.inner.versions.current().describe()),
            "approximate-memory-usage" => {
                let state = self.inner.mutex.lock();
                let mut total = state.mem.approximate_memory_usage();
                if let Some(imm) = &state.imm {
                    total += imm.approximate_memory_usage();
                }
                Some(total.to_string())
            }
            _ => None,
        }
    }

    /// Approximate on-disk size of each `[start, limit)` range.
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let current = self.inner.versions.current();
        ranges
            .iter()
            .map(|(start, limit)| {
                let k1 = InternalKey::for_seek(Bytes::copy_from_slice(start), MAX_SEQUENCE);
                let k2 = InternalKey::for_seek(Bytes::copy_from_slice(limit), MAX_SEQUENCE);
                current
                    .approximate_offset_of(&k2)
                    .saturating_sub(current.approximate_offset_of(&k1))
            })
            .collect()
    }

    /// The database directory.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, AtomicOrdering::Release);

        let mut state = self.inner.mutex.lock();
        while state.background_compaction_scheduled {
            self.inner.background_work_finished.wait(&mut state);
        }
        // A clean close flushes buffered log bytes.
        if let Some(wal) = state.wal.as_mut() {
            let _ = wal.flush();
        }
    }
}

struct DbSampler {
    inner: Arc<DbInner>,
}

impl ReadSampler for DbSampler {
    fn record_read_sample(&self, internal_key: &[u8]) {
        let mut state = self.inner.mutex.lock();
        let current = self.inner.versions.current();
        if current.record_read_sample(internal_key) {
            self.inner.maybe_schedule_compaction(&mut state);
        }
    }
}

impl DbInner {
    // ======================== write path ========================

    fn write_internal(self: &Arc<Self>, sync: bool, batch: Option<WriteBatch>) -> Result<()> {
        let writer = Arc::new(Writer::new(batch, sync));

        let mut state = self.mutex.lock();
        state.writers.push_back(Arc::clone(&writer));
        while !writer.done.load(AtomicOrdering::Acquire)
            && !Arc::ptr_eq(state.writers.front().unwrap(), &writer)
        {
            writer.cv.wait(&mut state);
        }
        if writer.done.load(AtomicOrdering::Acquire) {
            return writer.take_status();
        }

        // This writer leads the queue.
        let mut status = self.make_room_for_write(&mut state, writer.force);
        let mut last_writer = Arc::clone(&writer);

        if status.is_ok() && !writer.force {
            let (mut group, last) = self.build_batch_group(&mut state, &writer);
            last_writer = last;

            let sequence_base = self.versions.last_sequence() + 1;
            group.set_sequence(sequence_base);
            let count = group.count() as u64;

            // The leader owns the log and the memtable for the duration
            // of the unlocked section: rotation only happens on this
            // thread, and concurrent readers go through their own
            // references.
            let mem = Arc::clone(&state.mem);
            let mut wal = state.wal.take().expect("log writer present");

            let mut sync_error = false;
            let unlocked_status = MutexGuard::unlocked(&mut state, || {
                let mut result = wal.add_record(group.contents());
                if result.is_ok() && sync {
                    result = wal.sync();
                    if result.is_err() {
                        sync_error = true;
                    }
                }
                if result.is_ok() {
                    result = group.insert_into(&mem);
                }
                result
            });
            state.wal = Some(wal);

            if sync_error {
                // The log tail state is unknown; fail every later write.
                if let Err(e) = &unlocked_status {
                    self.record_background_error(&mut state, e.clone());
                }
            }
            status = unlocked_status;

            self.versions.set_last_sequence(sequence_base + count - 1);
        }

        loop {
            let ready = state.writers.pop_front().expect("leader still queued");
            let is_self = Arc::ptr_eq(&ready, &writer);
            if !is_self {
                ready.complete(status.clone());
                ready.cv.notify_one();
            }
            if Arc::ptr_eq(&ready, &last_writer) {
                break;
            }
        }

        if let Some(front) = state.writers.front() {
            front.cv.notify_one();
        }

        status
    }

    /// Concatenate queued batches behind `leader` into one commit.
    ///
    /// Stops at the 1 MiB group budget (small leaders get a 128 KiB
    /// allowance instead, to keep small-write latency low), at a sync
    /// writer when the leader is non-sync, and at rotation requests.
    fn build_batch_group(
        &self,
        state: &mut DbState,
        leader: &Arc<Writer>,
    ) -> (WriteBatch, Arc<Writer>) {
        let mut result = leader.take_batch().expect("leader has a batch");
        let mut size = result.approximate_size();

        let mut max_size = 1 << 20;
        if size <= (128 << 10) {
            max_size = size + (128 << 10);
        }

        let mut last_writer = Arc::clone(leader);
        for candidate in state.writers.iter().skip(1) {
            if candidate.sync && !leader.sync {
                // A sync write must not ride a non-sync commit.
                break;
            }
            if candidate.force {
                break;
            }
            let candidate_size = candidate.batch_size();
            if size + candidate_size > max_size {
                break;
            }
            let batch = candidate.take_batch().expect("queued writer has a batch");
            result.append(&batch);
            size += candidate_size;
            last_writer = Arc::clone(candidate);
        }

        (result, last_writer)
    }

    /// Block until the memtable has room for the next write.
    fn make_room_for_write(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        force: bool,
    ) -> Result<()> {
        let mut force = force;
        let mut allow_delay = !force;

        loop {
            if let Some(e) = &state.bg_error {
                return Err(e.clone());
            }

            if allow_delay && self.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER {
                // Hand the CPU to the compactor for a moment instead of
                // stalling one write for seconds once level 0 fills up.
                MutexGuard::unlocked(state, || {
                    std::thread::sleep(Duration::from_millis(1));
                });
                allow_delay = false;
            } else if !force
                && state.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                break;
            } else if state.imm.is_some() {
                // The previous memtable is still being flushed.
                self.info_log
                    .log("Current memtable full; waiting on flush");
                self.background_work_finished.wait(state);
            } else if self.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                self.info_log.log("Too many L0 files; waiting");
                self.background_work_finished.wait(state);
            } else {
                // Roll to a fresh log and memtable.
                debug_assert_eq!(self.versions.prev_log_number(), 0);
                let new_log_number = self.versions.new_file_number();
                let log = match LogWriter::new(&log_file_path(&self.path, new_log_number)) {
                    Ok(log) => log,
                    Err(e) => {
                        // Keep the allocator dense for the next attempt.
                        self.versions.reuse_file_number(new_log_number);
                        return Err(e);
                    }
                };

                if let Some(mut old) = state.wal.take() {
                    let _ = old.flush();
                }
                state.wal = Some(log);
                state.log_file_number = new_log_number;

                let new_mem = Arc::new(MemTable::new(self.icmp.clone()));
                let old_mem = std::mem::replace(&mut state.mem, new_mem);
                state.imm = Some(old_mem);
                self.has_imm.store(true, AtomicOrdering::Release);
                force = false;
                self.maybe_schedule_compaction(state);
            }
        }
        Ok(())
    }

    fn record_background_error(&self, state: &mut DbState, error: Error) {
        if state.bg_error.is_none() {
            self.info_log
                .log(&format!("Background error: {}", error));
            state.bg_error = Some(error);
            self.background_work_finished.notify_all();
        }
    }

    // ======================== background work ========================

    fn maybe_schedule_compaction(self: &Arc<Self>, state: &mut DbState) {
        if state.background_compaction_scheduled {
            return;
        }
        if self.shutting_down.load(AtomicOrdering::Acquire) {
            return;
        }
        if state.bg_error.is_some() {
            return;
        }
        if state.imm.is_none()
            && state.manual_compaction.is_none()
            && !self.versions.needs_compaction()
        {
            return;
        }

        state.background_compaction_scheduled = true;
        let db = Arc::clone(self);
        std::thread::Builder::new()
            .name("stratumdb-bg".to_string())
            .spawn(move || db.background_call())
            .expect("spawn background worker");
    }

    fn background_call(self: Arc<Self>) {
        debug_assert!(self.mutex.lock().background_compaction_scheduled);

        if !self.shutting_down.load(AtomicOrdering::Acquire)
            && self.mutex.lock().bg_error.is_none()
        {
            self.background_compaction();
        }

        {
            let mut state = self.mutex.lock();
            state.background_compaction_scheduled = false;
            // The run may have left a level over budget; keep going.
            self.maybe_schedule_compaction(&mut state);
        }
        self.background_work_finished.notify_all();
    }

    fn background_compaction(self: &Arc<Self>) {
        if self.mutex.lock().imm.is_some() {
            self.compact_memtable();
            return;
        }

        let (compaction, manual_handle, manual_end) = {
            let state = self.mutex.lock();
            if let Some(handle) = state.manual_compaction.clone() {
                let m = handle.lock();
                let c = self
                    .versions
                    .compact_range(m.level, m.begin.as_ref(), m.end.as_ref());
                let end = c
                    .as_ref()
                    .map(|c| c.input(0, c.num_input_files(0) - 1).largest().clone());
                self.info_log.log(&format!(
                    "Manual compaction at level-{}; will stop at {:?}",
                    m.level,
                    end.as_ref().map(|k| String::from_utf8_lossy(k.user_key()).into_owned())
                ));
                drop(m);
                (c, Some(handle), end)
            } else {
                (self.versions.pick_compaction(), None, None)
            }
        };
        let is_manual = manual_handle.is_some();

        let status: Result<()> = match compaction {
            None => Ok(()),
            Some(mut c) if !is_manual && c.is_trivial_move() => {
                // Move the file up one level without rewriting it.
                debug_assert_eq!(c.num_input_files(0), 1);
                let file = Arc::clone(c.input(0, 0));
                c.edit.delete_file(c.level(), file.number());
                c.edit.add_file(
                    c.level() + 1,
                    file.number(),
                    file.file_size(),
                    file.smallest().clone(),
                    file.largest().clone(),
                );
                let mut edit = std::mem::take(&mut c.edit);
                let result = self.versions.log_and_apply(&mut edit);
                match &result {
                    Ok(()) => self.info_log.log(&format!(
                        "Moved #{} to level-{} ({} bytes): {}",
                        file.number(),
                        c.level() + 1,
                        file.file_size(),
                        self.versions.level_summary()
                    )),
                    Err(e) => {
                        let mut state = self.mutex.lock();
                        self.record_background_error(&mut state, e.clone());
                    }
                }
                result
            }
            Some(c) => {
                let smallest_snapshot = self
                    .snapshots
                    .oldest()
                    .unwrap_or_else(|| self.versions.last_sequence());
                let mut compact = CompactionState::new(c, smallest_snapshot);
                let result = self.do_compaction_work(&mut compact);
                self.cleanup_compaction(&mut compact);
                {
                    let mut state = self.mutex.lock();
                    self.remove_obsolete_files(&mut state);
                }
                result
            }
        };

        if let Err(e) = &status {
            if !self.shutting_down.load(AtomicOrdering::Acquire) {
                self.info_log.log(&format!("Compaction error: {}", e));
            }
        }

        if let Some(handle) = manual_handle {
            let mut m = handle.lock();
            if status.is_err() {
                m.done = true;
            }
            if !m.done {
                match manual_end {
                    // Nothing overlapped the remaining range.
                    None => m.done = true,
                    // Only part of the range was compacted; resume after
                    // the last key written.
                    Some(end) => m.begin = Some(end),
                }
            }
            drop(m);
            self.mutex.lock().manual_compaction = None;
        }
    }

    fn compact_memtable(self: &Arc<Self>) {
        if let Err(e) = self.compact_memtable_inner() {
            let mut state = self.mutex.lock();
            self.record_background_error(&mut state, e);
        }
    }

    fn compact_memtable_inner(self: &Arc<Self>) -> Result<()> {
        let (imm, base, log_number) = {
            let state = self.mutex.lock();
            match &state.imm {
                Some(imm) => (
                    Arc::clone(imm),
                    self.versions.current(),
                    state.log_file_number,
                ),
                None => return Ok(()),
            }
        };

        let mut edit = VersionEdit::new();
        self.write_level0_table(&imm, &mut edit, Some(&base))?;

        if self.shutting_down.load(AtomicOrdering::Acquire) {
            return Err(Error::io("deleting DB during memtable flush"));
        }

        // The flushed memtable's log is no longer needed for recovery.
        edit.set_prev_log_number(0);
        edit.set_log_number(log_number);
        self.versions.log_and_apply(&mut edit)?;

        let mut state = self.mutex.lock();
        state.imm = None;
        self.has_imm.store(false, AtomicOrdering::Release);
        self.remove_obsolete_files(&mut state);
        Ok(())
    }

    /// Build one table file from `mem` and record it in `edit`, placed at
    /// the deepest level its range allows.
    fn write_level0_table(
        &self,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Version>,
    ) -> Result<()> {
        let start = Instant::now();
        let file_number = {
            let mut state = self.mutex.lock();
            let number = self.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };
        self.info_log
            .log(&format!("Level-0 table #{}: started", file_number));

        let build_result: Result<Option<(u64, InternalKey, InternalKey)>> = (|| {
            let mut iter = mem.iter();
            iter.seek_to_first();
            if !iter.valid() {
                return Ok(None);
            }

            let path = table_file_path(&self.path, file_number);
            let mut writer = SSTableWriter::new(&path, &self.options, self.icmp.clone())?;
            while iter.valid() {
                writer.add(iter.key(), iter.value())?;
                iter.next();
            }
            let info = writer.finish()?;

            // The file must be usable before its edit is committed.
            self.table_cache.get_table(file_number)?;

            Ok(Some((
                info.file_size,
                info.smallest_key.expect("non-empty table"),
                info.largest_key.expect("non-empty table"),
            )))
        })();

        let mut state = self.mutex.lock();
        state.pending_outputs.remove(&file_number);

        match build_result {
            Ok(Some((file_size, smallest, largest))) => {
                let level = base
                    .map(|b| {
                        b.pick_level_for_memtable_output(smallest.user_key(), largest.user_key())
                    })
                    .unwrap_or(0);
                self.info_log.log(&format!(
                    "Level-0 table #{}: {} bytes, to level-{}",
                    file_number, file_size, level
                ));
                edit.add_file(level, file_number, file_size, smallest, largest);
                state.stats[level].add(&CompactionStats {
                    micros: start.elapsed().as_micros() as u64,
                    bytes_read: 0,
                    bytes_written: file_size,
                });
                Ok(())
            }
            Ok(None) => {
                // Empty memtable; the unused number is reclaimed by the
                // sweep.
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn do_compaction_work(self: &Arc<Self>, compact: &mut CompactionState) -> Result<()> {
        let start = Instant::now();
        let mut imm_micros = 0u64;

        self.info_log.log(&format!(
            "Compacting {}@{} + {}@{} files",
            compact.compaction.num_input_files(0),
            compact.compaction.level(),
            compact.compaction.num_input_files(1),
            compact.compaction.level() + 1,
        ));
        debug_assert!(compact.builder.is_none());
        debug_assert!(compact.outputs.is_empty());

        let mut input = self.versions.make_input_iterator(&compact.compaction)?;
        input.seek_to_first();

        let mut status: Result<()> = Ok(());
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = u64::MAX;

        while input.valid() {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                status = Err(Error::io("deleting DB during compaction"));
                break;
            }

            // Flushing the memtable outranks the compaction: writers are
            // waiting on it.
            if self.has_imm.load(AtomicOrdering::Acquire) {
                let imm_start = Instant::now();
                self.compact_memtable();
                self.background_work_finished.notify_all();
                imm_micros += imm_start.elapsed().as_micros() as u64;
            }

            let key = input.key().to_vec();

            if compact.compaction.should_stop_before(&key) && compact.builder.is_some() {
                status = self.finish_compaction_output_file(compact);
                if status.is_err() {
                    break;
                }
            }

            let mut drop_entry = false;
            match parse_internal_key(&key) {
                Err(_) => {
                    // Keep unparsable bytes and forget the key-tracking
                    // state so neighbors are not dropped because of them.
                    current_user_key = None;
                    last_sequence_for_key = u64::MAX;
                }
                Ok((user_key, sequence, value_type)) => {
                    let first_occurrence = match &current_user_key {
                        Some(tracked) => {
                            self.icmp.user_comparator().compare(user_key, tracked)
                                != std::cmp::Ordering::Equal
                        }
                        None => true,
                    };
                    if first_occurrence {
                        current_user_key = Some(user_key.to_vec());
                        last_sequence_for_key = u64::MAX;
                    }

                    if last_sequence_for_key <= compact.smallest_snapshot {
                        // A newer entry for this user key, itself at or
                        // below the snapshot floor, was already emitted;
                        // this one is invisible to every reader.
                        drop_entry = true;
                    } else if value_type == ValueType::Deletion
                        && sequence <= compact.smallest_snapshot
                        && compact.compaction.is_base_level_for_key(user_key)
                    {
                        // No snapshot can see this tombstone and no file
                        // below can hold the key it would shadow.
                        drop_entry = true;
                    }
                    last_sequence_for_key = sequence;
                }
            }

            if !drop_entry {
                if compact.builder.is_none() {
                    status = self.open_compaction_output_file(compact);
                    if status.is_err() {
                        break;
                    }
                }

                // Undecodable keys are carried through; the boundary
                // metadata pins to the nearest decodable neighbors.
                if let Ok(decoded) = InternalKey::decode(&key) {
                    if compact.current_output().smallest.is_none() {
                        compact.current_output().smallest = Some(decoded.clone());
                    }
                    compact.current_output().largest = Some(decoded);
                }
                status = compact.builder.as_mut().unwrap().add(&key, input.value());
                if status.is_err() {
                    break;
                }

                if compact.builder.as_ref().unwrap().file_size()
                    >= compact.compaction.max_output_file_size()
                {
                    status = self.finish_compaction_output_file(compact);
                    if status.is_err() {
                        break;
                    }
                }
            }

            input.next();
        }

        if status.is_ok() && self.shutting_down.load(AtomicOrdering::Acquire) {
            status = Err(Error::io("deleting DB during compaction"));
        }
        if status.is_ok() && compact.builder.is_some() {
            status = self.finish_compaction_output_file(compact);
        }
        if status.is_ok() {
            status = input.status();
        }
        drop(input);

        let mut stats = CompactionStats {
            micros: (start.elapsed().as_micros() as u64).saturating_sub(imm_micros),
            bytes_read: 0,
            bytes_written: 0,
        };
        for which in 0..2 {
            for file in compact.compaction.inputs(which) {
                stats.bytes_read += file.file_size();
            }
        }
        for output in &compact.outputs {
            stats.bytes_written += output.file_size;
        }
        {
            let mut state = self.mutex.lock();
            state.stats[compact.compaction.level() + 1].add(&stats);
        }

        if status.is_ok() {
            status = self.install_compaction_results(compact);
        }
        if let Err(e) = &status {
            let mut state = self.mutex.lock();
            self.record_background_error(&mut state, e.clone());
        } else {
            self.info_log.log(&format!(
                "Compacted to: {}",
                self.versions.level_summary()
            ));
        }
        status
    }

    fn open_compaction_output_file(&self, compact: &mut CompactionState) -> Result<()> {
        debug_assert!(compact.builder.is_none());

        let file_number = {
            let mut state = self.mutex.lock();
            let number = self.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };
        compact.outputs.push(CompactionOutput {
            number: file_number,
            file_size: 0,
            smallest: None,
            largest: None,
        });

        let path = table_file_path(&self.path, file_number);
        compact.builder = Some(SSTableWriter::new(&path, &self.options, self.icmp.clone())?);
        Ok(())
    }

    fn finish_compaction_output_file(&self, compact: &mut CompactionState) -> Result<()> {
        let builder = compact.builder.take().expect("output file is open");
        let entries = builder.entry_count();
        let info = builder.finish()?;

        let number = {
            let output = compact.current_output();
            output.file_size = info.file_size;
            output.number
        };
        compact.total_bytes += info.file_size;

        if entries > 0 {
            // Verify the file is readable before relying on it.
            self.table_cache.get_table(number)?;
            self.info_log.log(&format!(
                "Generated table #{}: {} keys, {} bytes",
                number, entries, info.file_size
            ));
        }
        Ok(())
    }

    fn install_compaction_results(&self, compact: &mut CompactionState) -> Result<()> {
        self.info_log.log(&format!(
            "Compacted {}@{} + {}@{} files => {} bytes",
            compact.compaction.num_input_files(0),
            compact.compaction.level(),
            compact.compaction.num_input_files(1),
            compact.compaction.level() + 1,
            compact.total_bytes,
        ));

        compact.compaction.add_input_deletions();
        let level = compact.compaction.level();
        for output in &compact.outputs {
            if let (Some(smallest), Some(largest)) = (&output.smallest, &output.largest) {
                compact.compaction.edit.add_file(
                    level + 1,
                    output.number,
                    output.file_size,
                    smallest.clone(),
                    largest.clone(),
                );
            }
        }

        let mut edit = std::mem::take(&mut compact.compaction.edit);
        self.versions.log_and_apply(&mut edit)
    }

    fn cleanup_compaction(&self, compact: &mut CompactionState) {
        let mut state = self.mutex.lock();
        if let Some(builder) = compact.builder.take() {
            // Abandon the partial output; its bytes are swept with the
            // file.
            drop(builder);
        }
        for output in &compact.outputs {
            state.pending_outputs.remove(&output.number);
        }
    }

    fn compact_range_level(
        self: &Arc<Self>,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        debug_assert!(level + 1 < NUM_LEVELS);

        let manual = Arc::new(Mutex::new(ManualCompaction {
            level,
            done: false,
            begin: begin
                .map(|b| InternalKey::for_seek(Bytes::copy_from_slice(b), MAX_SEQUENCE)),
            end: end.map(|e| InternalKey::new(Bytes::copy_from_slice(e), 0, ValueType::Deletion)),
        }));

        let mut state = self.mutex.lock();
        loop {
            if manual.lock().done {
                break;
            }
            if self.shutting_down.load(AtomicOrdering::Acquire) || state.bg_error.is_some() {
                break;
            }
            if state.manual_compaction.is_none() {
                state.manual_compaction = Some(Arc::clone(&manual));
                self.maybe_schedule_compaction(&mut state);
            } else {
                self.background_work_finished.wait(&mut state);
            }
        }

        // If our request is still installed (shutdown path), withdraw it.
        if let Some(installed) = &state.manual_compaction {
            if Arc::ptr_eq(installed, &manual) {
                state.manual_compaction = None;
            }
        }

        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    // ======================== maintenance ========================

    /// Delete files no live version, pending output, or recovery path
    /// needs. The deletions happen with the mutex released.
    fn remove_obsolete_files(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_error.is_some() {
            // After a background error it is unknown whether a pending
            // edit committed; deleting anything could lose data.
            return;
        }

        let mut live = self.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());

        let files = match list_db_files(&self.path) {
            Ok(files) => files,
            Err(_) => return,
        };

        let log_number = self.versions.log_number();
        let prev_log_number = self.versions.prev_log_number();
        let manifest_number = self.versions.manifest_file_number();

        let mut to_delete = Vec::new();
        for (name, file_type, number) in files {
            let keep = match file_type {
                FileType::Log => number >= log_number || number == prev_log_number,
                FileType::Manifest => number >= manifest_number,
                FileType::Table => live.contains(&number),
                // Temp files are outputs being produced right now.
                FileType::Temp => live.contains(&number),
                FileType::Current | FileType::Lock | FileType::InfoLog => true,
            };
            if !keep {
                to_delete.push((name, file_type, number));
            }
        }

        if to_delete.is_empty() {
            return;
        }

        MutexGuard::unlocked(state, || {
            for (name, file_type, number) in &to_delete {
                if *file_type == FileType::Table {
                    self.table_cache.evict(*number);
                }
                self.info_log
                    .log(&format!("Delete type={:?} #{}", file_type, number));
                let _ = delete_file(&self.path.join(name));
            }
        });
    }

    // ======================== recovery ========================

    /// Replay the manifest and any write-ahead logs newer than it.
    fn recover(self: &Arc<Self>) -> Result<(bool, VersionEdit)> {
        let mut save_manifest = self.versions.recover()?;
        let mut edit = VersionEdit::new();

        // Every file a live version names must exist; collect the logs
        // that still need replay on the way.
        let mut expected = self.versions.live_files();
        let min_log = self.versions.log_number();
        let prev_log = self.versions.prev_log_number();

        let mut log_numbers = Vec::new();
        for (_name, file_type, number) in list_db_files(&self.path)? {
            expected.remove(&number);
            if file_type == FileType::Log && (number >= min_log || number == prev_log) {
                log_numbers.push(number);
            }
        }
        if !expected.is_empty() {
            return Err(Error::corruption(format!(
                "{} missing table files, e.g. #{:06}",
                expected.len(),
                expected.iter().next().unwrap()
            )));
        }

        log_numbers.sort_unstable();
        let mut max_sequence = 0u64;
        for (i, number) in log_numbers.iter().enumerate() {
            let last_log = i + 1 == log_numbers.len();
            self.recover_log_file(
                *number,
                last_log,
                &mut save_manifest,
                &mut edit,
                &mut max_sequence,
            )?;
            // The log may hold numbers the manifest never saw.
            self.versions.mark_file_number_used(*number);
        }

        if max_sequence > self.versions.last_sequence() {
            self.versions.set_last_sequence(max_sequence);
        }
        Ok((save_manifest, edit))
    }

    fn recover_log_file(
        self: &Arc<Self>,
        log_number: u64,
        last_log: bool,
        save_manifest: &mut bool,
        edit: &mut VersionEdit,
        max_sequence: &mut u64,
    ) -> Result<()> {
        struct Reporter<'l> {
            paranoid: bool,
            status: Option<Error>,
            info_log: &'l InfoLog,
        }
        impl CorruptionReporter for Reporter<'_> {
            fn corruption(&mut self, bytes: u64, reason: &str) {
                self.info_log
                    .log(&format!("Log record dropped: {} bytes; {}", bytes, reason));
                if self.paranoid && self.status.is_none() {
                    self.status = Some(Error::corruption(format!(
                        "log record dropped: {} ({} bytes)",
                        reason, bytes
                    )));
                }
            }
        }

        let path = log_file_path(&self.path, log_number);
        self.info_log
            .log(&format!("Recovering log #{}", log_number));

        let mut mem: Option<Arc<MemTable>> = None;
        let mut compactions = 0;
        {
            let mut reporter = Reporter {
                paranoid: self.options.paranoid_checks,
                status: None,
                info_log: &self.info_log,
            };
            let mut reader = LogReader::new(&path, Some(&mut reporter))?;

            while let Some(record) = reader.read_record()? {
                if record.len() < BATCH_HEADER_SIZE {
                    self.info_log
                        .log(&format!("log record too small: {} bytes", record.len()));
                    continue;
                }
                let batch = match WriteBatch::from_contents(&record) {
                    Ok(batch) => batch,
                    Err(e) => {
                        if self.options.paranoid_checks {
                            return Err(e);
                        }
                        self.info_log
                            .log(&format!("Ignoring malformed log batch: {}", e));
                        continue;
                    }
                };

                let table = mem
                    .get_or_insert_with(|| Arc::new(MemTable::new(self.icmp.clone())));
                batch.insert_into(table)?;

                if batch.count() > 0 {
                    let last_seq = batch.sequence() + batch.count() as u64 - 1;
                    if last_seq > *max_sequence {
                        *max_sequence = last_seq;
                    }
                }

                if table.approximate_memory_usage() > self.options.write_buffer_size {
                    compactions += 1;
                    *save_manifest = true;
                    let full = Arc::clone(table);
                    self.write_level0_table(&full, edit, None)?;
                    mem = None;
                }
            }

            if let Some(e) = reporter.status {
                return Err(e);
            }
        }

        // With nothing flushed out of it, the tail log can be reused
        // directly and its memtable stays active.
        if self.options.reuse_logs && last_log && compactions == 0 {
            let mut state = self.mutex.lock();
            debug_assert!(state.wal.is_none());
            state.wal = Some(LogWriter::open_for_append(&path)?);
            state.log_file_number = log_number;
            if let Some(table) = mem.take() {
                state.mem = table;
            }
            self.info_log
                .log(&format!("Reusing old log #{}", log_number));
        }

        if let Some(table) = mem {
            if !table.is_empty() {
                *save_manifest = true;
                self.write_level0_table(&table, edit, None)?;
            }
        }
        Ok(())
    }
}

/// Take the exclusive process lock on the database directory.
fn acquire_lock(path: &Path) -> Result<File> {
    let lock_path = lock_file_path(path);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            return Err(Error::io(format!(
                "lock {}: held by another process",
                lock_path.display()
            )));
        }
    }

    Ok(file)
}

/// Write the manifest and CURRENT pointer of a brand-new database.
fn initialize_db(path: &Path, options: &Options) -> Result<()> {
    let mut edit = VersionEdit::new();
    edit.set_comparator(options.comparator.name());
    edit.set_log_number(0);
    edit.set_next_file_number(2);
    edit.set_last_sequence(0);

    let manifest_path = manifest_file_path(path, 1);
    let result = (|| -> Result<()> {
        let mut log = LogWriter::new(&manifest_path)?;
        log.add_record(&edit.encode())?;
        log.sync()?;
        set_current_file(path, 1)
    })();

    if result.is_err() {
        // Half-created databases are not left behind.
        let _ = delete_file(&manifest_path);
    }
    result
}

/// Delete every engine-owned file under `path`, then the directory if it
/// is empty.
pub fn destroy_db(path: impl AsRef<Path>, _options: Options) -> Result<()> {
    let path = path.as_ref();
    let files = match list_db_files(path) {
        Ok(files) => files,
        // Missing directory counts as destroyed.
        Err(_) => return Ok(()),
    };

    let lock = acquire_lock(path)?;
    let mut result = Ok(());
    for (name, file_type, _number) in files {
        if file_type == FileType::Lock {
            continue;
        }
        if let Err(e) = delete_file(&path.join(name)) {
            result = Err(e);
        }
    }
    drop(lock);
    let _ = delete_file(&lock_file_path(path));
    let _ = std::fs::remove_dir(path);
    result
}
