//! The user-facing database iterator.
//!
//! Wraps a merging iterator over the memtables and the current version
//! and collapses the internal-key stream to user-level semantics: at each
//! position, all entries sharing a user key are reduced to the newest one
//! visible at the read sequence, and deletions hide what they shadow.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::compaction::MergingIterator;
use crate::iterator::InternalIterator;
use crate::memtable::MemTable;
use crate::options::READ_BYTES_PERIOD;
use crate::types::{parse_internal_key, LookupKey, ValueType};
use crate::util::comparator::InternalKeyComparator;
use crate::version::Version;
use crate::{Error, Result};

/// Callback into the runtime for iterator-driven read sampling.
pub(crate) trait ReadSampler: Send {
    fn record_read_sample(&self, internal_key: &[u8]);
}

/// References the iterator took at construction; dropping them releases
/// the memtables and version it reads from, however the iteration ends.
pub(crate) struct IterResources {
    pub mem: Arc<MemTable>,
    pub imm: Option<Arc<MemTable>>,
    pub version: Arc<Version>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// The inner iterator sits exactly at the entry backing `key()`.
    Forward,
    /// The inner iterator sits before the entries for `key()`, which is
    /// held in the saved key/value pair.
    Reverse,
}

/// Ordered cursor over the live user-visible contents of the database.
pub struct DbIterator {
    icmp: InternalKeyComparator,
    iter: MergingIterator,
    /// Entries above this sequence are invisible.
    sequence: u64,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    status: Option<Error>,
    sampler: Box<dyn ReadSampler>,
    rnd_state: u64,
    bytes_until_read_sampling: u64,
    /// Whether the std::iter::Iterator facade has positioned the cursor.
    started: bool,
    _resources: IterResources,
}

impl DbIterator {
    pub(crate) fn new(
        icmp: InternalKeyComparator,
        iter: MergingIterator,
        sequence: u64,
        sampler: Box<dyn ReadSampler>,
        seed: u64,
        resources: IterResources,
    ) -> Self {
        let mut rnd_state = seed | 1;
        let bytes_until_read_sampling = random_compaction_period(&mut rnd_state);
        Self {
            icmp,
            iter,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            status: None,
            sampler,
            rnd_state,
            bytes_until_read_sampling,
            started: false,
            _resources: resources,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current user key.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => {
                parse_internal_key(self.iter.key()).map(|(k, _, _)| k).unwrap_or(b"")
            }
            Direction::Reverse => &self.saved_key,
        }
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    pub fn status(&self) -> Result<()> {
        if let Some(e) = &self.status {
            return Err(e.clone());
        }
        self.iter.status()
    }

    pub fn seek_to_first(&mut self) {
        self.started = true;
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.started = true;
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Position at the first user key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.started = true;
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        self.saved_key.extend_from_slice(target);

        let lookup = LookupKey::new(target, self.sequence);
        self.iter.seek(lookup.internal_key());
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            // The inner iterator is before the entries for the current
            // key; step it back onto (or past) them.
            self.direction = Direction::Forward;
            if !self.iter.valid() {
                self.iter.seek_to_first();
            } else {
                self.iter.next();
            }
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key holds the current user key and must be skipped.
        } else {
            // Remember the user key being left behind so its older
            // entries are skipped.
            let current = match self.parse_key() {
                Some((user_key, _, _)) => user_key,
                None => {
                    self.valid = false;
                    self.saved_key.clear();
                    return;
                }
            };
            self.saved_key = current;

            self.iter.next();
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // The inner iterator sits at the newest visible entry of the
            // current key; back it up past every entry for that key.
            let current = match self.parse_key() {
                Some((user_key, _, _)) => user_key,
                None => {
                    self.valid = false;
                    self.saved_key.clear();
                    return;
                }
            };
            self.saved_key = current;

            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if let Ok((user_key, _, _)) = parse_internal_key(self.iter.key()) {
                    if self
                        .icmp
                        .user_comparator()
                        .compare(user_key, &self.saved_key)
                        == Ordering::Less
                    {
                        break;
                    }
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    /// Decode the inner iterator's key, feeding the read sampler.
    fn parse_key(&mut self) -> Option<(Vec<u8>, u64, ValueType)> {
        let bytes_read = (self.iter.key().len() + self.iter.value().len()) as u64;

        while self.bytes_until_read_sampling < bytes_read {
            self.bytes_until_read_sampling += random_compaction_period(&mut self.rnd_state);
            self.sampler.record_read_sample(self.iter.key());
        }
        self.bytes_until_read_sampling -= bytes_read;

        match parse_internal_key(self.iter.key()) {
            Ok((user_key, sequence, value_type)) => {
                Some((user_key.to_vec(), sequence, value_type))
            }
            Err(_) => {
                if self.status.is_none() {
                    self.status = Some(Error::corruption("invalid internal key in iterator"));
                }
                None
            }
        }
    }

    /// Advance to the newest visible, non-deleted entry of the next user
    /// key. With `skipping`, entries at or before `saved_key` are hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);

        loop {
            if let Some((user_key, sequence, value_type)) = self.parse_key() {
                if sequence <= self.sequence {
                    match value_type {
                        ValueType::Deletion => {
                            // Every older entry for this key is shadowed.
                            self.saved_key = user_key;
                            skipping = true;
                        }
                        ValueType::Value => {
                            let hidden = skipping
                                && self
                                    .icmp
                                    .user_comparator()
                                    .compare(&user_key, &self.saved_key)
                                    != Ordering::Greater;
                            if !hidden {
                                self.saved_key.clear();
                                self.valid = true;
                                return;
                            }
                        }
                    }
                }
            }

            self.iter.next();
            if !self.iter.valid() {
                break;
            }
        }

        self.saved_key.clear();
        self.valid = false;
    }

    /// Walk backward to the newest visible entry of the previous user
    /// key, saving it; on return the inner iterator sits before that
    /// key's entries.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        if self.iter.valid() {
            loop {
                if let Some((user_key, sequence, entry_type)) = self.parse_key() {
                    if sequence <= self.sequence {
                        if value_type != ValueType::Deletion
                            && self
                                .icmp
                                .user_comparator()
                                .compare(&user_key, &self.saved_key)
                                == Ordering::Less
                        {
                            // A live value for the following user key is
                            // already saved.
                            break;
                        }
                        value_type = entry_type;
                        if value_type == ValueType::Deletion {
                            self.saved_key.clear();
                            self.saved_value.clear();
                        } else {
                            self.saved_key = user_key;
                            self.saved_value.clear();
                            self.saved_value.extend_from_slice(self.iter.value());
                        }
                    }
                }

                self.iter.prev();
                if !self.iter.valid() {
                    break;
                }
            }
        }

        if value_type == ValueType::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

/// Jittered byte gap between read samples, averaging the configured
/// period.
fn random_compaction_period(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    (*state >> 16) % (2 * READ_BYTES_PERIOD)
}

impl Iterator for DbIterator {
    type Item = (Bytes, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.seek_to_first();
        } else if self.valid {
            DbIterator::next(self);
        }

        if self.valid {
            Some((
                Bytes::copy_from_slice(self.key()),
                Bytes::copy_from_slice(self.value()),
            ))
        } else {
            None
        }
    }
}
