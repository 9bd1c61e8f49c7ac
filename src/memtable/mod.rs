//! In-memory sorted table of recent writes.
//!
//! Backed by a lock-free skip list so readers traverse without taking the
//! database mutex; the single writer inserts while readers are active, and
//! the list's publication ordering guarantees a reader that observes a
//! link also observes the fully built entry. The table is `Arc`-shared and
//! torn down when the last reference drops.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam_skiplist::SkipMap;

use crate::iterator::InternalIterator;
use crate::types::{pack_sequence_and_type, parse_internal_key, LookupKey, ValueType};
use crate::util::coding::put_fixed64;
use crate::util::comparator::InternalKeyComparator;
use crate::Result;

/// Outcome of a point lookup against one layer of the read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// A live value.
    Found(Bytes),
    /// A tombstone newer than any value; the lookup is resolved as absent.
    Deleted,
    /// This layer holds nothing for the key; continue to the next layer.
    NotFound,
}

impl LookupResult {
    pub fn is_found(&self) -> bool {
        matches!(self, LookupResult::Found(_))
    }
}

/// Skip-list key: an encoded internal key ordered by the internal-key
/// comparator rather than raw bytes.
struct MemKey {
    comparator: InternalKeyComparator,
    key: Bytes,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator.compare(&self.key, &other.key)
    }
}

/// The active or immutable in-memory table.
pub struct MemTable {
    comparator: InternalKeyComparator,
    table: SkipMap<MemKey, Bytes>,
    approximate_usage: AtomicUsize,
}

impl MemTable {
    pub fn new(comparator: InternalKeyComparator) -> Self {
        Self {
            comparator,
            table: SkipMap::new(),
            approximate_usage: AtomicUsize::new(0),
        }
    }

    fn mem_key(&self, internal_key: &[u8]) -> MemKey {
        MemKey {
            comparator: self.comparator.clone(),
            key: Bytes::copy_from_slice(internal_key),
        }
    }

    /// Insert an entry. Never fails; memory grows with the table.
    ///
    /// The caller guarantees no two entries share a (user key, sequence)
    /// pair, so the insert is always a fresh node.
    pub fn add(&self, sequence: u64, value_type: ValueType, user_key: &[u8], value: &[u8]) {
        let mut encoded = BytesMut::with_capacity(user_key.len() + 8);
        encoded.extend_from_slice(user_key);
        put_fixed64(&mut encoded, pack_sequence_and_type(sequence, value_type));

        let entry_size = encoded.len() + value.len() + 32;
        self.approximate_usage
            .fetch_add(entry_size, AtomicOrdering::Relaxed);

        let key = MemKey {
            comparator: self.comparator.clone(),
            key: encoded.freeze(),
        };
        self.table.insert(key, Bytes::copy_from_slice(value));
    }

    /// Resolve `key` against this table.
    pub fn get(&self, key: &LookupKey) -> LookupResult {
        let probe = self.mem_key(key.internal_key());

        // The first entry at or after (user_key, seek tag) is the newest
        // entry for the user key with sequence <= the read point.
        if let Some(entry) = self.table.lower_bound(Bound::Included(&probe)) {
            let encoded = &entry.key().key;
            if let Ok((user_key, _seq, value_type)) = parse_internal_key(encoded) {
                if self
                    .comparator
                    .user_comparator()
                    .compare(user_key, key.user_key())
                    == Ordering::Equal
                {
                    return match value_type {
                        ValueType::Value => LookupResult::Found(entry.value().clone()),
                        ValueType::Deletion => LookupResult::Deleted,
                    };
                }
            }
        }
        LookupResult::NotFound
    }

    /// Bytes held by the table, including per-node overhead estimates.
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_usage.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// An iterator holding its own reference to the table.
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            mem: Arc::clone(self),
            current: None,
        }
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("entries", &self.table.len())
            .field("approximate_usage", &self.approximate_memory_usage())
            .finish()
    }
}

/// Cursor over a memtable.
///
/// The cursor re-seeks the skip list from its current position on every
/// step, which keeps it free of borrows into the table and therefore
/// usable long after the runtime has moved on to a new memtable.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    current: Option<(Bytes, Bytes)>,
}

fn capture(entry: Option<crossbeam_skiplist::map::Entry<'_, MemKey, Bytes>>) -> Option<(Bytes, Bytes)> {
    entry.map(|e| (e.key().key.clone(), e.value().clone()))
}

impl InternalIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        let found = capture(self.mem.table.front());
        self.current = found;
    }

    fn seek_to_last(&mut self) {
        let found = capture(self.mem.table.back());
        self.current = found;
    }

    fn seek(&mut self, target: &[u8]) {
        let probe = self.mem.mem_key(target);
        let found = capture(self.mem.table.lower_bound(Bound::Included(&probe)));
        self.current = found;
    }

    fn next(&mut self) {
        if let Some((key, _)) = self.current.take() {
            let probe = MemKey {
                comparator: self.mem.comparator.clone(),
                key,
            };
            let found = capture(self.mem.table.lower_bound(Bound::Excluded(&probe)));
            self.current = found;
        }
    }

    fn prev(&mut self) {
        if let Some((key, _)) = self.current.take() {
            let probe = MemKey {
                comparator: self.mem.comparator.clone(),
                key,
            };
            let found = capture(self.mem.table.upper_bound(Bound::Excluded(&probe)));
            self.current = found;
        }
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator is valid").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator is valid").1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;

    fn new_memtable() -> Arc<MemTable> {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator::new()));
        Arc::new(MemTable::new(icmp))
    }

    #[test]
    fn test_add_get() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"hello", b"world");

        assert_eq!(
            mem.get(&LookupKey::new(b"hello", 1)),
            LookupResult::Found(Bytes::from("world"))
        );
        // A later read point still sees the write.
        assert_eq!(
            mem.get(&LookupKey::new(b"hello", 100)),
            LookupResult::Found(Bytes::from("world"))
        );
        // A read point before the write does not.
        assert_eq!(mem.get(&LookupKey::new(b"hello", 0)), LookupResult::NotFound);
    }

    #[test]
    fn test_get_deletion() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"key", b"v1");
        mem.add(2, ValueType::Deletion, b"key", b"");

        assert_eq!(
            mem.get(&LookupKey::new(b"key", 1)),
            LookupResult::Found(Bytes::from("v1"))
        );
        assert_eq!(mem.get(&LookupKey::new(b"key", 2)), LookupResult::Deleted);
        assert_eq!(mem.get(&LookupKey::new(b"key", 50)), LookupResult::Deleted);
    }

    #[test]
    fn test_get_picks_newest_visible_version() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"key", b"v1");
        mem.add(5, ValueType::Value, b"key", b"v5");
        mem.add(10, ValueType::Value, b"key", b"v10");

        for (read_seq, expect) in [(1, "v1"), (3, "v1"), (5, "v5"), (9, "v5"), (10, "v10")] {
            assert_eq!(
                mem.get(&LookupKey::new(b"key", read_seq)),
                LookupResult::Found(Bytes::from(expect)),
                "read at {}",
                read_seq
            );
        }
    }

    #[test]
    fn test_get_other_key_not_found() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"aaa", b"1");
        mem.add(2, ValueType::Value, b"ccc", b"3");

        assert_eq!(mem.get(&LookupKey::new(b"bbb", 10)), LookupResult::NotFound);
    }

    #[test]
    fn test_iterator_order() {
        let mem = new_memtable();
        for (i, key) in [b"d", b"a", b"c", b"b"].iter().enumerate() {
            mem.add(i as u64 + 1, ValueType::Value, *key, b"v");
        }

        let mut iter = mem.iter();
        iter.seek_to_first();

        let mut seen = Vec::new();
        while iter.valid() {
            let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
            seen.push(user_key.to_vec());
            iter.next();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_iterator_same_key_newest_first() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"k", b"old");
        mem.add(9, ValueType::Value, b"k", b"new");

        let mut iter = mem.iter();
        iter.seek_to_first();
        assert!(iter.valid());
        let (_, seq, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(seq, 9);

        iter.next();
        let (_, seq, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_iterator_seek_and_prev() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"a", b"1");
        mem.add(2, ValueType::Value, b"c", b"2");
        mem.add(3, ValueType::Value, b"e", b"3");

        let mut iter = mem.iter();
        iter.seek(LookupKey::new(b"b", u64::MAX >> 8).internal_key());
        assert!(iter.valid());
        let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(user_key, b"c");

        iter.prev();
        assert!(iter.valid());
        let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(user_key, b"a");

        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_memory_accounting() {
        let mem = new_memtable();
        assert_eq!(mem.approximate_memory_usage(), 0);

        mem.add(1, ValueType::Value, b"hello", b"world");
        let after_one = mem.approximate_memory_usage();
        assert!(after_one > 0);

        mem.add(2, ValueType::Value, b"hello2", b"world2");
        assert!(mem.approximate_memory_usage() > after_one);
    }

    #[test]
    fn test_iterator_outlives_reads() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"a", b"1");

        let mut iter = mem.iter();
        // Writer keeps inserting while the iterator holds its reference.
        mem.add(2, ValueType::Value, b"b", b"2");

        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 2);
    }
}
