//! K-way merge over internal iterators.

use std::cmp::Ordering;

use crate::iterator::InternalIterator;
use crate::util::comparator::InternalKeyComparator;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges N sorted children into one sorted stream, in both directions.
///
/// Children positioned at equal keys are won by the lower index, so
/// callers order their sources newest first.
pub struct MergingIterator {
    icmp: InternalKeyComparator,
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    pub fn new(icmp: InternalKeyComparator, children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            icmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if child.valid() {
                smallest = match smallest {
                    None => Some(i),
                    Some(s) => {
                        if self.icmp.compare(child.key(), self.children[s].key())
                            == Ordering::Less
                        {
                            Some(i)
                        } else {
                            Some(s)
                        }
                    }
                };
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if child.valid() {
                largest = match largest {
                    None => Some(i),
                    Some(l) => {
                        if self.icmp.compare(child.key(), self.children[l].key())
                            == Ordering::Greater
                        {
                            Some(i)
                        } else {
                            Some(l)
                        }
                    }
                };
            }
        }
        self.current = largest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        let current = self.current.unwrap();

        // After reverse iteration, every non-current child sits before
        // the current key; bring them all to the first entry after it.
        if self.direction != Direction::Forward {
            let key = self.key().to_vec();
            let icmp = self.icmp.clone();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && icmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let current = self.current.unwrap();

        // Mirror of next(): position every non-current child at the last
        // entry before the current key.
        if self.direction != Direction::Reverse {
            let key = self.key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    child.prev();
                } else {
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("iterator is valid")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("iterator is valid")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::MemTable;
    use crate::types::{parse_internal_key, ValueType};
    use crate::util::comparator::BytewiseComparator;
    use std::sync::Arc;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator::new()))
    }

    fn memtable_with(entries: &[(&str, u64, &str)]) -> Arc<MemTable> {
        let mem = Arc::new(MemTable::new(icmp()));
        for (key, seq, value) in entries {
            mem.add(*seq, ValueType::Value, key.as_bytes(), value.as_bytes());
        }
        mem
    }

    fn collect_user_keys(iter: &mut MergingIterator) -> Vec<(Vec<u8>, u64)> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            let (user_key, seq, _) = parse_internal_key(iter.key()).unwrap();
            out.push((user_key.to_vec(), seq));
            iter.next();
        }
        out
    }

    #[test]
    fn test_merge_two_sources() {
        let a = memtable_with(&[("a", 1, "1"), ("c", 3, "3"), ("e", 5, "5")]);
        let b = memtable_with(&[("b", 2, "2"), ("d", 4, "4")]);

        let mut iter = MergingIterator::new(icmp(), vec![Box::new(a.iter()), Box::new(b.iter())]);
        let keys = collect_user_keys(&mut iter);
        let users: Vec<Vec<u8>> = keys.into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            users,
            vec![
                b"a".to_vec(),
                b"b".to_vec(),
                b"c".to_vec(),
                b"d".to_vec(),
                b"e".to_vec()
            ]
        );
    }

    #[test]
    fn test_merge_orders_same_user_key_by_sequence() {
        let newer = memtable_with(&[("k", 9, "new")]);
        let older = memtable_with(&[("k", 2, "old")]);

        let mut iter =
            MergingIterator::new(icmp(), vec![Box::new(newer.iter()), Box::new(older.iter())]);
        let keys = collect_user_keys(&mut iter);
        assert_eq!(keys, vec![(b"k".to_vec(), 9), (b"k".to_vec(), 2)]);
    }

    #[test]
    fn test_merge_empty_children() {
        let empty = memtable_with(&[]);
        let other = memtable_with(&[("x", 1, "v")]);

        let mut iter =
            MergingIterator::new(icmp(), vec![Box::new(empty.iter()), Box::new(other.iter())]);
        iter.seek_to_first();
        assert!(iter.valid());
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_merge_backward() {
        let a = memtable_with(&[("a", 1, "1"), ("c", 3, "3")]);
        let b = memtable_with(&[("b", 2, "2")]);

        let mut iter = MergingIterator::new(icmp(), vec![Box::new(a.iter()), Box::new(b.iter())]);
        iter.seek_to_last();

        let mut users = Vec::new();
        while iter.valid() {
            let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
            users.push(user_key.to_vec());
            iter.prev();
        }
        assert_eq!(users, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_direction_reversal_mid_stream() {
        let a = memtable_with(&[("a", 1, "1"), ("c", 3, "3"), ("e", 5, "5")]);
        let b = memtable_with(&[("b", 2, "2"), ("d", 4, "4")]);

        let mut iter = MergingIterator::new(icmp(), vec![Box::new(a.iter()), Box::new(b.iter())]);
        iter.seek_to_first();
        iter.next();
        iter.next();
        let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(user_key, b"c");

        iter.prev();
        let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(user_key, b"b");

        iter.next();
        let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(user_key, b"c");
    }

    #[test]
    fn test_seek() {
        let a = memtable_with(&[("a", 1, "1"), ("e", 5, "5")]);
        let b = memtable_with(&[("c", 3, "3")]);

        let mut iter = MergingIterator::new(icmp(), vec![Box::new(a.iter()), Box::new(b.iter())]);
        iter.seek(crate::types::LookupKey::new(b"b", u64::MAX >> 8).internal_key());
        assert!(iter.valid());
        let (user_key, _, _) = parse_internal_key(iter.key()).unwrap();
        assert_eq!(user_key, b"c");
    }
}
