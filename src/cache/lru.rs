//! Sharded LRU cache.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

const NUM_SHARDS: usize = 16;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// One shard: a hash map into an index-linked recency list.
struct Shard<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    nodes: Vec<Option<Node<K, V>>>,
    free_list: Vec<usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
}

impl<K: Hash + Eq + Clone, V: Clone> Shard<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            nodes: Vec::new(),
            free_list: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        self.nodes[idx].as_ref().map(|n| n.value.clone())
    }

    fn insert(&mut self, key: K, value: V) {
        if let Some(&idx) = self.map.get(&key) {
            if let Some(node) = self.nodes[idx].as_mut() {
                node.value = value;
            }
            self.move_to_front(idx);
            return;
        }

        while self.map.len() >= self.capacity {
            self.evict_lru();
        }

        let idx = match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                self.nodes.push(None);
                self.nodes.len() - 1
            }
        };
        self.nodes[idx] = Some(Node {
            key: key.clone(),
            value,
            prev: None,
            next: self.head,
        });

        if let Some(head_idx) = self.head {
            if let Some(head) = self.nodes[head_idx].as_mut() {
                head.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.map.insert(key, idx);
    }

    fn remove(&mut self, key: &K) {
        if let Some(idx) = self.map.remove(key) {
            self.unlink(idx);
            self.nodes[idx] = None;
            self.free_list.push(idx);
        }
    }

    fn evict_lru(&mut self) {
        if let Some(tail_idx) = self.tail {
            let key = self.nodes[tail_idx].as_ref().map(|n| n.key.clone());
            if let Some(key) = key {
                self.remove(&key);
            }
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.nodes[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = None;
            node.next = self.head;
        }
        if let Some(head_idx) = self.head {
            if let Some(head) = self.nodes[head_idx].as_mut() {
                head.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Concurrent LRU cache, sharded by key hash.
pub struct LruCache<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    /// Total capacity, split across shards.
    pub fn new(capacity: usize) -> Self {
        let per_shard = std::cmp::max(1, capacity / NUM_SHARDS);
        Self {
            shards: (0..NUM_SHARDS)
                .map(|_| Mutex::new(Shard::new(per_shard)))
                .collect(),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % NUM_SHARDS]
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.shard(key).lock().get(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.shard(&key).lock().insert(key, value);
    }

    pub fn remove(&self, key: &K) {
        self.shard(key).lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_insert() {
        let cache: LruCache<u64, String> = LruCache::new(100);
        assert!(cache.get(&1).is_none());

        cache.insert(1, "one".to_string());
        assert_eq!(cache.get(&1), Some("one".to_string()));

        cache.insert(1, "uno".to_string());
        assert_eq!(cache.get(&1), Some("uno".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove() {
        let cache: LruCache<u64, u64> = LruCache::new(100);
        cache.insert(1, 10);
        cache.remove(&1);
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_eviction_prefers_cold_entries() {
        // Single-shard-sized capacity to make eviction deterministic per
        // shard.
        let cache: LruCache<u64, u64> = LruCache::new(NUM_SHARDS * 2);

        // Fill well past capacity.
        for i in 0..1000u64 {
            cache.insert(i, i);
        }
        assert!(cache.len() <= NUM_SHARDS * 2);
    }

    #[test]
    fn test_recency() {
        let cache: LruCache<u64, u64> = LruCache::new(NUM_SHARDS);

        // All keys below hash into some shard with capacity 1; the last
        // inserted or touched entry per shard must be the survivor.
        cache.insert(7, 70);
        assert_eq!(cache.get(&7), Some(70));
    }

}
