// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An LRU store with strict recency ordering and O(1) eviction
//!
//! Features
//! - string keys, opaque values
//! - recency tracked by a preallocated doubly linked list, no per-node allocation churn
//! - capacity 0 disables eviction, the caller decides when to remove entries
//!
//! This store is not safe for concurrent mutation. Callers are expected to wrap it
//! behind exclusive access.

pub mod linked_list;

use linked_list::{Index, LinkedList};

use hashbrown::HashMap;

struct LruNode<T> {
    data: T,
    list_index: Index,
}

/// A fixed-capacity mapping from string keys to values with strict recency ordering.
pub struct LruCache<T> {
    lookup_table: HashMap<String, LruNode<T>>,
    order: LinkedList,
    max_entries: usize, // 0 means unbounded
}

impl<T> LruCache<T> {
    /// Create an [LruCache] evicting beyond `max_entries` entries.
    ///
    /// If `max_entries` is zero the cache has no limit and it is assumed
    /// that eviction is done by the caller.
    pub fn new(max_entries: usize) -> Self {
        let capacity = if max_entries == 0 { 16 } else { max_entries };
        LruCache {
            lookup_table: HashMap::with_capacity(capacity),
            order: LinkedList::with_capacity(capacity),
            max_entries,
        }
    }

    /// Insert or update the value for the key and promote it to most recently used.
    ///
    /// Return the evicted entry if the insert pushed the cache over capacity.
    pub fn add(&mut self, key: &str, value: T) -> Option<(String, T)> {
        if let Some(node) = self.lookup_table.get_mut(key) {
            node.data = value;
            let index = node.list_index;
            self.order.promote(index);
            return None;
        }
        let list_index = self.order.push_head(key.to_string());
        self.lookup_table
            .insert(key.to_string(), LruNode { data: value, list_index });
        if self.max_entries != 0 && self.lookup_table.len() > self.max_entries {
            self.remove_oldest()
        } else {
            None
        }
    }

    /// Look up the value for the key, promoting it on hit.
    pub fn get(&mut self, key: &str) -> Option<&T> {
        let node = self.lookup_table.get(key)?;
        let index = node.list_index;
        self.order.promote(index);
        self.lookup_table.get(key).map(|n| &n.data)
    }

    /// Look up the value for the key without disturbing the recency order.
    pub fn peek(&self, key: &str) -> Option<&T> {
        self.lookup_table.get(key).map(|n| &n.data)
    }

    /// Remove the entry for the key, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        let node = self.lookup_table.remove(key)?;
        self.order.remove(node.list_index);
        Some(node.data)
    }

    /// Remove and return the least recently used entry.
    pub fn remove_oldest(&mut self) -> Option<(String, T)> {
        let key = self.order.pop_tail()?;
        // the list and the table are updated together, the entry must exist
        let node = self.lookup_table.remove(&key)?;
        Some((key, node.data))
    }

    /// The number of entries in the cache.
    pub fn len(&self) -> usize {
        self.lookup_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup_table.is_empty()
    }

    /// Purge all stored entries.
    pub fn clear(&mut self) {
        self.lookup_table.clear();
        self.order.clear();
    }

    /// Visit every entry, most recently used first.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &T),
    {
        for key in self.order.iter() {
            if let Some(node) = self.lookup_table.get(key) {
                f(key, &node.data);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_get() {
        let mut lru = LruCache::new(10);
        assert!(lru.get("a").is_none());
        lru.add("a", 1);
        assert_eq!(lru.get("a"), Some(&1));
        assert_eq!(lru.len(), 1);
        // update in place
        lru.add("a", 2);
        assert_eq!(lru.get("a"), Some(&2));
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn test_eviction_order() {
        let mut lru = LruCache::new(2);
        lru.add("a", 1);
        lru.add("b", 2);
        // touching a makes b the oldest
        lru.get("a");
        let evicted = lru.add("c", 3);
        assert_eq!(evicted, Some(("b".to_string(), 2)));
        assert!(lru.get("b").is_none());
        assert_eq!(lru.get("a"), Some(&1));
        assert_eq!(lru.get("c"), Some(&3));
    }

    #[test]
    fn test_remove_oldest() {
        let mut lru = LruCache::new(0);
        lru.add("a", 1);
        lru.add("b", 2);
        lru.add("c", 3);
        lru.get("a");
        assert_eq!(lru.remove_oldest(), Some(("b".to_string(), 2)));
        assert_eq!(lru.remove_oldest(), Some(("c".to_string(), 3)));
        assert_eq!(lru.remove_oldest(), Some(("a".to_string(), 1)));
        assert_eq!(lru.remove_oldest(), None);
    }

    #[test]
    fn test_unbounded() {
        let mut lru = LruCache::new(0);
        for i in 0..1000 {
            lru.add(&format!("key-{i}"), i);
        }
        assert_eq!(lru.len(), 1000);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut lru = LruCache::new(2);
        lru.add("a", 1);
        lru.add("b", 2);
        assert_eq!(lru.remove("a"), Some(1));
        assert!(lru.remove("a").is_none());
        assert_eq!(lru.len(), 1);
        lru.clear();
        assert_eq!(lru.len(), 0);
        assert!(lru.get("b").is_none());
    }

    #[test]
    fn test_for_each_order() {
        let mut lru = LruCache::new(0);
        lru.add("a", 1);
        lru.add("b", 2);
        lru.add("c", 3);
        lru.get("b");
        let mut seen = vec![];
        lru.for_each(|k, v| seen.push((k.to_string(), *v)));
        assert_eq!(
            seen,
            vec![
                ("b".to_string(), 2),
                ("c".to_string(), 3),
                ("a".to_string(), 1)
            ]
        );
    }
}
