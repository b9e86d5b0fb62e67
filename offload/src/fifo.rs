// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Hash map that can give up its oldest entry.
//!
//! Insertion order is kept in a queue beside the map. Removing a key only
//! touches the map; its queue slot goes stale and is skipped or compacted
//! later, so every operation is amortized O(1).

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use ahash::RandomState;

#[derive(Debug)]
pub(crate) struct FifoMap<K, V> {
    entries: HashMap<K, (u64, V), RandomState>,
    /// Keys by insertion, tagged with the generation they were inserted with.
    order: VecDeque<(u64, K)>,
    generation: u64,
}

impl<K: Copy + Eq + Hash, V> FifoMap<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::with_hasher(RandomState::new()),
            order: VecDeque::new(),
            generation: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, v)| v)
    }

    pub(crate) fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|(_, v)| v)
    }

    fn is_live(&self, generation: u64, key: &K) -> bool {
        self.entries.get(key).is_some_and(|(g, _)| *g == generation)
    }

    /// Insert or replace. A replaced value keeps its place in the order.
    pub(crate) fn insert(&mut self, key: K, value: V) {
        if let Some((_, slot)) = self.entries.get_mut(&key) {
            *slot = value;
            return;
        }
        self.generation += 1;
        self.entries.insert(key, (self.generation, value));
        self.order.push_back((self.generation, key));
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.compact();
        }
        removed
    }

    /// Remove the entry inserted first.
    pub(crate) fn pop_oldest(&mut self) -> Option<(K, V)> {
        while let Some((generation, key)) = self.order.pop_front() {
            if self.is_live(generation, &key) {
                return self.entries.remove(&key).map(|(_, v)| (key, v));
            }
        }
        None
    }

    /// Keep the entries for which `keep` holds. Returns the removed keys,
    /// oldest first.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&K, &mut V) -> bool) -> Vec<K> {
        let mut removed = vec![];
        for &(generation, key) in &self.order {
            let Some((g, value)) = self.entries.get_mut(&key) else {
                continue;
            };
            if *g == generation && !keep(&key, value) {
                removed.push(key);
            }
        }
        for key in &removed {
            self.entries.remove(key);
        }
        self.compact();
        removed
    }

    fn compact(&mut self) {
        if self.order.len() > 2 * self.entries.len() + 64 {
            let entries = &self.entries;
            self.order
                .retain(|(generation, key)| entries.get(key).is_some_and(|(g, _)| g == generation));
        }
    }
}
