//! Bounded keyed backlog with latest-value-wins overflow
//!
//! Entries keep arrival order. When a key already holds `max_per_key`
//! pending entries, or the backlog is at capacity, the oldest pending entry
//! of the *same* key is evicted to make room. Only when the incoming key has
//! nothing pending and the backlog is full does the globally oldest entry go.
//! A fresher value for a key is therefore never delivered before a staler one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;

/// What happened to make room for a pushed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Room was available
    Queued,
    /// The oldest pending entry for the same key was evicted
    ReplacedSameKey,
    /// The globally oldest entry (another key) was evicted
    EvictedOldest,
}

#[derive(Debug)]
pub struct KeyedBacklog<K, V> {
    capacity: usize,
    max_per_key: usize,
    next_seq: u64,
    entries: BTreeMap<u64, (K, V)>,
    by_key: HashMap<K, VecDeque<u64>>,
    evicted: u64,
}

impl<K, V> KeyedBacklog<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Both limits are clamped to at least 1
    pub fn new(capacity: usize, max_per_key: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            max_per_key: max_per_key.clamp(1, capacity),
            next_seq: 0,
            entries: BTreeMap::new(),
            by_key: HashMap::new(),
            evicted: 0,
        }
    }

    pub fn push(&mut self, key: K, value: V) -> PushOutcome {
        let pending_for_key = self.by_key.get(&key).map_or(0, VecDeque::len);

        let outcome = if pending_for_key >= self.max_per_key
            || (self.entries.len() >= self.capacity && pending_for_key > 0)
        {
            self.evict_oldest_for(&key);
            PushOutcome::ReplacedSameKey
        } else if self.entries.len() >= self.capacity {
            self.evict_oldest();
            PushOutcome::EvictedOldest
        } else {
            PushOutcome::Queued
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_key.entry(key.clone()).or_default().push_back(seq);
        self.entries.insert(seq, (key, value));

        outcome
    }

    /// Take every pending entry in arrival order
    pub fn drain(&mut self) -> Vec<V> {
        self.by_key.clear();
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|(_, value)| value)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries evicted since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    fn evict_oldest_for(&mut self, key: &K) {
        let Some(seqs) = self.by_key.get_mut(key) else {
            return;
        };
        if let Some(seq) = seqs.pop_front() {
            self.entries.remove(&seq);
            self.evicted += 1;
        }
        if seqs.is_empty() {
            self.by_key.remove(key);
        }
    }

    fn evict_oldest(&mut self) {
        let Some((_, (key, _))) = self.entries.pop_first() else {
            return;
        };
        self.evicted += 1;

        // The globally oldest entry is also the oldest of its key
        if let Some(seqs) = self.by_key.get_mut(&key) {
            seqs.pop_front();
            if seqs.is_empty() {
                self.by_key.remove(&key);
            }
        }
    }
}
