//! Bounded in-memory tier.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;

use super::key::CacheCategory;

/// Share of entries dropped when the tier grows past its capacity.
const EVICT_FRACTION: usize = 10;

#[derive(Debug, Clone)]
pub(crate) struct MemoryEntry {
    pub category: CacheCategory,
    pub label: String,
    pub value: Arc<Value>,
    /// Unix milliseconds.
    pub stored_at: u64,
    pub ttl_ms: u64,
}

impl MemoryEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        is_expired(self.stored_at, self.ttl_ms, now)
    }
}

/// An entry is dead once `now - stored_at >= ttl`.
pub(crate) fn is_expired(stored_at: u64, ttl_ms: u64, now: u64) -> bool {
    now.saturating_sub(stored_at) >= ttl_ms
}

#[derive(Debug)]
pub(crate) struct MemoryTier {
    entries: DashMap<String, MemoryEntry>,
    capacity: usize,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Live value for `hash`; an expired entry is removed on the way.
    pub fn get(&self, hash: &str, now: u64) -> Option<Arc<Value>> {
        let found = self.entries.get(hash).map(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(Arc::clone(&entry.value))
            }
        })?;
        if found.is_none() {
            self.entries.remove(hash);
        }
        found
    }

    /// Stores an entry and returns how many old entries were evicted.
    pub fn insert(&self, hash: String, entry: MemoryEntry) -> usize {
        self.entries.insert(hash, entry);
        if self.entries.len() <= self.capacity {
            return 0;
        }
        self.evict_oldest()
    }

    pub fn remove(&self, hash: &str) -> bool {
        self.entries.remove(hash).is_some()
    }

    /// Drops the oldest tenth (at least one) by store time.
    fn evict_oldest(&self) -> usize {
        let mut ages: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.stored_at, entry.key().clone()))
            .collect();
        ages.sort_unstable();
        let count = (ages.len() / EVICT_FRACTION).max(1);
        ages.into_iter()
            .take(count)
            .filter(|(_, hash)| self.entries.remove(hash).is_some())
            .count()
    }

    /// Removes entries whose label matches, returning their hashes.
    pub fn remove_matching(&self, pattern: &Regex) -> Vec<String> {
        let hashes: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| pattern.is_match(&entry.label))
            .map(|entry| entry.key().clone())
            .collect();
        hashes
            .into_iter()
            .filter(|hash| self.entries.remove(hash).is_some())
            .collect()
    }

    /// Removes expired entries, returning their hashes.
    pub fn sweep(&self, now: u64) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|hash, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed.push(hash.clone());
            }
            keep
        });
        removed
    }

    pub fn count_category(&self, category: CacheCategory) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.category == category)
            .count()
    }
}
