//! Two-tier cache for extracted records.
//!
//! Reads check the memory tier, then the disk tier (promoting hits into
//! memory), then miss. Writes go to both tiers. Entries carry their own TTL
//! and are never returned once it has elapsed; any reader that finds an
//! expired entry removes it.
//!
//! Failures inside the cache are logged and otherwise ignored: a broken
//! cache directory degrades to memory-only behavior, never to a failed
//! operation.

mod disk;
mod error;
mod key;
mod memory;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

pub use error::CacheError;
pub use key::{CacheCategory, CacheKey, glob_regex};

use disk::{DiskEntry, DiskTier};
use memory::{MemoryEntry, MemoryTier};

use crate::worker::WorkerHandle;

pub const DEFAULT_MEMORY_CAPACITY: usize = 2_000;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Time-to-live per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub search: Duration,
    pub books: Duration,
    pub toc: Duration,
    pub chapters: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            search: CacheCategory::Search.default_ttl(),
            books: CacheCategory::Books.default_ttl(),
            toc: CacheCategory::Toc.default_ttl(),
            chapters: CacheCategory::Chapters.default_ttl(),
        }
    }
}

impl CacheTtls {
    #[must_use]
    pub fn for_category(&self, category: CacheCategory) -> Duration {
        match category {
            CacheCategory::Search => self.search,
            CacheCategory::Books => self.books,
            CacheCategory::Toc => self.toc,
            CacheCategory::Chapters => self.chapters,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// `false` turns the manager into a pass-through.
    pub enabled: bool,
    /// Root of the disk tier; memory-only when `None`.
    pub dir: Option<PathBuf>,
    pub memory_capacity: usize,
    pub sweep_interval: Duration,
    pub ttls: CacheTtls,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            ttls: CacheTtls::default(),
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub memory_entries: usize,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug)]
pub struct CacheManager {
    config: CacheConfig,
    memory: MemoryTier,
    disk: Option<DiskTier>,
    counters: Counters,
    sweeper: Mutex<Option<WorkerHandle>>,
}

impl CacheManager {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let disk = config.dir.clone().map(DiskTier::new);
        Self {
            memory: MemoryTier::new(config.memory_capacity),
            disk,
            counters: Counters::default(),
            sweeper: Mutex::new(None),
            config,
        }
    }

    /// A pass-through manager that never stores anything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        })
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn ttl(&self, category: CacheCategory) -> Duration {
        self.config.ttls.for_category(category)
    }

    /// Looks a key up in memory, then on disk.
    ///
    /// A stored value that no longer deserializes as `T` is dropped and
    /// reported as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let now = now_ms();

        if let Some(value) = self.memory.get(key.hash(), now) {
            if let Some(typed) = self.decode(key, &value).await {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                debug!(label = key.label(), tier = "memory", "cache hit");
                return Some(typed);
            }
        } else if let Some(entry) = self.read_disk(key, now).await {
            let value = Arc::new(entry.value);
            if let Some(typed) = self.decode(key, &value).await {
                self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                debug!(label = key.label(), tier = "disk", "cache hit");
                self.promote(key, value, entry.stored_at, entry.ttl_ms);
                return Some(typed);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores `value` under `key`, with the category TTL unless `ttl` is
    /// given.
    ///
    /// # Errors
    ///
    /// [`CacheError`] when the value cannot be serialized or the disk tier
    /// cannot be written. The memory tier is updated either way once the
    /// value serializes.
    #[instrument(skip(self, value), fields(label = key.label()))]
    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Option<Duration>) -> Result<(), CacheError> {
        if !self.config.enabled {
            return Ok(());
        }
        let value = serde_json::to_value(value).map_err(|err| CacheError::serialize(key.label(), err))?;
        let ttl_ms = duration_ms(ttl.unwrap_or_else(|| self.ttl(key.category())));
        let stored_at = now_ms();

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let value = Arc::new(value);
        self.promote(key, Arc::clone(&value), stored_at, ttl_ms);

        if let Some(disk) = &self.disk {
            let entry = DiskEntry {
                key: key.hash().to_string(),
                label: key.label().to_string(),
                stored_at,
                ttl_ms,
                value: Value::clone(&value),
            };
            disk.write(key.category(), &entry).await?;
        }
        Ok(())
    }

    /// Removes every entry whose label matches the `*` glob `pattern`, in
    /// both tiers. Returns the number of distinct entries removed.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let Some(glob) = glob_regex(pattern) else {
            warn!(pattern, "invalid invalidation pattern");
            return 0;
        };
        let mut removed: HashSet<String> = self.memory.remove_matching(&glob).into_iter().collect();

        if let Some(disk) = &self.disk {
            for category in CacheCategory::ALL {
                let scanned = match disk.scan(category).await {
                    Ok(scanned) => scanned,
                    Err(err) => {
                        warn!(error = %err, "cache scan failed");
                        continue;
                    }
                };
                for file in scanned {
                    let matches = file.entry.as_ref().is_some_and(|entry| glob.is_match(&entry.label));
                    if matches && remove_logged(&file.path).await {
                        removed.insert(file.hash);
                    }
                }
            }
        }
        info!(pattern, removed = removed.len(), "cache invalidated");
        removed.len()
    }

    /// Removes expired entries from both tiers, and unreadable files from
    /// disk. Returns the number of distinct entries removed.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let mut removed: HashSet<String> = self.memory.sweep(now).into_iter().collect();

        if let Some(disk) = &self.disk {
            for category in CacheCategory::ALL {
                let scanned = match disk.scan(category).await {
                    Ok(scanned) => scanned,
                    Err(err) => {
                        warn!(error = %err, "cache scan failed");
                        continue;
                    }
                };
                for file in scanned {
                    let dead = file
                        .entry
                        .as_ref()
                        .is_none_or(|entry| memory::is_expired(entry.stored_at, entry.ttl_ms, now));
                    if dead && remove_logged(&file.path).await {
                        removed.insert(file.hash);
                    }
                }
            }
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), "expired cache entries swept");
        }
        removed.len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.config.enabled,
            memory_entries: self.memory.len(),
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Entries of one category currently held in memory.
    #[must_use]
    pub fn memory_entries(&self, category: CacheCategory) -> usize {
        self.memory.count_category(category)
    }

    /// Starts the periodic expiry sweep. A second call is a no-op; a
    /// disabled manager never starts one.
    pub fn start_sweeper(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *slot = Some(WorkerHandle::spawn("cache-sweeper", self.config.sweep_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(cache) = weak.upgrade() else {
                    return false;
                };
                cache.sweep_expired().await;
                true
            }
        }));
    }

    /// Stops the sweep worker, if running.
    pub async fn shutdown(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    fn promote(&self, key: &CacheKey, value: Arc<Value>, stored_at: u64, ttl_ms: u64) {
        let entry = MemoryEntry {
            category: key.category(),
            label: key.label().to_string(),
            value,
            stored_at,
            ttl_ms,
        };
        let evicted = self.memory.insert(key.hash().to_string(), entry);
        if evicted > 0 {
            self.counters
                .evictions
                .fetch_add(u64::try_from(evicted).unwrap_or(u64::MAX), Ordering::Relaxed);
            debug!(evicted, "memory tier over capacity");
        }
    }

    /// Live disk entry for `key`; expired or corrupt files are deleted.
    async fn read_disk(&self, key: &CacheKey, now: u64) -> Option<DiskEntry> {
        let disk = self.disk.as_ref()?;
        match disk.read(key.category(), key.hash()).await {
            Ok(Some(entry)) if !memory::is_expired(entry.stored_at, entry.ttl_ms, now) => Some(entry),
            Ok(Some(_)) => {
                let _ = disk.remove(key.category(), key.hash()).await;
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(label = key.label(), error = %err, "dropping unreadable cache entry");
                let _ = disk.remove(key.category(), key.hash()).await;
                None
            }
        }
    }

    async fn decode<T: DeserializeOwned>(&self, key: &CacheKey, value: &Value) -> Option<T> {
        match T::deserialize(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                warn!(label = key.label(), error = %err, "cached value has an unexpected shape");
                self.memory.remove(key.hash());
                if let Some(disk) = &self.disk {
                    let _ = disk.remove(key.category(), key.hash()).await;
                }
                None
            }
        }
    }
}

async fn remove_logged(path: &std::path::Path) -> bool {
    match disk::remove_file(path).await {
        Ok(removed) => removed,
        Err(err) => {
            warn!(error = %err, "cache file could not be removed");
            false
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, duration_ms)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::ChapterInfo;

    fn manager(dir: Option<PathBuf>, capacity: usize) -> CacheManager {
        CacheManager::new(CacheConfig {
            dir,
            memory_capacity: capacity,
            ..CacheConfig::default()
        })
    }

    #[tokio::test]
    async fn test_hit_within_ttl_and_miss_after() {
        let cache = manager(None, 10);
        let key = CacheKey::toc("s", "https://s.example/1/");
        let toc = vec![ChapterInfo::new("第1章", "https://s.example/1/1.html", 1)];

        cache.set(&key, &toc, None).await.unwrap();
        assert_eq!(cache.get::<Vec<ChapterInfo>>(&key).await, Some(toc.clone()));

        cache.set(&key, &toc, Some(Duration::ZERO)).await.unwrap();
        assert_eq!(cache.get::<Vec<ChapterInfo>>(&key).await, None);

        let stats = cache.stats();
        assert_eq!((stats.memory_hits, stats.misses, stats.writes), (1, 1, 2));
        assert_eq!(stats.memory_entries, 0);
    }

    #[tokio::test]
    async fn test_disk_hit_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::chapter("s", "https://s.example/1/1.html");
        {
            let writer = manager(Some(dir.path().to_path_buf()), 10);
            writer.set(&key, &"text".to_string(), None).await.unwrap();
        }
        assert!(dir.path().join("chapters").join(format!("{}.json", key.hash())).exists());

        let reader = manager(Some(dir.path().to_path_buf()), 10);
        assert_eq!(reader.get::<String>(&key).await.as_deref(), Some("text"));
        assert_eq!(reader.get::<String>(&key).await.as_deref(), Some("text"));
        let stats = reader.stats();
        assert_eq!((stats.disk_hits, stats.memory_hits), (1, 1));
    }

    #[tokio::test]
    async fn test_wrong_shape_is_a_miss() {
        let cache = manager(None, 10);
        let key = CacheKey::book("s", "u");
        cache.set(&key, &"not a number", None).await.unwrap();
        assert_eq!(cache.get::<u32>(&key).await, None);
        assert_eq!(cache.stats().memory_entries, 0);
    }

    #[tokio::test]
    async fn test_invalidate_glob_across_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(Some(dir.path().to_path_buf()), 10);
        for url in ["a", "b"] {
            cache.set(&CacheKey::toc("biquge", url), &1, None).await.unwrap();
        }
        cache.set(&CacheKey::toc("other", "a"), &1, None).await.unwrap();

        assert_eq!(cache.invalidate("toc:biquge:*").await, 2);
        assert_eq!(cache.get::<u32>(&CacheKey::toc("biquge", "a")).await, None);
        assert_eq!(cache.get::<u32>(&CacheKey::toc("other", "a")).await, Some(1));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_from_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(Some(dir.path().to_path_buf()), 10);
        cache.set(&CacheKey::search("s", "dead"), &1, Some(Duration::ZERO)).await.unwrap();
        cache.set(&CacheKey::search("s", "live"), &1, None).await.unwrap();

        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.memory_entries(CacheCategory::Search), 1);
        assert_eq!(std::fs::read_dir(dir.path().join("search")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_eviction_counts() {
        let cache = manager(None, 2);
        for i in 0..3 {
            cache.set(&CacheKey::chapter("s", &i.to_string()), &i, None).await.unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.memory_entries, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_disabled_is_pass_through() {
        let cache = CacheManager::disabled();
        let key = CacheKey::book("s", "u");
        cache.set(&key, &1, None).await.unwrap();
        assert_eq!(cache.get::<u32>(&key).await, None);
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
