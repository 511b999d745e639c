//! Bounded LRU cache of decoded key pages.
//!
//! Entries are keyed by page offset and spread over a few shards, each
//! behind its own mutex. Every shard evicts its least recently used entry
//! once it holds its share of the capacity.
//!
//! The cache only ever holds pages as they were last read from the file.
//! Anything that writes a key page must call [`KeyPageCache::invalidate`]
//! for its offset, which [`KeyStore`](crate::store::KeyStore) does in all
//! of its writers.
//!
//! A capacity of zero disables the cache: lookups miss without counting
//! and inserts are dropped.

use crate::page::KeyPage;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bound on the number of shards.
const MAX_SHARDS: usize = 16;

#[derive(Debug)]
struct CachedPage {
    page: KeyPage,
    tick: u64,
}

/// One shard: pages by offset, plus their recency order.
#[derive(Debug)]
struct LruShard {
    capacity: usize,
    tick: u64,
    map: HashMap<u64, CachedPage>,
    /// Last-use tick to offset. The first entry is the eviction victim.
    order: BTreeMap<u64, u64>,
}

impl LruShard {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            map: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, offset: u64) -> Option<KeyPage> {
        let tick = self.next_tick();
        let entry = self.map.get_mut(&offset)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, offset);
        Some(entry.page.clone())
    }

    fn insert(&mut self, offset: u64, page: KeyPage) -> Option<u64> {
        let tick = self.next_tick();
        if let Some(old) = self.map.insert(offset, CachedPage { page, tick }) {
            self.order.remove(&old.tick);
            self.order.insert(tick, offset);
            return None;
        }
        self.order.insert(tick, offset);

        if self.map.len() > self.capacity {
            return self.pop_lru();
        }
        None
    }

    fn pop_lru(&mut self) -> Option<u64> {
        let (_, offset) = self.order.pop_first()?;
        self.map.remove(&offset);
        Some(offset)
    }

    fn remove(&mut self, offset: u64) {
        if let Some(entry) = self.map.remove(&offset) {
            self.order.remove(&entry.tick);
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Maximum number of cached pages.
    pub capacity: usize,
    /// Pages currently cached.
    pub len: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that went to the file.
    pub misses: u64,
    /// Pages dropped to make room.
    pub evictions: u64,
}

/// Sharded LRU cache of key pages.
///
/// # Thread Safety
///
/// Each shard has its own mutex, held only for the map update. Counters
/// are atomics.
#[derive(Debug)]
pub struct KeyPageCache {
    shards: Vec<Mutex<LruShard>>,
    page_size: u64,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl KeyPageCache {
    /// Creates a cache of at most `capacity` pages of `page_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is zero.
    #[must_use]
    pub fn new(capacity: usize, page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be non-zero");
        let shard_count = capacity.min(MAX_SHARDS);
        let shards = (0..shard_count)
            .map(|i| {
                // Spread the remainder over the first shards.
                let share = capacity / shard_count + usize::from(i < capacity % shard_count);
                Mutex::new(LruShard::new(share))
            })
            .collect();

        Self {
            shards,
            page_size: page_size as u64,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// A cache that holds nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0, 1)
    }

    /// Returns true if the cache can hold pages.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    fn shard(&self, offset: u64) -> Option<&Mutex<LruShard>> {
        if self.shards.is_empty() {
            return None;
        }
        let index = (offset / self.page_size) as usize % self.shards.len();
        Some(&self.shards[index])
    }

    /// Returns a copy of the page cached at `offset`, marking it most
    /// recently used.
    pub fn get(&self, offset: u64) -> Option<KeyPage> {
        let shard = self.shard(offset)?;
        let page = shard.lock().get(offset);
        let counter = if page.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        page
    }

    /// Caches `page` as the contents at `offset`.
    pub fn insert(&self, offset: u64, page: KeyPage) {
        let Some(shard) = self.shard(offset) else {
            return;
        };
        if shard.lock().insert(offset, page).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops any page cached at `offset`.
    pub fn invalidate(&self, offset: u64) {
        if let Some(shard) = self.shard(offset) {
            shard.lock().remove(offset);
        }
    }

    /// Drops every cached page.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    /// Maximum number of cached pages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pages currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().map.len()).sum()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.capacity,
            len: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for KeyPageCache {
    fn default() -> Self {
        Self::disabled()
    }
}
