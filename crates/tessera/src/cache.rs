use std::{
    sync::{
        Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::AHashMap;

/// Hit/miss/size counters exposed by every cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

/// Simple map cache with a per-entry TTL.
///
/// Used by the filesystem loader for template source (default TTL five
/// minutes); a TTL of `None` never expires, which is what the embedded
/// loader wants. Concurrent readers share the read lock; expiry and inserts
/// take the write lock.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: RwLock<AHashMap<String, TtlEntry<V>>>,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug)]
struct TtlEntry<V> {
    value: V,
    inserted: Instant,
}

impl<V: Clone> TtlCache<V> {
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(AHashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = {
            let entries = self.entries.read().expect("cache lock poisoned");
            match entries.get(key) {
                Some(entry) => {
                    if self.ttl.is_none_or(|ttl| entry.inserted.elapsed() < ttl) {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(entry.value.clone());
                    }
                    true
                }
                None => false,
            }
        };
        if expired {
            self.entries.write().expect("cache lock poisoned").remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(
            key.into(),
            TtlEntry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// True when the key is present and fresh; does not touch the counters.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.read().expect("cache lock poisoned");
        entries
            .get(key)
            .is_some_and(|entry| self.ttl.is_none_or(|ttl| entry.inserted.elapsed() < ttl))
    }

    pub fn clear(&self) {
        self.entries.write().expect("cache lock poisoned").clear();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.read().expect("cache lock poisoned").len(),
        }
    }
}

/// LRU cache with a size bound and per-entry TTL.
///
/// The recency list is a doubly linked list threaded through a node arena by
/// index, so the hit path is O(1) with no pointer juggling. Holds parsed
/// templates behind `Arc`, which makes `get` a cheap clone.
#[derive(Debug)]
pub struct LruCache<V> {
    inner: Mutex<LruInner<V>>,
    capacity: usize,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug)]
struct LruInner<V> {
    map: AHashMap<String, usize>,
    nodes: Vec<LruNode<V>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

#[derive(Debug)]
struct LruNode<V> {
    key: String,
    value: V,
    inserted: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<V: Clone> LruCache<V> {
    /// `capacity` zero disables the size bound.
    #[must_use]
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: AHashMap::new(),
                nodes: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
            }),
            capacity,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let Some(&at) = inner.map.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if let Some(ttl) = self.ttl
            && inner.nodes[at].inserted.elapsed() >= ttl
        {
            inner.remove_index(at);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        inner.move_to_front(at);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(inner.nodes[at].value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(&at) = inner.map.get(&key) {
            inner.nodes[at].value = value;
            inner.nodes[at].inserted = Instant::now();
            inner.move_to_front(at);
            return;
        }
        let node = LruNode {
            key: key.clone(),
            value,
            inserted: Instant::now(),
            prev: None,
            next: None,
        };
        let at = if let Some(free) = inner.free.pop() {
            inner.nodes[free] = node;
            free
        } else {
            inner.nodes.push(node);
            inner.nodes.len() - 1
        };
        inner.map.insert(key, at);
        inner.attach_front(at);
        if self.capacity > 0 && inner.map.len() > self.capacity {
            if let Some(tail) = inner.tail {
                tracing::debug!(key = %inner.nodes[tail].key, "evicting least recently used template");
                inner.remove_index(tail);
            }
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .map
            .get(key)
            .is_some_and(|&at| self.ttl.is_none_or(|ttl| inner.nodes[at].inserted.elapsed() < ttl))
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.map.clear();
        inner.nodes.clear();
        inner.free.clear();
        inner.head = None;
        inner.tail = None;
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.inner.lock().expect("cache lock poisoned").map.len(),
        }
    }
}

impl<V> LruInner<V> {
    fn detach(&mut self, at: usize) {
        let (prev, next) = (self.nodes[at].prev, self.nodes[at].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[at].prev = None;
        self.nodes[at].next = None;
    }

    fn attach_front(&mut self, at: usize) {
        self.nodes[at].prev = None;
        self.nodes[at].next = self.head;
        if let Some(old_head) = self.head {
            self.nodes[old_head].prev = Some(at);
        }
        self.head = Some(at);
        if self.tail.is_none() {
            self.tail = Some(at);
        }
    }

    fn move_to_front(&mut self, at: usize) {
        if self.head == Some(at) {
            return;
        }
        self.detach(at);
        self.attach_front(at);
    }

    fn remove_index(&mut self, at: usize) {
        self.detach(at);
        let key = std::mem::take(&mut self.nodes[at].key);
        self.map.remove(&key);
        self.free.push(at);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ttl_cache_hit_and_miss_counters() {
        let cache: TtlCache<i32> = TtlCache::new(None);
        assert_eq!(cache.get("a"), None);
        cache.insert("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
    }

    #[test]
    fn ttl_cache_expires() {
        let cache: TtlCache<i32> = TtlCache::new(Some(Duration::ZERO));
        cache.insert("a", 1);
        assert_eq!(cache.get("a"), None);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache: LruCache<i32> = LruCache::new(2, None);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // touch `a` so `b` becomes the eviction candidate
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().size, 2);
    }

    #[test]
    fn lru_updates_existing_key() {
        let cache: LruCache<i32> = LruCache::new(2, None);
        cache.insert("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn lru_ttl_expiry_counts_as_miss() {
        let cache: LruCache<i32> = LruCache::new(0, Some(Duration::ZERO));
        cache.insert("a", 1);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn lru_slot_reuse_after_eviction() {
        let cache: LruCache<i32> = LruCache::new(1, None);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().size, 1);
        // the arena should not grow unboundedly: two slots at most
        let inner = cache.inner.lock().unwrap();
        assert!(inner.nodes.len() <= 2);
    }

    #[test]
    fn concurrent_access() {
        use std::sync::Arc;
        let cache: Arc<LruCache<i32>> = Arc::new(LruCache::new(64, None));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.insert(format!("k{}", (t * 100 + i) % 50), i);
                        let _ = cache.get(&format!("k{}", i % 50));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.stats().size <= 50);
    }
}
