use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Hit/miss counters of an [`LruCache`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub max_entries: usize,
}

/// Small thread-safe LRU map
///
/// Entries carry the value of a monotonically increasing access counter;
/// when full, the entry with the oldest access is dropped.
#[derive(Debug)]
pub struct LruCache<K, V> {
    max_entries: usize,
    entries: Mutex<HashMap<K, (V, u64)>>,
    access_counter: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(max_entries: usize) -> LruCache<K, V> {
        LruCache {
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::with_capacity(max_entries.min(1024))),
            access_counter: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some((value, access)) => {
                *access = self.access_counter.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, access))| *access)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                entries.remove(&k);
            }
        }
        let access = self.access_counter.fetch_add(1, Ordering::Relaxed);
        entries.insert(key, (value, access));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            max_entries: self.max_entries,
        }
    }
}
