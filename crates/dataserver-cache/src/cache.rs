use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub bins: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

/// An isolated keyed collection inside a [`Cache`].
#[derive(Debug)]
pub struct CacheBin<V = Value> {
    id: String,
    entries: DashMap<String, V>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> CacheBin<V> {
    fn new(id: String) -> Self {
        Self {
            id,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<V> {
        match self.entries.get(key) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v.value().clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns the previous value, if any.
    pub fn set(&self, key: impl Into<String>, value: V) -> Option<V> {
        self.entries.insert(key.into(), value)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Returns the cached value or computes, stores and returns it.
    pub fn get_or_insert_with<E>(
        &self,
        key: &str,
        compute: impl FnOnce() -> std::result::Result<V, E>,
    ) -> std::result::Result<V, E> {
        if let Some(v) = self.get(key) {
            return Ok(v);
        }
        let value = compute()?;
        self.entries.insert(key.to_string(), value.clone());
        Ok(value)
    }
}

/// Bin-scoped memoisation. No eviction policy or TTL: entries leave only
/// when a consumer deletes them or resets their bin.
#[derive(Debug)]
pub struct Cache<V = Value> {
    bins: DashMap<String, Arc<CacheBin<V>>>,
}

impl<V: Clone> Default for Cache<V> {
    fn default() -> Self {
        Self {
            bins: DashMap::new(),
        }
    }
}

impl<V: Clone> Cache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bin, creating it empty on first access.
    pub fn bin(&self, id: &str) -> Arc<CacheBin<V>> {
        if let Some(bin) = self.bins.get(id) {
            return bin.value().clone();
        }
        self.bins
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(CacheBin::new(id.to_string())))
            .value()
            .clone()
    }

    pub fn has_bin(&self, id: &str) -> bool {
        self.bins.contains_key(id)
    }

    /// Identifiers of every bin created so far.
    pub fn keys(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bins.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Empties one bin without touching the others.
    pub fn reset(&self, id: &str) {
        if let Some(bin) = self.bins.get(id) {
            bin.clear();
        }
    }

    pub fn reset_all(&self) {
        for bin in self.bins.iter() {
            bin.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            bins: self.bins.len(),
            ..CacheStats::default()
        };
        for bin in self.bins.iter() {
            stats.hits += bin.hits.load(Ordering::Relaxed);
            stats.misses += bin.misses.load(Ordering::Relaxed);
            stats.entries += bin.count();
        }
        stats
    }
}
