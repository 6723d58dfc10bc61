//! # Priority-Evicting Object Cache
//!
//! A size-bounded cache whose eviction order is `(priority asc, access count
//! asc, age)`: cheap-to-lose, rarely used, oldest entries go first. Once
//! utilisation exceeds 90% the lowest quartile is evicted in one sweep.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

const EVICTION_UTILIZATION: f64 = 0.9;

/// Eviction class of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CachePriority {
    /// First to go.
    Low = 0,
    /// Default.
    Normal = 1,
    /// Kept as long as possible.
    High = 2,
}

struct CacheEntry<V> {
    value: V,
    size_mb: f64,
    priority: CachePriority,
    access_count: u64,
    created_at: Instant,
    seq: u64,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    used_mb: f64,
    next_seq: u64,
    evictions: u64,
    hits: u64,
    misses: u64,
}

/// Counters describing cache behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Live entries.
    pub entries: usize,
    /// Megabytes held.
    pub used_mb: f64,
    /// Configured capacity.
    pub capacity_mb: f64,
    /// Entries evicted since creation.
    pub evictions: u64,
    /// Successful lookups.
    pub hits: u64,
    /// Failed lookups.
    pub misses: u64,
}

/// # Object Cache
pub struct ObjectCache<V> {
    inner: Mutex<CacheInner<V>>,
    capacity_mb: f64,
    young_ttl: Duration,
}

impl<V: Clone> ObjectCache<V> {
    /// Create a cache of `capacity_mb`. Entries never read within `young_ttl`
    /// are eligible for young-generation collection.
    pub fn new(capacity_mb: f64, young_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                used_mb: 0.0,
                next_seq: 0,
                evictions: 0,
                hits: 0,
                misses: 0,
            }),
            capacity_mb,
            young_ttl,
        }
    }

    /// Insert or replace `key`. Returns `false` if the entry alone exceeds
    /// the capacity.
    pub fn put(&self, key: impl Into<String>, value: V, size_mb: f64, priority: CachePriority) -> bool {
        if size_mb > self.capacity_mb || size_mb < 0.0 {
            return false;
        }
        let key = key.into();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = inner.entries.remove(&key) {
            inner.used_mb -= old.size_mb;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.used_mb += size_mb;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                size_mb,
                priority,
                access_count: 0,
                created_at: Instant::now(),
                seq,
            },
        );
        if inner.used_mb / self.capacity_mb > EVICTION_UTILIZATION {
            Self::evict_quartile(&mut inner);
        }
        // A quartile sweep frees at least one entry; keep going until the
        // hard capacity holds.
        while inner.used_mb > self.capacity_mb && !inner.entries.is_empty() {
            Self::evict_quartile(&mut inner);
        }
        true
    }

    /// Look up `key`, counting the access.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let found = inner.entries.get_mut(key).map(|e| {
            e.access_count += 1;
            e.value.clone()
        });
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = inner.entries.remove(key)?;
        inner.used_mb -= entry.size_mb;
        Some(entry.value)
    }

    /// Used fraction of capacity in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if self.capacity_mb <= 0.0 {
            0.0
        } else {
            inner.used_mb / self.capacity_mb
        }
    }

    /// Evict the lowest quartile if utilisation is above 90%; returns the
    /// number of evicted entries.
    pub fn optimize(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if self.capacity_mb > 0.0 && inner.used_mb / self.capacity_mb > EVICTION_UTILIZATION {
            Self::evict_quartile(&mut inner)
        } else {
            0
        }
    }

    /// Evict the lowest quartile regardless of utilisation.
    pub fn force_evict_quartile(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Self::evict_quartile(&mut inner)
    }

    /// Drop entries never read and older than the young TTL.
    pub fn collect_unused(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.young_ttl;
        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.access_count == 0 && e.created_at.elapsed() >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(e) = inner.entries.remove(key) {
                inner.used_mb -= e.size_mb;
            }
        }
        inner.evictions += stale.len() as u64;
        stale.len()
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            entries: inner.entries.len(),
            used_mb: inner.used_mb,
            capacity_mb: self.capacity_mb,
            evictions: inner.evictions,
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    fn evict_quartile(inner: &mut CacheInner<V>) -> usize {
        if inner.entries.is_empty() {
            return 0;
        }
        let mut ranked: Vec<(CachePriority, u64, Instant, u64, String)> = inner
            .entries
            .iter()
            .map(|(k, e)| (e.priority, e.access_count, e.created_at, e.seq, k.clone()))
            .collect();
        ranked.sort();
        let count = inner.entries.len().div_ceil(4);
        for (_, _, _, _, key) in ranked.into_iter().take(count) {
            if let Some(e) = inner.entries.remove(&key) {
                inner.used_mb -= e.size_mb;
            }
        }
        if inner.entries.is_empty() {
            inner.used_mb = 0.0;
        }
        inner.evictions += count as u64;
        tracing::debug!(evicted = count, remaining = inner.entries.len(), "cache quartile evicted");
        count
    }
}
