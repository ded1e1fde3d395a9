//! Bounded key/value cache with LRU eviction and per-entry expiry.
//!
//! [`BoundedCache`] keeps at most `max_entries` values and at most
//! `max_bytes` of estimated payload. When either bound is exceeded the
//! least-recently-accessed entries are evicted. Each entry has a freshness
//! deadline (`expires_at`); past it the entry is still returned, flagged
//! stale, until the retention window also runs out. Expiry is checked lazily
//! on [`get`](BoundedCache::get) and proactively by
//! [`sweep_expired`](BoundedCache::sweep_expired), which
//! [`spawn_sweeper`] runs on an interval.
//!
//! All mutation is serialized by one mutex per cache instance; no lock is
//! ever held across an `.await`.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::models::IndexEntry;

/// Estimated resident size of a cached value.
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl Weighted for IndexEntry {
    fn weight(&self) -> usize {
        self.approx_bytes()
    }
}

impl<T: Weighted> Weighted for Vec<T> {
    fn weight(&self) -> usize {
        std::mem::size_of::<Self>() + self.iter().map(Weighted::weight).sum::<usize>()
    }
}

impl<T: Weighted> Weighted for Arc<T> {
    fn weight(&self) -> usize {
        self.as_ref().weight()
    }
}

/// Capacity and retention bounds for one cache instance.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
    /// How long an expired entry is kept as a last-known-good fallback.
    pub stale_retention: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 32 * 1024 * 1024,
            stale_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A stored value plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
    pub etag: Option<String>,
    pub last_accessed: Instant,
    /// When the value was last stored or revalidated.
    pub validated_at: Instant,
    weight: usize,
}

/// Result of a cache read.
#[derive(Debug, Clone)]
pub struct Lookup<V> {
    pub value: V,
    /// `true` if the entry is inside its freshness window.
    pub hit: bool,
    pub etag: Option<String>,
    /// Time since the value was stored or last revalidated.
    pub age: Duration,
}

impl<V> Lookup<V> {
    pub fn stale(&self) -> bool {
        !self.hit
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub bytes: usize,
}

struct Inner<K: Hash + Eq, V> {
    map: LruCache<K, CacheEntry<V>>,
    bytes: usize,
    stats: CacheStats,
}

pub struct BoundedCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    limits: CacheLimits,
    clock: Arc<dyn Clock>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Weighted,
{
    pub fn new(limits: CacheLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                bytes: 0,
                stats: CacheStats::default(),
            }),
            limits,
            clock,
        }
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    /// Read an entry, promoting it in the recency order.
    ///
    /// Fresh entries come back with `hit = true`. Expired entries still inside
    /// the retention window come back with `hit = false`; past retention they
    /// are dropped and the read is a miss.
    pub fn get(&self, key: &K) -> Option<Lookup<V>> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.map.get_mut(key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => {
                if !past_retention(entry, now, self.limits.stale_retention) {
                    entry.last_accessed = now;
                    let hit = now < entry.expires_at;
                    if hit {
                        inner.stats.hits += 1;
                    } else {
                        inner.stats.stale_hits += 1;
                    }
                    return Some(Lookup {
                        value: entry.value.clone(),
                        hit,
                        etag: entry.etag.clone(),
                        age: now.saturating_duration_since(entry.validated_at),
                    });
                }
            }
        }

        if let Some(old) = inner.map.pop(key) {
            inner.bytes = inner.bytes.saturating_sub(old.weight);
        }
        inner.stats.expirations += 1;
        inner.stats.misses += 1;
        None
    }

    /// Read an entry without touching recency, statistics, or expiry.
    pub fn peek(&self, key: &K) -> Option<(V, Option<String>)> {
        let inner = self.inner.lock();
        inner
            .map
            .peek(key)
            .map(|entry| (entry.value.clone(), entry.etag.clone()))
    }

    /// Store a value fresh for `ttl`. Returns `false` if the value alone
    /// exceeds the byte budget and was not cached.
    pub fn set(&self, key: K, value: V, ttl: Duration) -> bool {
        self.set_with_etag(key, value, ttl, None)
    }

    pub fn set_with_etag(&self, key: K, value: V, ttl: Duration, etag: Option<String>) -> bool {
        let weight = value.weight();
        if weight > self.limits.max_bytes {
            tracing::debug!(weight, max_bytes = self.limits.max_bytes, "value exceeds cache byte budget, not cached");
            return false;
        }

        let now = self.clock.now();
        let entry = CacheEntry {
            value,
            expires_at: deadline(now, ttl),
            etag,
            last_accessed: now,
            validated_at: now,
            weight,
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(old) = inner.map.put(key, entry) {
            inner.bytes = inner.bytes.saturating_sub(old.weight);
        }
        inner.bytes += weight;
        Self::evict_locked(inner, &self.limits);
        true
    }

    /// Extend the freshness window of an existing entry without replacing its value.
    pub fn touch(&self, key: &K, ttl: Duration) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = deadline(now, ttl);
                entry.validated_at = now;
                entry.last_accessed = now;
                true
            }
            None => false,
        }
    }

    /// Mark an entry as past its freshness window, keeping it as a fallback.
    pub fn expire(&self, key: &K) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.map.peek_mut(key) {
            Some(entry) => {
                entry.expires_at = now;
                true
            }
            None => false,
        }
    }

    pub fn expire_all(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        for (_, entry) in inner.map.iter_mut() {
            entry.expires_at = now;
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.map.pop(key).map(|old| {
            inner.bytes = inner.bytes.saturating_sub(old.weight);
            old.value
        })
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.bytes = 0;
    }

    /// Evict least-recently-used entries until both bounds hold.
    pub fn evict_if_needed(&self) -> usize {
        let mut guard = self.inner.lock();
        Self::evict_locked(&mut guard, &self.limits)
    }

    /// Drop every entry whose retention window has passed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let doomed: Vec<K> = inner
            .map
            .iter()
            .filter(|(_, e)| past_retention(e, now, self.limits.stale_retention))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &doomed {
            if let Some(old) = inner.map.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(old.weight);
            }
        }
        inner.stats.expirations += doomed.len() as u64;
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.map.len(),
            bytes: inner.bytes,
            ..inner.stats
        }
    }

    fn evict_locked(inner: &mut Inner<K, V>, limits: &CacheLimits) -> usize {
        let mut evicted = 0;
        while inner.map.len() > limits.max_entries || inner.bytes > limits.max_bytes {
            match inner.map.pop_lru() {
                Some((_, old)) => {
                    inner.bytes = inner.bytes.saturating_sub(old.weight);
                    evicted += 1;
                }
                None => break,
            }
        }
        inner.stats.evictions += evicted as u64;
        evicted
    }
}

/// Run [`BoundedCache::sweep_expired`] every `every` until the cache is dropped.
pub fn spawn_sweeper<K, V>(cache: &Arc<BoundedCache<K, V>>, every: Duration) -> JoinHandle<()>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Weighted + Send + 'static,
{
    let weak: Weak<BoundedCache<K, V>> = Arc::downgrade(cache);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(cache) = weak.upgrade() else { break };
            let swept = cache.sweep_expired();
            if swept > 0 {
                tracing::debug!(swept, "cache sweep removed expired entries");
            }
        }
    })
}

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

fn past_retention<V>(entry: &CacheEntry<V>, now: Instant, retention: Duration) -> bool {
    entry
        .expires_at
        .checked_add(retention)
        .map_or(false, |limit| now >= limit)
}
