//! Freshness-managed snapshot cache shared by the remote indexers.
//!
//! A [`RefreshingCache`] holds complete snapshots produced by a [`Refresher`]
//! and decides when to call it:
//!
//! - **fresh, young**: served as is.
//! - **fresh, past `refresh_ratio` of the TTL**: served as is; one background
//!   revalidation is started.
//! - **expired**: the last-known-good snapshot is served flagged stale; one
//!   background refresh is started.
//! - **cold** (nothing cached) or **invalidated**: the caller waits on a
//!   single-flight refresh.
//!
//! Every network attempt goes through the source's [`CircuitBreaker`]. While
//! it is open nothing is fetched and cached data is served flagged stale. A
//! refresh publishes a whole new snapshot or nothing; snapshots are never
//! mutated in place.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::{spawn_sweeper, BoundedCache, CacheLimits, CacheStats, Weighted};
use crate::circuit::{BreakerConfig, CircuitBreaker, CircuitBreakerState, CircuitState};
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::models::Freshness;
use crate::retry::RetryPolicy;
use crate::singleflight::SingleFlight;

/// Result of asking a source for a newer snapshot.
pub enum Refreshed<S> {
    /// The cached snapshot is still current.
    NotModified,
    Replaced { snapshot: Arc<S>, etag: Option<String> },
}

/// Produces complete snapshots for one kind of source.
#[async_trait]
pub trait Refresher: Send + Sync + 'static {
    type Snapshot: Weighted + Send + Sync + 'static;

    /// Fetch a new snapshot for `key`. `previous` and `etag` describe what
    /// is currently cached so the refresher can make conditional requests
    /// and reuse unchanged parts.
    async fn refresh(
        &self,
        key: &str,
        previous: Option<Arc<Self::Snapshot>>,
        etag: Option<String>,
    ) -> Result<Refreshed<Self::Snapshot>>;
}

/// Freshness window and the point inside it where revalidation starts.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub ttl: Duration,
    pub refresh_ratio: f64,
}

impl RefreshPolicy {
    pub fn revalidate_after(&self) -> Duration {
        self.ttl.mul_f64(self.refresh_ratio.clamp(0.0, 1.0))
    }
}

/// Everything a remote-backed index needs besides its collaborator.
#[derive(Debug, Clone, Copy)]
pub struct IndexSettings {
    pub refresh: RefreshPolicy,
    pub limits: CacheLimits,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
}

/// A snapshot handed to a reader.
#[derive(Debug)]
pub struct Served<S> {
    pub snapshot: Arc<S>,
    pub freshness: Freshness,
    pub message: Option<String>,
}

impl<S> Clone for Served<S> {
    fn clone(&self) -> Self {
        Self {
            snapshot: self.snapshot.clone(),
            freshness: self.freshness,
            message: self.message.clone(),
        }
    }
}

struct Inner<R: Refresher> {
    name: String,
    refresher: R,
    cache: Arc<BoundedCache<String, Arc<R::Snapshot>>>,
    breaker: CircuitBreaker,
    flights: SingleFlight<String, Result<Arc<R::Snapshot>>>,
    revalidating: Mutex<HashSet<String>>,
    forced: Mutex<HashSet<String>>,
    policy: RefreshPolicy,
}

pub struct RefreshingCache<R: Refresher> {
    inner: Arc<Inner<R>>,
}

impl<R: Refresher> RefreshingCache<R> {
    pub fn new(
        name: impl Into<String>,
        refresher: R,
        policy: RefreshPolicy,
        limits: CacheLimits,
        breaker: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                breaker: CircuitBreaker::new(name.clone(), breaker, clock.clone()),
                name,
                refresher,
                cache: Arc::new(BoundedCache::new(limits, clock)),
                flights: SingleFlight::new(),
                revalidating: Mutex::new(HashSet::new()),
                forced: Mutex::new(HashSet::new()),
                policy,
            }),
        }
    }

    /// Serve the snapshot for `key` according to its freshness.
    pub async fn get(&self, key: &str) -> Result<Served<R::Snapshot>> {
        let inner = &self.inner;

        if inner.forced.lock().remove(key) {
            return match inner.refresh_now(key).await {
                Ok(snapshot) => Ok(Served {
                    snapshot,
                    freshness: Freshness::Fresh,
                    message: None,
                }),
                Err(err) => match inner.cache.get(&key.to_string()) {
                    Some(lookup) => {
                        tracing::warn!(source = %inner.name, error = %err, "forced refresh failed, serving cached snapshot");
                        Ok(Served {
                            snapshot: lookup.value,
                            freshness: Freshness::Stale,
                            message: Some(err.to_string()),
                        })
                    }
                    None => Err(err),
                },
            };
        }

        match inner.cache.get(&key.to_string()) {
            Some(lookup) if lookup.hit => {
                if lookup.age >= inner.policy.revalidate_after() {
                    self.spawn_refresh(key);
                }
                let degraded = inner.breaker.state().state != CircuitState::Closed;
                Ok(Served {
                    snapshot: lookup.value,
                    freshness: if degraded {
                        Freshness::Stale
                    } else {
                        Freshness::Fresh
                    },
                    message: degraded.then(|| self.open_message()),
                })
            }
            Some(lookup) => {
                self.spawn_refresh(key);
                let message = if inner.breaker.state().state == CircuitState::Closed {
                    format!("snapshot expired {:?} ago, refresh pending", lookup.age.saturating_sub(inner.policy.ttl))
                } else {
                    self.open_message()
                };
                Ok(Served {
                    snapshot: lookup.value,
                    freshness: Freshness::Stale,
                    message: Some(message),
                })
            }
            None => inner.refresh_now(key).await.map(|snapshot| Served {
                snapshot,
                freshness: Freshness::Fresh,
                message: None,
            }),
        }
    }

    /// Refresh `key` now, bypassing freshness. No stale fallback.
    pub async fn refresh_now(&self, key: &str) -> Result<Arc<R::Snapshot>> {
        self.inner.refresh_now(key).await
    }

    /// Make the next [`get`](Self::get) for `key` refresh synchronously.
    pub fn invalidate(&self, key: &str) {
        self.inner.forced.lock().insert(key.to_string());
        self.inner.cache.expire(&key.to_string());
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn breaker_state(&self) -> CircuitBreakerState {
        self.inner.breaker.state()
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        spawn_sweeper(&self.inner.cache, every)
    }

    /// `true` while a background refresh for `key` is running.
    pub fn is_revalidating(&self, key: &str) -> bool {
        self.inner.revalidating.lock().contains(key)
    }

    fn open_message(&self) -> String {
        format!(
            "circuit open for {}, next trial in {:?}",
            self.inner.name,
            self.inner.breaker.retry_in()
        )
    }

    /// Start one background refresh for `key` unless one is already running
    /// or the breaker would refuse it anyway.
    fn spawn_refresh(&self, key: &str) {
        let inner = &self.inner;
        let breaker = inner.breaker.state();
        if breaker.state != CircuitState::Closed && !inner.breaker.retry_in().is_zero() {
            return;
        }
        if !inner.revalidating.lock().insert(key.to_string()) {
            return;
        }

        let inner = inner.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tracing::debug!(source = %inner.name, key = %key, "background refresh");
            if let Err(err) = inner.refresh_now(&key).await {
                tracing::debug!(source = %inner.name, key = %key, error = %err, "background refresh failed");
            }
            inner.revalidating.lock().remove(&key);
        });
    }
}

impl<R: Refresher> Inner<R> {
    async fn refresh_now(&self, key: &str) -> Result<Arc<R::Snapshot>> {
        self.flights
            .run(key.to_string(), || self.fetch_and_publish(key))
            .await
    }

    async fn fetch_and_publish(&self, key: &str) -> Result<Arc<R::Snapshot>> {
        let Some(permit) = self.breaker.try_acquire() else {
            return Err(EngineError::CircuitOpen {
                source_name: self.name.clone(),
                retry_in: self.breaker.retry_in(),
            });
        };

        let cache_key = key.to_string();
        let (previous, etag) = match self.cache.peek(&cache_key) {
            Some((value, etag)) => (Some(value), etag),
            None => (None, None),
        };

        match self.refresher.refresh(key, previous.clone(), etag).await {
            Ok(Refreshed::NotModified) => {
                permit.success();
                match previous {
                    Some(snapshot) if self.cache.touch(&cache_key, self.policy.ttl) => {
                        tracing::debug!(source = %self.name, key, "not modified, freshness extended");
                        Ok(snapshot)
                    }
                    _ => {
                        self.cache.remove(&cache_key);
                        Err(EngineError::CacheCorruption(format!(
                            "{}: not-modified response without a cached snapshot",
                            self.name
                        )))
                    }
                }
            }
            Ok(Refreshed::Replaced { snapshot, etag }) => {
                permit.success();
                if !self
                    .cache
                    .set_with_etag(cache_key, snapshot.clone(), self.policy.ttl, etag)
                {
                    tracing::warn!(source = %self.name, key, "snapshot exceeds cache budget, serving uncached");
                }
                tracing::info!(source = %self.name, key, "snapshot refreshed");
                Ok(snapshot)
            }
            Err(EngineError::CacheCorruption(reason)) => {
                // The source answered; what it sent is unusable. Start cold.
                permit.success();
                self.cache.remove(&cache_key);
                tracing::warn!(source = %self.name, key, reason = %reason, "discarding corrupt snapshot");
                Err(EngineError::CacheCorruption(reason))
            }
            Err(err) => {
                permit.failure();
                tracing::warn!(source = %self.name, key, error = %err, "refresh failed");
                Err(err)
            }
        }
    }
}
