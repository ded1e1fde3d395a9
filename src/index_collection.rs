//! Collection index cache.
//!
//! The public catalog publishes a single index document listing every
//! element it carries. This module caches the parsed document under one
//! logical key with conditional (ETag) refresh, stale-while-revalidate, and a
//! circuit breaker; see [`refresh`](crate::refresh) for the freshness rules.
//!
//! # Index document
//!
//! ```json
//! {
//!   "generated": "2025-06-01T00:00:00Z",
//!   "index": {
//!     "skills": [
//!       {
//!         "path": "library/skills/code-review.md",
//!         "name": "Code Review",
//!         "description": "Reviews pull requests",
//!         "version": "1.0.0",
//!         "tags": ["review"],
//!         "content_hash": "b6fc4c62...",
//!         "modified_at": "2025-05-30T12:00:00Z"
//!       }
//!     ]
//!   }
//! }
//! ```
//!
//! Groups are keyed by type directory name and `content_hash` is the git blob
//! id of the element body. Unknown groups are ignored. A
//! document that fails to parse is reported as
//! [`CacheCorruption`](EngineError::CacheCorruption): the cached copy is
//! dropped and the next read refetches from scratch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::{CacheStats, Weighted};
use crate::circuit::CircuitBreakerState;
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::frontmatter::{build_entry, ElementHeader, EntryOrigin};
use crate::models::{ElementType, IndexEntry, Source};
use crate::refresh::{IndexSettings, Refreshed, Refresher, RefreshingCache};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::traits::{CollectionFetcher, Fetched, SourceIndex, SourceSnapshot};

const COLLECTION_KEY: &str = "collection";

#[derive(Debug, Deserialize)]
struct CollectionDocument {
    #[serde(default)]
    generated: Option<DateTime<Utc>>,
    index: BTreeMap<String, Vec<CollectionItem>>,
}

#[derive(Debug, Deserialize)]
struct CollectionItem {
    path: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(alias = "sha")]
    content_hash: String,
    #[serde(default, alias = "updated", alias = "created")]
    modified_at: Option<DateTime<Utc>>,
}

/// Parsed catalog, as cached.
#[derive(Debug, Clone, Default)]
pub struct CollectionSnapshot {
    pub entries: Arc<Vec<IndexEntry>>,
}

impl Weighted for CollectionSnapshot {
    fn weight(&self) -> usize {
        self.entries.as_ref().weight()
    }
}

/// Parse a catalog index document into deduplicated index entries.
pub fn parse_collection_index(bytes: &[u8]) -> Result<Vec<IndexEntry>> {
    let doc: CollectionDocument = serde_json::from_slice(bytes)
        .map_err(|e| EngineError::CacheCorruption(format!("collection index: {}", e)))?;

    let fallback_time = doc.generated.unwrap_or_default();
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for (group, items) in doc.index {
        let Some(element_type) = ElementType::from_dir_name(&group) else {
            tracing::debug!(group = %group, "skipping unknown collection group");
            continue;
        };
        for item in items {
            let entry = build_entry(
                EntryOrigin {
                    source: Source::Collection,
                    element_type,
                    locator: &item.path,
                    content_hash: item.content_hash,
                    modified_at: item.modified_at.unwrap_or(fallback_time),
                    change_marker: None,
                },
                ElementHeader {
                    name: item.name,
                    description: item.description,
                    version: item.version,
                    tags: item.tags,
                },
            );
            if seen.insert(entry.key()) {
                entries.push(entry);
            } else {
                tracing::debug!(key = %entry.key(), "duplicate collection entry ignored");
            }
        }
    }
    Ok(entries)
}

struct CollectionRefresher {
    fetcher: Arc<dyn CollectionFetcher>,
    retry: RetryPolicy,
}

#[async_trait]
impl Refresher for CollectionRefresher {
    type Snapshot = CollectionSnapshot;

    async fn refresh(
        &self,
        _key: &str,
        _previous: Option<Arc<CollectionSnapshot>>,
        etag: Option<String>,
    ) -> Result<Refreshed<CollectionSnapshot>> {
        let fetched = retry_with_backoff(&self.retry, "collection index", || {
            self.fetcher.fetch_index(etag.as_deref())
        })
        .await?;

        match fetched {
            Fetched::NotModified { .. } => Ok(Refreshed::NotModified),
            Fetched::Modified { value, etag, .. } => {
                let entries = parse_collection_index(&value)?;
                tracing::debug!(entries = entries.len(), "collection index parsed");
                Ok(Refreshed::Replaced {
                    snapshot: Arc::new(CollectionSnapshot {
                        entries: Arc::new(entries),
                    }),
                    etag,
                })
            }
        }
    }
}

/// Cached view of the public catalog.
pub struct CollectionIndex {
    fetcher: Arc<dyn CollectionFetcher>,
    cache: RefreshingCache<CollectionRefresher>,
    retry: RetryPolicy,
}

impl CollectionIndex {
    pub fn new(
        fetcher: Arc<dyn CollectionFetcher>,
        settings: IndexSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let refresher = CollectionRefresher {
            fetcher: fetcher.clone(),
            retry: settings.retry,
        };
        Self {
            fetcher,
            cache: RefreshingCache::new(
                Source::Collection.as_str(),
                refresher,
                settings.refresh,
                settings.limits,
                settings.breaker,
                clock,
            ),
            retry: settings.retry,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn breaker_state(&self) -> CircuitBreakerState {
        self.cache.breaker_state()
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        self.cache.spawn_sweeper(every)
    }

    /// `true` while a background refresh is running.
    pub fn is_refreshing(&self) -> bool {
        self.cache.is_revalidating(COLLECTION_KEY)
    }
}

#[async_trait]
impl SourceIndex for CollectionIndex {
    fn source(&self) -> Source {
        Source::Collection
    }

    async fn snapshot(&self) -> Result<SourceSnapshot> {
        let served = self.cache.get(COLLECTION_KEY).await?;
        Ok(SourceSnapshot {
            source: Source::Collection,
            entries: served.snapshot.entries.clone(),
            freshness: served.freshness,
            message: served.message,
        })
    }

    async fn invalidate(&self) -> Result<()> {
        self.cache.invalidate(COLLECTION_KEY);
        Ok(())
    }

    async fn get_content(&self, locator: &str) -> Result<Vec<u8>> {
        retry_with_backoff(&self.retry, "collection element", || {
            self.fetcher.fetch_element(locator)
        })
        .await
    }
}
