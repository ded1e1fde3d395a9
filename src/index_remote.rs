//! Remote portfolio indexer.
//!
//! Builds a per-owner index of the user's remote repository. Each element
//! type directory is listed (conditionally on its last ETag) and each file
//! contributes an [`IndexEntry`] built from a metadata read of its header
//! block. Bodies are fetched only through [`get_content`](SourceIndex::get_content).
//!
//! Refreshes are incremental but publish whole snapshots:
//!
//! - a directory answering "not modified" keeps its previous entries;
//! - a file whose change marker matches the previous snapshot keeps its
//!   previous entry without a metadata read;
//! - a missing directory means zero entries of that type;
//! - entries in subdirectories are ignored, matching the local scan;
//! - any other failure fails the whole refresh, so a half-built listing is
//!   never published.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::{CacheStats, Weighted};
use crate::circuit::CircuitBreakerState;
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::frontmatter::{build_entry, parse_header, EntryOrigin};
use crate::models::{element_type_of_locator, ElementType, IndexEntry, Source};
use crate::refresh::{IndexSettings, Refreshed, Refresher, RefreshingCache};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::traits::{Fetched, RateLimitInfo, RemoteFile, RemoteRepository, SourceIndex, SourceSnapshot};

/// Below this many remaining requests, metadata reads run one at a time.
const LOW_QUOTA_THRESHOLD: u32 = 50;

/// One refresh's worth of remote state.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub entries: Arc<Vec<IndexEntry>>,
    /// Last listing ETag per type directory.
    pub dir_etags: BTreeMap<ElementType, String>,
}

impl Weighted for RemoteSnapshot {
    fn weight(&self) -> usize {
        self.entries.as_ref().weight()
            + self.dir_etags.values().map(|e| e.len() + 16).sum::<usize>()
    }
}

enum Listing {
    Unchanged,
    Changed {
        files: Vec<RemoteFile>,
        etag: Option<String>,
    },
}

struct RemoteRefresher {
    repo: Arc<dyn RemoteRepository>,
    retry: RetryPolicy,
    max_in_flight: usize,
}

impl RemoteRefresher {
    async fn list_type(
        &self,
        element_type: ElementType,
        etag: Option<&str>,
    ) -> Result<(Listing, RateLimitInfo)> {
        let dir = element_type.dir_name();
        let listed = retry_with_backoff(&self.retry, "remote list", || {
            self.repo.list_directory(dir, etag)
        })
        .await;

        match listed {
            Ok(Fetched::NotModified { rate_limit }) => Ok((Listing::Unchanged, rate_limit)),
            Ok(Fetched::Modified {
                value,
                etag,
                rate_limit,
            }) => Ok((Listing::Changed { files: value, etag }, rate_limit)),
            Err(EngineError::NotFound(_)) => {
                tracing::debug!(dir, "remote type directory missing, zero entries");
                Ok((
                    Listing::Changed {
                        files: Vec::new(),
                        etag: None,
                    },
                    RateLimitInfo::default(),
                ))
            }
            Err(err) => Err(err),
        }
    }

    async fn read_entry(&self, element_type: ElementType, file: RemoteFile) -> Result<IndexEntry> {
        let meta = retry_with_backoff(&self.retry, "remote metadata", || {
            self.repo.get_file_metadata(&file.path)
        })
        .await?;
        let header = parse_header(&file.path, &meta.header);
        Ok(build_entry(
            EntryOrigin {
                source: Source::RemotePortfolio,
                element_type,
                locator: &file.path,
                content_hash: meta.content_hash,
                modified_at: meta.modified_at,
                change_marker: meta.change_marker.or(file.change_marker),
            },
            header,
        ))
    }
}

#[async_trait]
impl Refresher for RemoteRefresher {
    type Snapshot = RemoteSnapshot;

    async fn refresh(
        &self,
        key: &str,
        previous: Option<Arc<RemoteSnapshot>>,
        _etag: Option<String>,
    ) -> Result<Refreshed<RemoteSnapshot>> {
        let previous = previous.unwrap_or_default();

        let listings: Vec<(ElementType, Listing, RateLimitInfo)> =
            stream::iter(ElementType::ALL)
                .map(|element_type| {
                    let etag = previous.dir_etags.get(&element_type).cloned();
                    async move {
                        let (listing, rate) = self.list_type(element_type, etag.as_deref()).await?;
                        Ok::<_, EngineError>((element_type, listing, rate))
                    }
                })
                .buffer_unordered(self.max_in_flight)
                .try_collect()
                .await?;

        if listings
            .iter()
            .all(|(_, listing, _)| matches!(listing, Listing::Unchanged))
        {
            tracing::debug!(owner = key, "remote portfolio not modified");
            return Ok(Refreshed::NotModified);
        }

        let quota_low = listings
            .iter()
            .any(|(_, _, rate)| rate.is_low(LOW_QUOTA_THRESHOLD));
        let concurrency = if quota_low { 1 } else { self.max_in_flight };
        if quota_low {
            tracing::warn!(owner = key, "remote quota low, reading metadata serially");
        }

        let previous_by_locator: HashMap<&str, &IndexEntry> = previous
            .entries
            .iter()
            .map(|e| (e.locator.as_str(), e))
            .collect();

        let mut entries = Vec::new();
        let mut dir_etags = BTreeMap::new();
        let mut to_read = Vec::new();
        let mut reused = 0usize;

        for (element_type, listing, _) in listings {
            match listing {
                Listing::Unchanged => {
                    entries.extend(
                        previous
                            .entries
                            .iter()
                            .filter(|e| e.element_type == element_type)
                            .cloned(),
                    );
                    if let Some(etag) = previous.dir_etags.get(&element_type) {
                        dir_etags.insert(element_type, etag.clone());
                    }
                }
                Listing::Changed { files, etag } => {
                    if let Some(etag) = etag {
                        dir_etags.insert(element_type, etag);
                    }
                    for file in files
                        .into_iter()
                        .filter(|f| element_type_of_locator(&f.path) == Some(element_type))
                    {
                        let unchanged = previous_by_locator.get(file.path.as_str()).filter(|e| {
                            e.change_marker.is_some() && e.change_marker == file.change_marker
                        });
                        match unchanged {
                            Some(entry) => {
                                entries.push((*entry).clone());
                                reused += 1;
                            }
                            None => to_read.push((element_type, file)),
                        }
                    }
                }
            }
        }

        let fetched = to_read.len();
        let read: Vec<IndexEntry> = stream::iter(to_read)
            .map(|(element_type, file)| self.read_entry(element_type, file))
            .buffer_unordered(concurrency)
            .try_collect()
            .await?;
        entries.extend(read);
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        entries.dedup_by(|a, b| a.key() == b.key());

        tracing::info!(
            owner = key,
            entries = entries.len(),
            reused,
            fetched,
            "remote portfolio indexed"
        );
        Ok(Refreshed::Replaced {
            snapshot: Arc::new(RemoteSnapshot {
                entries: Arc::new(entries),
                dir_etags,
            }),
            etag: None,
        })
    }
}

/// Cached index of one owner's remote portfolio, plus the write path used by sync.
pub struct RemotePortfolioIndex {
    repo: Arc<dyn RemoteRepository>,
    owner: String,
    cache: RefreshingCache<RemoteRefresher>,
    retry: RetryPolicy,
}

impl RemotePortfolioIndex {
    pub fn new(
        repo: Arc<dyn RemoteRepository>,
        settings: IndexSettings,
        max_in_flight: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let owner = repo.owner().to_string();
        let refresher = RemoteRefresher {
            repo: repo.clone(),
            retry: settings.retry,
            max_in_flight: max_in_flight.max(1),
        };
        Self {
            repo,
            cache: RefreshingCache::new(
                Source::RemotePortfolio.as_str(),
                refresher,
                settings.refresh,
                settings.limits,
                settings.breaker,
                clock,
            ),
            owner,
            retry: settings.retry,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// A snapshot fetched now, bypassing freshness. Used by sync, which must
    /// never plan against a stale view of the remote.
    pub async fn fresh_entries(&self) -> Result<Arc<Vec<IndexEntry>>> {
        let snapshot = self.cache.refresh_now(&self.owner).await?;
        Ok(snapshot.entries.clone())
    }

    /// Upload one element. Returns the new change marker.
    pub async fn put(
        &self,
        locator: &str,
        content: &[u8],
        expected_marker: Option<&str>,
    ) -> Result<String> {
        retry_with_backoff(&self.retry, "remote put", || {
            self.repo.put_file(locator, content, expected_marker)
        })
        .await
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
}

#[async_trait]
impl SourceIndex for RemotePortfolioIndex {
    fn source(&self) -> Source {
        Source::RemotePortfolio
    }

    async fn snapshot(&self) -> Result<SourceSnapshot> {
        let served = self.cache.get(&self.owner).await?;
        Ok(SourceSnapshot {
            source: Source::RemotePortfolio,
            entries: served.snapshot.entries.clone(),
            freshness: served.freshness,
            message: served.message,
        })
    }

    async fn invalidate(&self) -> Result<()> {
        self.cache.invalidate(&self.owner);
        Ok(())
    }

    async fn get_content(&self, locator: &str) -> Result<Vec<u8>> {
        retry_with_backoff(&self.retry, "remote content", || {
            self.repo.get_file_content(locator)
        })
        .await
    }
}
