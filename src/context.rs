//! Per-process engine wiring.
//!
//! [`EngineBuilder`] takes a [`Config`] plus whatever collaborators the host
//! provides and builds one [`EngineContext`]. All caches, breakers, and sync
//! state live inside that context; nothing is global, so tests build a fresh
//! context each time.
//!
//! ```text
//!   Config ─┐
//!           ├─► EngineBuilder::build() ─► EngineContext
//!  collab. ─┘                               ├─ LocalPortfolioIndex   (always)
//!                                           ├─ RemotePortfolioIndex  (with_remote)
//!                                           ├─ CollectionIndex       (url or with_collection)
//!                                           ├─ UnifiedIndexManager
//!                                           └─ SyncManager           (remote + validator)
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::fs_store::FsLocalStore;
use crate::http_collection::HttpCollectionFetcher;
use crate::index_collection::CollectionIndex;
use crate::index_local::LocalPortfolioIndex;
use crate::index_remote::RemotePortfolioIndex;
use crate::models::{ElementKey, PagedResult, SearchHit, SearchQuery, Source};
use crate::progress::{SyncProgressReporter, TracingProgress};
use crate::search::UnifiedIndexManager;
use crate::sources::{source_health, SourceHealth};
use crate::stats::EngineStats;
use crate::sync::{SyncManager, SyncReport, SyncRequest};
use crate::traits::{CollectionFetcher, ContentValidator, LocalStore, RemoteRepository, SourceIndex};

pub struct EngineBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    local_store: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteRepository>>,
    collection: Option<Arc<dyn CollectionFetcher>>,
    validator: Option<Arc<dyn ContentValidator>>,
    progress: Arc<dyn SyncProgressReporter>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            local_store: None,
            remote: None,
            collection: None,
            validator: None,
            progress: Arc::new(TracingProgress),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the filesystem store rooted at `portfolio.root`.
    pub fn with_local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.local_store = Some(store);
        self
    }

    pub fn with_remote(mut self, repo: Arc<dyn RemoteRepository>) -> Self {
        self.remote = Some(repo);
        self
    }

    /// Replace the HTTP fetcher built from `collection.url`.
    pub fn with_collection(mut self, fetcher: Arc<dyn CollectionFetcher>) -> Self {
        self.collection = Some(fetcher);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ContentValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Wire every component and run the initial local scan.
    pub async fn build(self) -> Result<EngineContext> {
        let config = self.config;
        let clock = self.clock;

        let store: Arc<dyn LocalStore> = match self.local_store {
            Some(store) => store,
            None => Arc::new(
                FsLocalStore::with_excludes(&config.portfolio.root, &config.portfolio.exclude_globs)
                    .map_err(|e| EngineError::Config(format!("{:#}", e)))?,
            ),
        };
        let local = Arc::new(LocalPortfolioIndex::new(store));
        local.scan().await?;

        let remote = self.remote.map(|repo| {
            if let Some(owner) = &config.remote.owner {
                if owner != repo.owner() {
                    tracing::warn!(
                        configured = %owner,
                        client = %repo.owner(),
                        "remote client owner differs from configuration"
                    );
                }
            }
            Arc::new(RemotePortfolioIndex::new(
                repo,
                config.remote_settings(),
                config.remote.max_in_flight,
                clock.clone(),
            ))
        });
        if remote.is_none() && config.remote.owner.is_some() {
            tracing::warn!("remote portfolio configured but no client was provided; remote source disabled");
        }

        let fetcher: Option<Arc<dyn CollectionFetcher>> = match (self.collection, &config.collection.url) {
            (Some(fetcher), _) => Some(fetcher),
            (None, Some(url)) => Some(Arc::new(HttpCollectionFetcher::new(
                url.clone(),
                Duration::from_secs(config.collection.timeout_secs),
            )?)),
            (None, None) => None,
        };
        let collection = fetcher.map(|fetcher| {
            Arc::new(CollectionIndex::new(
                fetcher,
                config.collection_settings(),
                clock.clone(),
            ))
        });

        let search_settings = config
            .search_settings()
            .map_err(|e| EngineError::Config(format!("{:#}", e)))?;
        let mut search = UnifiedIndexManager::new(search_settings)
            .with_source(local.clone() as Arc<dyn SourceIndex>);
        if let Some(remote) = &remote {
            search = search.with_source(remote.clone() as Arc<dyn SourceIndex>);
        }
        if let Some(collection) = &collection {
            search = search.with_source(collection.clone() as Arc<dyn SourceIndex>);
        }

        let sync = match (&remote, self.validator) {
            (Some(remote), Some(validator)) => Some(
                SyncManager::new(
                    local.clone(),
                    remote.clone(),
                    validator,
                    config.sync_settings(),
                    clock.clone(),
                )
                .with_progress(self.progress),
            ),
            _ => None,
        };

        tracing::info!(
            local_entries = local.len(),
            remote = remote.is_some(),
            collection = collection.is_some(),
            sync = sync.is_some(),
            "element index ready"
        );

        Ok(EngineContext {
            config,
            clock,
            local,
            remote,
            collection,
            search,
            sync,
        })
    }
}

pub struct EngineContext {
    config: Config,
    clock: Arc<dyn Clock>,
    local: Arc<LocalPortfolioIndex>,
    remote: Option<Arc<RemotePortfolioIndex>>,
    collection: Option<Arc<CollectionIndex>>,
    search: UnifiedIndexManager,
    sync: Option<SyncManager>,
}

impl EngineContext {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn local(&self) -> &Arc<LocalPortfolioIndex> {
        &self.local
    }

    pub fn remote(&self) -> Option<&Arc<RemotePortfolioIndex>> {
        self.remote.as_ref()
    }

    pub fn collection(&self) -> Option<&Arc<CollectionIndex>> {
        self.collection.as_ref()
    }

    pub fn sync_manager(&self) -> Option<&SyncManager> {
        self.sync.as_ref()
    }

    /// Unified search across every configured source. Never fails; degraded
    /// sources are reported per source in the result.
    pub async fn search_all(&self, query: &SearchQuery) -> PagedResult<SearchHit> {
        self.search.search(query).await
    }

    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncReport> {
        let manager = self.sync.as_ref().ok_or_else(|| {
            EngineError::Config(
                "sync needs a remote portfolio client and a content validator".to_string(),
            )
        })?;
        manager.sync(request).await
    }

    /// Force the next access to `source` (or every source) to bypass freshness.
    pub async fn invalidate(&self, source: Option<Source>) -> Result<()> {
        for candidate in Source::ALL {
            if source.is_some_and(|s| s != candidate) {
                continue;
            }
            if let Some(index) = self.search.index(candidate) {
                index.invalidate().await?;
                tracing::info!(source = %candidate, "source invalidated");
            }
        }
        Ok(())
    }

    /// Fetch the full body of one element from one source. Bodies are never cached.
    pub async fn get_content(&self, source: Source, key: &ElementKey) -> Result<Vec<u8>> {
        let index = self
            .search
            .index(source)
            .ok_or_else(|| EngineError::Config(format!("source {} is not configured", source)))?;

        let locator = match source {
            Source::Local => self.local.get(key).map(|e| e.locator),
            _ => index
                .snapshot()
                .await?
                .entries
                .iter()
                .find(|e| e.element_type == key.element_type && e.id == key.id)
                .map(|e| e.locator.clone()),
        }
        .ok_or_else(|| EngineError::NotFound(format!("{} in {}", key, source)))?;

        index.get_content(&locator).await
    }

    /// Health of each source, in priority order.
    pub fn sources(&self) -> Vec<SourceHealth> {
        self.search
            .settings()
            .priority
            .order()
            .iter()
            .map(|source| source_health(self, *source))
            .collect()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            local_entries: self.local.len(),
            remote: self.remote.as_ref().map(|r| r.stats()),
            collection: self.collection.as_ref().map(|c| c.stats()),
            baseline_entries: self.sync.as_ref().map_or(0, |s| s.baseline().len()),
        }
    }

    /// Start the periodic expiry sweepers. Dropping the handles does not stop them;
    /// abort them to shut down.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let every = self.config.sweep_interval();
        let mut handles = Vec::new();
        if let Some(remote) = &self.remote {
            handles.push(remote.spawn_sweeper(every));
        }
        if let Some(collection) = &self.collection {
            handles.push(collection.spawn_sweeper(every));
        }
        handles
    }
}
