//! TOML configuration.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration (local portfolio in `./portfolio`, no remote, no
//! collection). [`load_config`] parses and then validates the ranges the
//! engine relies on.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheLimits;
use crate::circuit::BreakerConfig;
use crate::models::Source;
use crate::refresh::{IndexSettings, RefreshPolicy};
use crate::retry::RetryPolicy;
use crate::search::{SearchSettings, SourcePriority};
use crate::sync::{ConflictPolicy, SyncSettings};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub portfolio: PortfolioConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub search: SearchSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortfolioConfig {
    #[serde(default = "default_portfolio_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            root: default_portfolio_root(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_portfolio_root() -> PathBuf {
    PathBuf::from("./portfolio")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    /// Index document URL. No URL means no collection source.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_collection_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_refresh_ratio")]
    pub refresh_ratio: f64,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            ttl_secs: default_collection_ttl(),
            refresh_ratio: default_refresh_ratio(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_collection_ttl() -> u64 {
    900
}
fn default_refresh_ratio() -> f64 {
    0.8
}
fn default_http_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_remote_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_refresh_ratio")]
    pub refresh_ratio: f64,
    /// Concurrent directory listings and metadata reads.
    #[serde(default = "default_remote_in_flight")]
    pub max_in_flight: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            owner: None,
            repo: None,
            ttl_secs: default_remote_ttl(),
            refresh_ratio: default_refresh_ratio(),
            max_in_flight: default_remote_in_flight(),
        }
    }
}

fn default_remote_ttl() -> u64 {
    300
}
fn default_remote_in_flight() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// How long an expired snapshot is kept as a last-known-good fallback.
    #[serde(default = "default_stale_retention")]
    pub stale_retention_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            sweep_interval_secs: default_sweep_interval(),
            stale_retention_secs: default_stale_retention(),
        }
    }
}

fn default_max_entries() -> usize {
    10_000
}
fn default_max_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_stale_retention() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_base")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_breaker_max")]
    pub max_backoff_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            base_backoff_ms: default_breaker_base(),
            max_backoff_ms: default_breaker_max(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_breaker_base() -> u64 {
    30_000
}
fn default_breaker_max() -> u64 {
    300_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_retry_max")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_retry_initial(),
            max_backoff_ms: default_retry_max(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_initial() -> u64 {
    200
}
fn default_retry_max() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSection {
    #[serde(default = "default_sync_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// `0` disables the default deadline.
    #[serde(default = "default_sync_deadline")]
    pub deadline_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            max_in_flight: default_sync_in_flight(),
            conflict_policy: ConflictPolicy::Manual,
            deadline_secs: default_sync_deadline(),
        }
    }
}

fn default_sync_in_flight() -> usize {
    4
}
fn default_sync_deadline() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchSection {
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    #[serde(default = "default_source_priority")]
    pub source_priority: Vec<Source>,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            source_priority: default_source_priority(),
        }
    }
}

fn default_page_size() -> usize {
    20
}
fn default_max_page_size() -> usize {
    100
}
fn default_source_priority() -> Vec<Source> {
    SourcePriority::default().order().to_vec()
}

impl Config {
    fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_entries: self.cache.max_entries,
            max_bytes: self.cache.max_bytes,
            stale_retention: Duration::from_secs(self.cache.stale_retention_secs),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            base_backoff: Duration::from_millis(self.breaker.base_backoff_ms),
            max_backoff: Duration::from_millis(self.breaker.max_backoff_ms),
            ..BreakerConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn collection_settings(&self) -> IndexSettings {
        IndexSettings {
            refresh: RefreshPolicy {
                ttl: Duration::from_secs(self.collection.ttl_secs),
                refresh_ratio: self.collection.refresh_ratio,
            },
            limits: self.cache_limits(),
            breaker: self.breaker_config(),
            retry: self.retry_policy(),
        }
    }

    pub fn remote_settings(&self) -> IndexSettings {
        IndexSettings {
            refresh: RefreshPolicy {
                ttl: Duration::from_secs(self.remote.ttl_secs),
                refresh_ratio: self.remote.refresh_ratio,
            },
            limits: self.cache_limits(),
            breaker: self.breaker_config(),
            retry: self.retry_policy(),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            max_in_flight: self.sync.max_in_flight,
            conflict_policy: self.sync.conflict_policy,
            deadline: match self.sync.deadline_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn search_settings(&self) -> Result<SearchSettings> {
        Ok(SearchSettings {
            default_page_size: self.search.default_page_size,
            max_page_size: self.search.max_page_size,
            priority: SourcePriority::new(self.search.source_priority.clone())?,
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_secs)
    }

    /// Range checks applied by [`load_config`].
    pub fn validate(&self) -> Result<()> {
        if self.collection.ttl_secs == 0 {
            anyhow::bail!("collection.ttl_secs must be > 0");
        }
        if self.remote.ttl_secs == 0 {
            anyhow::bail!("remote.ttl_secs must be > 0");
        }
        for (name, ratio) in [
            ("collection.refresh_ratio", self.collection.refresh_ratio),
            ("remote.refresh_ratio", self.remote.refresh_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                anyhow::bail!("{} must be in (0.0, 1.0]", name);
            }
        }
        if self.remote.max_in_flight == 0 {
            anyhow::bail!("remote.max_in_flight must be >= 1");
        }
        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be > 0");
        }
        if self.cache.max_bytes == 0 {
            anyhow::bail!("cache.max_bytes must be > 0");
        }
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be >= 1");
        }
        if self.breaker.base_backoff_ms > self.breaker.max_backoff_ms {
            anyhow::bail!("breaker.base_backoff_ms must not exceed breaker.max_backoff_ms");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be >= 1");
        }
        if self.sync.max_in_flight == 0 {
            anyhow::bail!("sync.max_in_flight must be >= 1");
        }
        if self.search.default_page_size == 0 || self.search.max_page_size == 0 {
            anyhow::bail!("search page sizes must be > 0");
        }
        if self.search.default_page_size > self.search.max_page_size {
            anyhow::bail!("search.default_page_size must not exceed search.max_page_size");
        }
        if self.remote.owner.is_some() != self.remote.repo.is_some() {
            anyhow::bail!("remote.owner and remote.repo must be set together");
        }
        self.search_settings()
            .context("search.source_priority is invalid")?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
