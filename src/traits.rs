//! Collaborator seams for the index and sync engine.
//!
//! The engine owns caching, freshness, deduplication, and reconciliation. It
//! does not own transport, authentication, storage primitives, or content
//! policy; those are reached through the traits in this module and injected
//! at construction time (see [`EngineBuilder`](crate::context::EngineBuilder)).
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                UnifiedIndexManager                 │
//! │   ┌──────────┐   ┌───────────────┐   ┌──────────┐  │
//! │   │  Local   │   │    Remote     │   │Collection│  │
//! │   │  index   │   │   portfolio   │   │  index   │  │
//! │   └────┬─────┘   └──────┬────────┘   └────┬─────┘  │
//! └────────┼────────────────┼─────────────────┼────────┘
//!          ▼                ▼                 ▼
//!     LocalStore    RemoteRepository   CollectionFetcher
//!                          ▲
//!          SyncManager ────┘ (+ ContentValidator)
//! ```
//!
//! Every indexer is also exposed to the manager as a [`SourceIndex`], so the
//! manager depends on indexers and never the other way around.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::models::{ElementType, Freshness, IndexEntry, Source};

pub use crate::clock::Clock;

// ═══════════════════════════════════════════════════════════════════════
// Conditional fetch results
// ═══════════════════════════════════════════════════════════════════════

/// Rate-limit metadata reported alongside a remote response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Requests left in the current quota window.
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    /// `true` when the remaining quota is known and below `threshold`.
    pub fn is_low(&self, threshold: u32) -> bool {
        self.remaining.is_some_and(|r| r < threshold)
    }
}

/// Outcome of a conditional request.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    /// The resource still matches the change marker sent with the request.
    NotModified { rate_limit: RateLimitInfo },
    Modified {
        value: T,
        etag: Option<String>,
        rate_limit: RateLimitInfo,
    },
}

impl<T> Fetched<T> {
    pub fn rate_limit(&self) -> RateLimitInfo {
        match self {
            Fetched::NotModified { rate_limit } | Fetched::Modified { rate_limit, .. } => {
                *rate_limit
            }
        }
    }

    pub fn modified(value: T, etag: Option<String>) -> Self {
        Fetched::Modified {
            value,
            etag,
            rate_limit: RateLimitInfo::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Remote repository
// ═══════════════════════════════════════════════════════════════════════

/// One file in a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Repository-relative path, e.g. `skills/code-review.md`.
    pub path: String,
    pub name: String,
    /// Per-file change marker (a blob id on git hosts).
    pub change_marker: Option<String>,
    pub size: u64,
}

/// Lightweight metadata for one remote element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileMetadata {
    /// The document's header block only, never the body.
    pub header: String,
    /// Git blob id of the body (see [`content_hash`](crate::models::content_hash)).
    /// Git hosts report it alongside the file (GitHub's `sha`), so clients
    /// fill this without transferring the body.
    pub content_hash: String,
    pub modified_at: DateTime<Utc>,
    pub change_marker: Option<String>,
}

/// Client for the user's personal remote repository.
///
/// Implementations own transport and authentication. Errors must be
/// classified into the [`EngineError`](crate::error::EngineError) taxonomy:
/// a missing path is `NotFound`, a refused write because the target moved is
/// `Conflict`, throttling is `RateLimited`.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// The account owning the repository; remote snapshots are cached per owner.
    fn owner(&self) -> &str;

    /// List the direct children of a directory, conditionally on `etag`.
    /// Subdirectories may be listed or omitted; only files directly inside a
    /// type directory are indexed.
    async fn list_directory(
        &self,
        path: &str,
        etag: Option<&str>,
    ) -> Result<Fetched<Vec<RemoteFile>>>;

    async fn get_file_metadata(&self, path: &str) -> Result<RemoteFileMetadata>;

    async fn get_file_content(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or replace a file. `expected_marker` is the change marker the
    /// caller believes the remote holds (`None` for a create). Returns the
    /// new change marker.
    async fn put_file(
        &self,
        path: &str,
        content: &[u8],
        expected_marker: Option<&str>,
    ) -> Result<String>;
}

// ═══════════════════════════════════════════════════════════════════════
// Public collection
// ═══════════════════════════════════════════════════════════════════════

/// Fetcher for the shared public catalog.
#[async_trait]
pub trait CollectionFetcher: Send + Sync {
    /// Fetch the catalog index document, conditionally on `etag`.
    async fn fetch_index(&self, etag: Option<&str>) -> Result<Fetched<Vec<u8>>>;

    /// Fetch one element body by its catalog path.
    async fn fetch_element(&self, path: &str) -> Result<Vec<u8>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Content validation
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub severity: Severity,
    pub findings: Vec<String>,
}

impl ValidationReport {
    pub fn clean() -> Self {
        Self {
            severity: Severity::None,
            findings: Vec::new(),
        }
    }

    /// Writes are refused at `High` and above.
    pub fn is_blocking(&self) -> bool {
        self.severity >= Severity::High
    }

    pub fn summary(&self) -> String {
        if self.findings.is_empty() {
            format!("severity {}", self.severity.as_str())
        } else {
            format!(
                "severity {}: {}",
                self.severity.as_str(),
                self.findings.join("; ")
            )
        }
    }
}

/// Security gate every write passes through before it lands.
#[async_trait]
pub trait ContentValidator: Send + Sync {
    async fn validate(&self, element_type: ElementType, content: &[u8])
        -> Result<ValidationReport>;
}

// ═══════════════════════════════════════════════════════════════════════
// Local storage
// ═══════════════════════════════════════════════════════════════════════

/// A file in the local portfolio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Portfolio-relative path, e.g. `personas/ziggy.md`.
    pub locator: String,
    pub modified_at: DateTime<Utc>,
}

/// Locked atomic read/write of element files, keyed by portfolio-relative path.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Element files of one type. A missing type directory yields an empty list.
    async fn list(&self, element_type: ElementType) -> Result<Vec<LocalFile>>;

    /// `None` when the file does not exist.
    async fn stat(&self, locator: &str) -> Result<Option<LocalFile>>;

    async fn read(&self, locator: &str) -> Result<Vec<u8>>;

    /// Replace the file atomically; returns its new metadata.
    async fn write(&self, locator: &str, content: &[u8]) -> Result<LocalFile>;

    async fn delete(&self, locator: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Source index seam
// ═══════════════════════════════════════════════════════════════════════

/// What one source contributes to a search: a complete snapshot plus how
/// current it is.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub source: Source,
    pub entries: Arc<Vec<IndexEntry>>,
    pub freshness: Freshness,
    pub message: Option<String>,
}

/// An indexer as seen by the unified index manager.
#[async_trait]
pub trait SourceIndex: Send + Sync {
    fn source(&self) -> Source;

    /// Current snapshot. Implementations serve cached data whenever they
    /// have any and return `Err` only when nothing can be served.
    async fn snapshot(&self) -> Result<SourceSnapshot>;

    /// Bypass freshness on the next access.
    async fn invalidate(&self) -> Result<()>;

    /// Fetch the full body behind `locator`. Bodies are never cached.
    async fn get_content(&self, locator: &str) -> Result<Vec<u8>>;
}
