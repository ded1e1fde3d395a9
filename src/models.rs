//! Core data models used throughout the element index.
//!
//! These types describe elements as seen by one source (an [`IndexEntry`]),
//! the queries run against the unified index, and the paged results handed
//! back to callers. Index entries never carry element bodies: only a
//! locator, a content hash, and a handful of searchable metadata fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// File extensions recognised as element documents.
pub const ELEMENT_EXTENSIONS: &[&str] = &["md", "yaml", "yml", "json"];

/// The kind of content unit an element represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Persona,
    Skill,
    Template,
    Agent,
    Memory,
    Ensemble,
}

impl ElementType {
    pub const ALL: [ElementType; 6] = [
        ElementType::Persona,
        ElementType::Skill,
        ElementType::Template,
        ElementType::Agent,
        ElementType::Memory,
        ElementType::Ensemble,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Persona => "persona",
            ElementType::Skill => "skill",
            ElementType::Template => "template",
            ElementType::Agent => "agent",
            ElementType::Memory => "memory",
            ElementType::Ensemble => "ensemble",
        }
    }

    /// Directory holding this type inside a portfolio (`personas`, `skills`, ...).
    pub fn dir_name(&self) -> &'static str {
        match self {
            ElementType::Persona => "personas",
            ElementType::Skill => "skills",
            ElementType::Template => "templates",
            ElementType::Agent => "agents",
            ElementType::Memory => "memories",
            ElementType::Ensemble => "ensembles",
        }
    }

    pub fn from_dir_name(dir: &str) -> Option<Self> {
        ElementType::ALL.into_iter().find(|t| t.dir_name() == dir)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        ElementType::ALL
            .into_iter()
            .find(|t| t.as_str() == lowered || t.dir_name() == lowered)
            .ok_or_else(|| EngineError::Config(format!("unknown element type: '{}'", s)))
    }
}

/// Where an index entry was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Local,
    RemotePortfolio,
    Collection,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Local, Source::RemotePortfolio, Source::Collection];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Local => "local",
            Source::RemotePortfolio => "remote-portfolio",
            Source::Collection => "collection",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "local" => Ok(Source::Local),
            "remote-portfolio" | "remote" | "github" => Ok(Source::RemotePortfolio),
            "collection" => Ok(Source::Collection),
            other => Err(EngineError::Config(format!("unknown source: '{}'", other))),
        }
    }
}

/// Identity of an element independent of the source it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementKey {
    pub element_type: ElementType,
    pub id: String,
}

impl ElementKey {
    pub fn new(element_type: ElementType, id: impl Into<String>) -> Self {
        Self {
            element_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.element_type.dir_name(), self.id)
    }
}

/// One element as known to one source.
///
/// Unique per `(source, element_type, id)`. Holds metadata only; the body is
/// reachable through `locator` and identified by `content_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub element_type: ElementType,
    pub id: String,
    pub display_name: String,
    pub version: Option<String>,
    pub source: Source,
    pub content_hash: String,
    /// Relative file path (local and remote portfolio) or catalog path (collection).
    pub locator: String,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Per-file change marker reported by the remote (e.g. a blob id).
    #[serde(default)]
    pub change_marker: Option<String>,
}

impl IndexEntry {
    pub fn key(&self) -> ElementKey {
        ElementKey::new(self.element_type, self.id.clone())
    }

    /// Rough resident size in bytes, used for the cache byte budget.
    pub fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.id.len()
            + self.display_name.len()
            + self.version.as_ref().map_or(0, String::len)
            + self.content_hash.len()
            + self.locator.len()
            + self.tags.iter().map(|t| t.len() + 24).sum::<usize>()
            + self.description.len()
            + self.change_marker.as_ref().map_or(0, String::len)
    }
}

/// Compute the content-addressed digest of an element body: its git blob id,
/// `sha1("blob {len}\0" ++ body)` in lowercase hex.
///
/// Git hosts report this id in directory listings and tree reads, so a remote
/// element's hash is known without downloading its body. Local bodies and
/// collection entries are hashed the same way.
pub fn content_hash(body: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", body.len()).as_bytes());
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// Derive an element id from its locator: `skills/code-review.md` → `code-review`.
pub fn id_from_locator(locator: &str) -> String {
    let file = locator.rsplit('/').next().unwrap_or(locator);
    match file.rsplit_once('.') {
        Some((stem, ext)) if ELEMENT_EXTENSIONS.contains(&ext) && !stem.is_empty() => {
            stem.to_string()
        }
        _ => file.to_string(),
    }
}

/// The element type of a locator naming an element file directly inside a
/// type directory, e.g. `skills/code-review.md`. Nested paths such as
/// `memories/2025-09-19/notes.yaml` are not elements.
pub fn element_type_of_locator(locator: &str) -> Option<ElementType> {
    let (dir, file) = locator.split_once('/')?;
    if file.contains('/') || !is_element_file(file) {
        return None;
    }
    ElementType::from_dir_name(dir)
}

/// Returns `true` when the file name carries an element extension.
pub fn is_element_file(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    name.rsplit_once('.')
        .map(|(_, ext)| ELEMENT_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Sort order for unified search results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Relevance,
    Name,
    Version,
    Source,
}

impl FromStr for SortBy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "relevance" => Ok(SortBy::Relevance),
            "name" => Ok(SortBy::Name),
            "version" => Ok(SortBy::Version),
            "source" => Ok(SortBy::Source),
            other => Err(EngineError::Config(format!(
                "unknown sort order: '{}'. Use relevance, name, version, or source.",
                other
            ))),
        }
    }
}

/// A unified search request.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    /// Restrict to these sources; `None` means all configured sources.
    pub sources: Option<Vec<Source>>,
    /// Restrict to these element types; `None` means all types.
    pub element_types: Option<Vec<ElementType>>,
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
    pub sort_by: SortBy,
    /// Overall budget for the fan-out; slow sources are reported unavailable.
    pub deadline: Option<std::time::Duration>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sources: None,
            element_types: None,
            page: 1,
            page_size: 20,
            sort_by: SortBy::Relevance,
            deadline: None,
        }
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_types(mut self, types: Vec<ElementType>) -> Self {
        self.element_types = Some(types);
        self
    }

    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    pub fn with_sort(mut self, sort_by: SortBy) -> Self {
        self.sort_by = sort_by;
        self
    }

    pub fn with_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn wants_source(&self, source: Source) -> bool {
        self.sources.as_ref().map_or(true, |s| s.contains(&source))
    }

    pub fn wants_type(&self, element_type: ElementType) -> bool {
        self.element_types
            .as_ref()
            .map_or(true, |t| t.contains(&element_type))
    }
}

/// How current the data served for one source is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Within its freshness window (or authoritative, for local).
    Fresh,
    /// Served from a cached snapshot past its window; `stale = true` to callers.
    Stale,
    /// No data could be served for this source.
    Unavailable,
    /// Not configured or not requested.
    Skipped,
}

/// Per-source outcome attached to every search result page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub source: Source,
    pub freshness: Freshness,
    pub entries: usize,
    pub message: Option<String>,
}

impl SourceStatus {
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

/// One deduplicated search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// The winning entry; `entry.source` is where the authoritative copy lives.
    pub entry: IndexEntry,
    pub score: f64,
    /// Other sources holding the same `(element_type, id)`.
    pub also_in: Vec<Source>,
    /// `true` when another source holds the same element with different content.
    pub content_differs: bool,
}

/// A deterministic page of results plus per-source status.
#[derive(Debug, Clone, Serialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pages: usize,
    pub sources: Vec<SourceStatus>,
}

impl<T> PagedResult<T> {
    /// `true` if any source was served stale data.
    pub fn stale(&self) -> bool {
        self.sources.iter().any(SourceStatus::is_stale)
    }

    pub fn status(&self, source: Source) -> Option<&SourceStatus> {
        self.sources.iter().find(|s| s.source == source)
    }
}
