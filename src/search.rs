//! Unified search across local, remote-portfolio, and collection sources.
//!
//! # Pipeline
//!
//! 1. **Fan out.** The local snapshot is taken first (in memory, authoritative),
//!    then remote portfolio and collection concurrently. Each source answers
//!    from its own cache and circuit breaker; a source that cannot answer in
//!    time or at all is reported `unavailable` and the search continues.
//! 2. **Filter and score.** Entries are filtered by element type and matched
//!    against the query terms.
//! 3. **Deduplicate.** Entries sharing `(element_type, id)` collapse onto the
//!    copy from the highest-priority source ([`SourcePriority`], default
//!    local > remote-portfolio > collection); the other sources are kept as
//!    provenance. Entries with identical `(element_type, content_hash)` under
//!    different ids collapse the same way.
//! 4. **Sort and paginate** with a total tie-break, so equal inputs always
//!    produce the same pages.
//!
//! # Scoring
//!
//! The query is split into lowercase terms; every term must match somewhere.
//! Per term: id or name match 3, tag match 2, description match 1. An exact
//! name match on the whole query adds 5. An empty query matches everything
//! with score 1.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::clock::deadline_after;
use crate::error::{EngineError, Result};
use crate::models::{
    ElementKey, ElementType, Freshness, IndexEntry, PagedResult, SearchHit, SearchQuery, SortBy,
    Source, SourceStatus,
};
use crate::traits::{SourceIndex, SourceSnapshot};

// ═══════════════════════════════════════════════════════════════════════
// Source priority
// ═══════════════════════════════════════════════════════════════════════

/// Order in which sources win a deduplication tie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePriority(Vec<Source>);

impl Default for SourcePriority {
    fn default() -> Self {
        Self(vec![Source::Local, Source::RemotePortfolio, Source::Collection])
    }
}

impl SourcePriority {
    /// `order` must name every source exactly once.
    pub fn new(order: Vec<Source>) -> Result<Self> {
        let complete = order.len() == Source::ALL.len()
            && Source::ALL.iter().all(|s| order.contains(s));
        if !complete {
            return Err(EngineError::Config(format!(
                "source priority must list each of local, remote-portfolio, collection exactly once, got {:?}",
                order.iter().map(Source::as_str).collect::<Vec<_>>()
            )));
        }
        Ok(Self(order))
    }

    /// Lower is preferred.
    pub fn rank(&self, source: Source) -> usize {
        self.0
            .iter()
            .position(|s| *s == source)
            .unwrap_or(self.0.len())
    }

    pub fn order(&self) -> &[Source] {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub priority: SourcePriority,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
            priority: SourcePriority::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Manager
// ═══════════════════════════════════════════════════════════════════════

pub struct UnifiedIndexManager {
    local: Option<Arc<dyn SourceIndex>>,
    remote: Option<Arc<dyn SourceIndex>>,
    collection: Option<Arc<dyn SourceIndex>>,
    settings: SearchSettings,
}

/// One source's contribution after filtering.
struct Contribution {
    status: SourceStatus,
    matches: Vec<(IndexEntry, f64)>,
}

impl UnifiedIndexManager {
    pub fn new(settings: SearchSettings) -> Self {
        Self {
            local: None,
            remote: None,
            collection: None,
            settings,
        }
    }

    /// Attach an indexer; it is slotted by its [`SourceIndex::source`].
    pub fn with_source(mut self, index: Arc<dyn SourceIndex>) -> Self {
        match index.source() {
            Source::Local => self.local = Some(index),
            Source::RemotePortfolio => self.remote = Some(index),
            Source::Collection => self.collection = Some(index),
        }
        self
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn index(&self, source: Source) -> Option<&Arc<dyn SourceIndex>> {
        match source {
            Source::Local => self.local.as_ref(),
            Source::RemotePortfolio => self.remote.as_ref(),
            Source::Collection => self.collection.as_ref(),
        }
    }

    /// Search every requested source and return one deduplicated page.
    ///
    /// Never fails: degraded sources show up in [`PagedResult::sources`].
    pub async fn search(&self, query: &SearchQuery) -> PagedResult<SearchHit> {
        let started = std::time::Instant::now();
        let terms = query_terms(&query.text);
        let deadline = query.deadline.and_then(deadline_after);

        let local = self
            .contribute(Source::Local, query, &terms, deadline)
            .await;
        let (remote, collection) = tokio::join!(
            self.contribute(Source::RemotePortfolio, query, &terms, deadline),
            self.contribute(Source::Collection, query, &terms, deadline),
        );

        let mut sources = Vec::with_capacity(3);
        let mut candidates = Vec::new();
        for contribution in [local, remote, collection] {
            sources.push(contribution.status);
            candidates.extend(contribution.matches);
        }

        let mut hits = merge(candidates, &self.settings.priority);
        sort_hits(&mut hits, query.sort_by, &self.settings.priority);
        let page = paginate(hits, query, &self.settings, sources);

        tracing::debug!(
            query = %query.text,
            total = page.total,
            page = page.page,
            stale = page.stale(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "unified search"
        );
        page
    }

    fn contribute<'a>(
        &'a self,
        source: Source,
        query: &'a SearchQuery,
        terms: &'a [String],
        deadline: Option<tokio::time::Instant>,
    ) -> BoxFuture<'a, Contribution> {
        async move {
            let skipped = |message: &str| Contribution {
                status: SourceStatus {
                    source,
                    freshness: Freshness::Skipped,
                    entries: 0,
                    message: Some(message.to_string()),
                },
                matches: Vec::new(),
            };

            if !query.wants_source(source) {
                return skipped("not requested");
            }
            let Some(index) = self.index(source) else {
                return skipped("not configured");
            };

            let snapshot = match deadline {
                Some(at) => match tokio::time::timeout_at(at, index.snapshot()).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::DeadlineExceeded),
                },
                None => index.snapshot().await,
            };

            match snapshot {
                Ok(snapshot) => filter_snapshot(&snapshot, query, terms),
                Err(err) => {
                    tracing::warn!(source = %source, error = %err, "source unavailable for search");
                    Contribution {
                        status: SourceStatus {
                            source,
                            freshness: Freshness::Unavailable,
                            entries: 0,
                            message: Some(err.to_string()),
                        },
                        matches: Vec::new(),
                    }
                }
            }
        }
        .boxed()
    }
}

fn filter_snapshot(snapshot: &SourceSnapshot, query: &SearchQuery, terms: &[String]) -> Contribution {
    let matches: Vec<(IndexEntry, f64)> = snapshot
        .entries
        .iter()
        .filter(|e| query.wants_type(e.element_type))
        .filter_map(|e| score(e, &query.text, terms).map(|s| (e.clone(), s)))
        .collect();
    Contribution {
        status: SourceStatus {
            source: snapshot.source,
            freshness: snapshot.freshness,
            entries: matches.len(),
            message: snapshot.message.clone(),
        },
        matches,
    }
}

fn query_terms(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| t.to_lowercase())
        .collect()
}

/// Relevance of `entry` for `terms`, or `None` if some term matches nothing.
pub fn score(entry: &IndexEntry, raw_query: &str, terms: &[String]) -> Option<f64> {
    if terms.is_empty() {
        return Some(1.0);
    }

    let id = entry.id.to_lowercase();
    let name = entry.display_name.to_lowercase();
    let description = entry.description.to_lowercase();
    let tags: Vec<String> = entry.tags.iter().map(|t| t.to_lowercase()).collect();

    let mut total = 0.0;
    for term in terms {
        let mut term_score = 0.0;
        if id.contains(term.as_str()) || name.contains(term.as_str()) {
            term_score += 3.0;
        }
        if tags.iter().any(|t| t.contains(term.as_str())) {
            term_score += 2.0;
        }
        if description.contains(term.as_str()) {
            term_score += 1.0;
        }
        if term_score == 0.0 {
            return None;
        }
        total += term_score;
    }

    let whole = raw_query.trim().to_lowercase();
    if name == whole || id == whole {
        total += 5.0;
    }
    Some(total)
}

/// Collapse duplicates onto their highest-priority copy.
fn merge(candidates: Vec<(IndexEntry, f64)>, priority: &SourcePriority) -> Vec<SearchHit> {
    let mut by_key: BTreeMap<ElementKey, Vec<(IndexEntry, f64)>> = BTreeMap::new();
    for (entry, score) in candidates {
        by_key.entry(entry.key()).or_default().push((entry, score));
    }

    let mut hits: Vec<SearchHit> = Vec::with_capacity(by_key.len());
    for (_, mut group) in by_key {
        group.sort_by_key(|(e, _)| priority.rank(e.source));
        let best_score = group
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::MIN, f64::max);
        let mut rest = group.into_iter();
        let Some((winner, _)) = rest.next() else {
            continue;
        };
        let mut also_in = Vec::new();
        let mut content_differs = false;
        for (other, _) in rest {
            content_differs |= other.content_hash != winner.content_hash;
            if !also_in.contains(&other.source) {
                also_in.push(other.source);
            }
        }
        hits.push(SearchHit {
            entry: winner,
            score: best_score,
            also_in,
            content_differs,
        });
    }

    // Same content under different ids: keep the preferred copy.
    hits.sort_by(|a, b| {
        priority
            .rank(a.entry.source)
            .cmp(&priority.rank(b.entry.source))
            .then_with(|| a.entry.key().cmp(&b.entry.key()))
    });
    let mut by_content: HashMap<(ElementType, String), usize> = HashMap::new();
    let mut merged: Vec<SearchHit> = Vec::with_capacity(hits.len());
    for hit in hits {
        let content_key = (hit.entry.element_type, hit.entry.content_hash.clone());
        match by_content.get(&content_key) {
            Some(&i) => {
                let kept = &mut merged[i];
                kept.score = kept.score.max(hit.score);
                for source in std::iter::once(hit.entry.source).chain(hit.also_in) {
                    if source != kept.entry.source && !kept.also_in.contains(&source) {
                        kept.also_in.push(source);
                    }
                }
                kept.content_differs |= hit.content_differs;
            }
            None => {
                by_content.insert(content_key, merged.len());
                merged.push(hit);
            }
        }
    }
    for hit in &mut merged {
        hit.also_in.sort_by_key(|s| priority.rank(*s));
    }
    merged
}

fn sort_hits(hits: &mut [SearchHit], sort_by: SortBy, priority: &SourcePriority) {
    hits.sort_by(|a, b| {
        let primary = match sort_by {
            SortBy::Relevance => b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal),
            SortBy::Name => a
                .entry
                .display_name
                .to_lowercase()
                .cmp(&b.entry.display_name.to_lowercase()),
            SortBy::Version => compare_versions(b.entry.version.as_deref(), a.entry.version.as_deref()),
            SortBy::Source => priority
                .rank(a.entry.source)
                .cmp(&priority.rank(b.entry.source)),
        };
        primary
            .then_with(|| a.entry.key().cmp(&b.entry.key()))
            .then_with(|| priority.rank(a.entry.source).cmp(&priority.rank(b.entry.source)))
    });
}

/// Compare dotted versions numerically where possible; missing versions sort lowest.
fn compare_versions(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let parts = |v: &str| -> Vec<String> {
                v.trim_start_matches(['v', 'V'])
                    .split(['.', '-', '+'])
                    .map(String::from)
                    .collect()
            };
            let (pa, pb) = (parts(a), parts(b));
            for i in 0..pa.len().max(pb.len()) {
                let ord = match (pa.get(i), pb.get(i)) {
                    (Some(x), Some(y)) => match (x.parse::<u64>(), y.parse::<u64>()) {
                        (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                        _ => x.cmp(y),
                    },
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
    }
}

fn paginate(
    hits: Vec<SearchHit>,
    query: &SearchQuery,
    settings: &SearchSettings,
    sources: Vec<SourceStatus>,
) -> PagedResult<SearchHit> {
    let page_size = match query.page_size {
        0 => settings.default_page_size,
        n => n,
    }
    .clamp(1, settings.max_page_size.max(1));
    let page = query.page.max(1);
    let total = hits.len();
    let total_pages = total.div_ceil(page_size);

    let items = hits
        .into_iter()
        .skip((page - 1).saturating_mul(page_size))
        .take(page_size)
        .collect();

    PagedResult {
        items,
        page,
        page_size,
        total,
        total_pages,
        sources,
    }
}
