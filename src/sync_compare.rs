//! Pure diff between a local and a remote snapshot.
//!
//! [`compare`] classifies every `(element_type, id)` present on either side.
//! It performs no I/O and holds no state: identical inputs always yield an
//! identical [`Comparison`] (a `BTreeMap`, so iteration order is fixed too).
//!
//! Conflicts are sub-classified with the help of an optional
//! [`SyncBaseline`], the content hash both sides agreed on at the last
//! successful sync. With a baseline, "which side moved" is decided by hash;
//! without one, `modified_at` is the only signal and equal timestamps count
//! as `diverged`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::models::{ElementKey, IndexEntry};

/// What the sync manager may do with one-sided entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Never delete anything.
    #[default]
    Additive,
    /// The remote is the source of truth; local-only entries may be deleted on pull.
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    LocalNewer,
    RemoteNewer,
    Diverged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "kind")]
pub enum SyncClassification {
    Unchanged,
    LocalOnly,
    RemoteOnly,
    Conflict(ConflictKind),
}

impl fmt::Display for SyncClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncClassification::Unchanged => f.write_str("unchanged"),
            SyncClassification::LocalOnly => f.write_str("local-only"),
            SyncClassification::RemoteOnly => f.write_str("remote-only"),
            SyncClassification::Conflict(ConflictKind::LocalNewer) => {
                f.write_str("conflict (local newer)")
            }
            SyncClassification::Conflict(ConflictKind::RemoteNewer) => {
                f.write_str("conflict (remote newer)")
            }
            SyncClassification::Conflict(ConflictKind::Diverged) => {
                f.write_str("conflict (diverged)")
            }
        }
    }
}

/// Last state both sides agreed on for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineRecord {
    pub content_hash: String,
    pub synced_at: DateTime<Utc>,
}

/// Per-key common ancestor recorded after each successful transfer.
#[derive(Debug, Clone, Default)]
pub struct SyncBaseline {
    records: HashMap<ElementKey, BaselineRecord>,
}

impl SyncBaseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ElementKey) -> Option<&BaselineRecord> {
        self.records.get(key)
    }

    pub fn record(&mut self, key: ElementKey, content_hash: impl Into<String>, at: DateTime<Utc>) {
        self.records.insert(
            key,
            BaselineRecord {
                content_hash: content_hash.into(),
                synced_at: at,
            },
        );
    }

    pub fn forget(&mut self, key: &ElementKey) {
        self.records.remove(key);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One key's classification plus the entries it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparedElement {
    pub key: ElementKey,
    pub classification: SyncClassification,
    pub local: Option<IndexEntry>,
    pub remote: Option<IndexEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub mode: SyncMode,
    pub elements: BTreeMap<ElementKey, ComparedElement>,
}

impl Comparison {
    pub fn classifications(&self) -> BTreeMap<ElementKey, SyncClassification> {
        self.elements
            .iter()
            .map(|(k, e)| (k.clone(), e.classification))
            .collect()
    }

    pub fn get(&self, key: &ElementKey) -> Option<SyncClassification> {
        self.elements.get(key).map(|e| e.classification)
    }

    pub fn count(&self, classification: SyncClassification) -> usize {
        self.elements
            .values()
            .filter(|e| e.classification == classification)
            .count()
    }

    pub fn conflicts(&self) -> usize {
        self.elements
            .values()
            .filter(|e| matches!(e.classification, SyncClassification::Conflict(_)))
            .count()
    }
}

/// Classify without a baseline.
pub fn compare(local: &[IndexEntry], remote: &[IndexEntry], mode: SyncMode) -> Comparison {
    compare_with_baseline(local, remote, mode, None)
}

pub fn compare_with_baseline(
    local: &[IndexEntry],
    remote: &[IndexEntry],
    mode: SyncMode,
    baseline: Option<&SyncBaseline>,
) -> Comparison {
    let mut sides: BTreeMap<ElementKey, (Option<&IndexEntry>, Option<&IndexEntry>)> =
        BTreeMap::new();
    for entry in local {
        sides.entry(entry.key()).or_default().0 = Some(entry);
    }
    for entry in remote {
        sides.entry(entry.key()).or_default().1 = Some(entry);
    }

    let elements = sides
        .into_iter()
        .filter_map(|(key, (l, r))| {
            let classification = match (l, r) {
                (Some(_), None) => SyncClassification::LocalOnly,
                (None, Some(_)) => SyncClassification::RemoteOnly,
                (Some(l), Some(r)) if l.content_hash == r.content_hash => {
                    SyncClassification::Unchanged
                }
                (Some(l), Some(r)) => SyncClassification::Conflict(conflict_kind(
                    l,
                    r,
                    baseline.and_then(|b| b.get(&key)),
                )),
                (None, None) => return None,
            };
            let compared = ComparedElement {
                key: key.clone(),
                classification,
                local: l.cloned(),
                remote: r.cloned(),
            };
            Some((key, compared))
        })
        .collect();

    Comparison { mode, elements }
}

fn conflict_kind(
    local: &IndexEntry,
    remote: &IndexEntry,
    base: Option<&BaselineRecord>,
) -> ConflictKind {
    if let Some(base) = base {
        let local_moved = local.content_hash != base.content_hash;
        let remote_moved = remote.content_hash != base.content_hash;
        match (local_moved, remote_moved) {
            (true, false) => return ConflictKind::LocalNewer,
            (false, true) => return ConflictKind::RemoteNewer,
            // Both sides moved away from the last agreed content.
            _ => return ConflictKind::Diverged,
        }
    }
    match local.modified_at.cmp(&remote.modified_at) {
        std::cmp::Ordering::Greater => ConflictKind::LocalNewer,
        std::cmp::Ordering::Less => ConflictKind::RemoteNewer,
        std::cmp::Ordering::Equal => ConflictKind::Diverged,
    }
}
