//! Local portfolio index.
//!
//! Scans the local element-type directories once, then tracks local
//! creates, updates, and deletes incrementally. There is no freshness window:
//! the index is authoritative for what exists locally right now.
//!
//! Searches and sync read a sorted listing behind an `Arc`. It is built once
//! per change and shared until the next write, so a snapshot stays
//! consistent while sync applies writes.
//!
//! Only files directly inside a type directory are elements; nested files
//! such as `memories/2025-09-19/notes.yaml` are skipped, as on the remote side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::frontmatter::{build_entry, parse_header, EntryOrigin};
use crate::models::{
    content_hash, element_type_of_locator, id_from_locator, ElementKey, ElementType, Freshness,
    IndexEntry, Source,
};
use crate::traits::{LocalFile, LocalStore, SourceIndex, SourceSnapshot};

/// Files read concurrently during a full scan.
const SCAN_CONCURRENCY: usize = 8;

#[derive(Default)]
struct Published {
    map: BTreeMap<ElementKey, IndexEntry>,
    /// Key-ordered copy of `map`; `None` after a change until next read.
    listing: Option<Arc<Vec<IndexEntry>>>,
}

pub struct LocalPortfolioIndex {
    store: Arc<dyn LocalStore>,
    state: RwLock<Published>,
}

impl LocalPortfolioIndex {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            state: RwLock::new(Published::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Rebuild the whole index from storage and publish it in one swap.
    ///
    /// Unreadable files are logged and skipped; a failed directory listing
    /// fails the scan and leaves the previous index in place.
    pub async fn scan(&self) -> Result<usize> {
        let mut files: Vec<(ElementType, LocalFile)> = Vec::new();
        for element_type in ElementType::ALL {
            for file in self.store.list(element_type).await? {
                if element_type_of_locator(&file.locator) != Some(element_type) {
                    tracing::debug!(locator = %file.locator, "skipping nested local file");
                    continue;
                }
                files.push((element_type, file));
            }
        }

        let built: Vec<IndexEntry> = stream::iter(files)
            .map(|(element_type, file)| async move {
                match self.read_entry(element_type, &file).await {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!(locator = %file.locator, error = %e, "skipping unreadable element");
                        None
                    }
                }
            })
            .buffer_unordered(SCAN_CONCURRENCY)
            .filter_map(|entry| async move { entry })
            .collect()
            .await;

        let mut map: BTreeMap<ElementKey, IndexEntry> = BTreeMap::new();
        for entry in built {
            let key = entry.key();
            // Two files for one id (e.g. `a.md` and `a.yaml`): keep the newer.
            let keep_existing = map
                .get(&key)
                .is_some_and(|existing| existing.modified_at >= entry.modified_at);
            if keep_existing {
                tracing::warn!(key = %key, dropped = %entry.locator, "duplicate local element");
            } else {
                map.insert(key, entry);
            }
        }

        let count = map.len();
        *self.state.write() = Published { map, listing: None };
        tracing::info!(entries = count, "local portfolio scanned");
        Ok(count)
    }

    /// Re-read one file after a local create or update. A file that no
    /// longer exists is removed from the index.
    pub async fn upsert_path(&self, locator: &str) -> Result<Option<IndexEntry>> {
        let element_type = element_type_of(locator)?;
        match self.store.stat(locator).await? {
            Some(file) => {
                let entry = self.read_entry(element_type, &file).await?;
                self.insert(entry.clone());
                Ok(Some(entry))
            }
            None => {
                let key = ElementKey::new(element_type, id_from_locator(locator));
                self.remove(&key);
                Ok(None)
            }
        }
    }

    /// Record a write whose bytes the caller already holds.
    pub fn apply_write(
        &self,
        locator: &str,
        content: &[u8],
        modified_at: DateTime<Utc>,
    ) -> Result<IndexEntry> {
        let element_type = element_type_of(locator)?;
        let entry = entry_from_bytes(element_type, locator, content, modified_at);
        self.insert(entry.clone());
        Ok(entry)
    }

    pub fn remove(&self, key: &ElementKey) -> Option<IndexEntry> {
        let mut state = self.state.write();
        let removed = state.map.remove(key);
        if removed.is_some() {
            state.listing = None;
        }
        removed
    }

    pub fn get(&self, key: &ElementKey) -> Option<IndexEntry> {
        self.state.read().map.get(key).cloned()
    }

    /// Every entry in key order. Repeated calls without an intervening write
    /// return the same allocation.
    pub fn entries(&self) -> Arc<Vec<IndexEntry>> {
        if let Some(listing) = &self.state.read().listing {
            return listing.clone();
        }
        let mut state = self.state.write();
        if let Some(listing) = &state.listing {
            return listing.clone();
        }
        let listing = Arc::new(state.map.values().cloned().collect::<Vec<_>>());
        state.listing = Some(listing.clone());
        listing
    }

    pub fn len(&self) -> usize {
        self.state.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, entry: IndexEntry) {
        let mut state = self.state.write();
        state.map.insert(entry.key(), entry);
        state.listing = None;
    }

    async fn read_entry(&self, element_type: ElementType, file: &LocalFile) -> Result<IndexEntry> {
        let body = self.store.read(&file.locator).await?;
        Ok(entry_from_bytes(
            element_type,
            &file.locator,
            &body,
            file.modified_at,
        ))
    }
}

fn entry_from_bytes(
    element_type: ElementType,
    locator: &str,
    body: &[u8],
    modified_at: DateTime<Utc>,
) -> IndexEntry {
    let text = String::from_utf8_lossy(body);
    build_entry(
        EntryOrigin {
            source: Source::Local,
            element_type,
            locator,
            content_hash: content_hash(body),
            modified_at,
            change_marker: None,
        },
        parse_header(locator, &text),
    )
}

/// `personas/ziggy.md` → `Persona`.
fn element_type_of(locator: &str) -> Result<ElementType> {
    element_type_of_locator(locator).ok_or_else(|| {
        EngineError::NotFound(format!(
            "'{}' is not an element file directly inside a type directory",
            locator
        ))
    })
}

#[async_trait]
impl SourceIndex for LocalPortfolioIndex {
    fn source(&self) -> Source {
        Source::Local
    }

    async fn snapshot(&self) -> Result<SourceSnapshot> {
        Ok(SourceSnapshot {
            source: Source::Local,
            entries: self.entries(),
            freshness: Freshness::Fresh,
            message: None,
        })
    }

    /// Local has no freshness window; invalidating means rescanning.
    async fn invalidate(&self) -> Result<()> {
        self.scan().await.map(|_| ())
    }

    async fn get_content(&self, locator: &str) -> Result<Vec<u8>> {
        self.store.read(locator).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_store::FsLocalStore;

    fn write(root: &std::path::Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn scan_builds_entries_from_headers() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "skills/code-review.md", "---\nname: Code Review\ntags: [review]\n---\nbody");
        write(dir.path(), "personas/ziggy.md", "---\nname: Ziggy\n---\n");
        write(dir.path(), "personas/notes.txt", "ignored");

        let idx = LocalPortfolioIndex::new(Arc::new(FsLocalStore::new(dir.path())));
        assert_eq!(idx.scan().await.unwrap(), 2);

        let skill = idx
            .get(&ElementKey::new(ElementType::Skill, "code-review"))
            .unwrap();
        assert_eq!(skill.display_name, "Code Review");
        assert_eq!(skill.tags, vec!["review"]);
        assert_eq!(skill.source, Source::Local);
        assert_eq!(
            skill.content_hash,
            content_hash(b"---\nname: Code Review\ntags: [review]\n---\nbody")
        );
    }

    #[tokio::test]
    async fn upsert_and_delete_track_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let idx = LocalPortfolioIndex::new(Arc::new(FsLocalStore::new(dir.path())));
        idx.scan().await.unwrap();
        assert!(idx.is_empty());

        write(dir.path(), "agents/builder.yaml", "name: Builder\n");
        let entry = idx.upsert_path("agents/builder.yaml").await.unwrap().unwrap();
        assert_eq!(entry.display_name, "Builder");
        assert_eq!(idx.len(), 1);

        std::fs::remove_file(dir.path().join("agents/builder.yaml")).unwrap();
        assert!(idx.upsert_path("agents/builder.yaml").await.unwrap().is_none());
        assert!(idx.is_empty());
    }

    #[tokio::test]
    async fn snapshots_are_isolated_from_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let idx = LocalPortfolioIndex::new(Arc::new(FsLocalStore::new(dir.path())));
        let before = idx.snapshot().await.unwrap();
        idx.apply_write("skills/a.md", b"---\nname: A\n---\n", Utc::now())
            .unwrap();
        assert!(before.entries.is_empty());
        assert_eq!(idx.snapshot().await.unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_index_shares_one_listing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "skills/a.md", "---\nname: A\n---\n");
        let idx = LocalPortfolioIndex::new(Arc::new(FsLocalStore::new(dir.path())));
        idx.scan().await.unwrap();

        let first = idx.snapshot().await.unwrap();
        let second = idx.snapshot().await.unwrap();
        assert!(Arc::ptr_eq(&first.entries, &second.entries));

        idx.apply_write("skills/b.md", b"---\nname: B\n---\n", Utc::now())
            .unwrap();
        let third = idx.snapshot().await.unwrap();
        assert!(!Arc::ptr_eq(&first.entries, &third.entries));
        assert_eq!(first.entries.len(), 1);
        assert_eq!(third.entries.len(), 2);
    }

    #[tokio::test]
    async fn nested_files_never_become_elements() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "memories/today.yaml", "name: Today\n");
        write(dir.path(), "memories/2025-09-19/today.yaml", "name: Older\n");
        let idx = LocalPortfolioIndex::new(Arc::new(FsLocalStore::new(dir.path())));
        assert_eq!(idx.scan().await.unwrap(), 1);
        let today = idx.get(&ElementKey::new(ElementType::Memory, "today")).unwrap();
        assert_eq!(today.display_name, "Today");
        assert!(idx.upsert_path("memories/2025-09-19/today.yaml").await.is_err());
    }

    #[test]
    fn paths_outside_type_dirs_are_rejected() {
        assert!(element_type_of("misc/a.md").is_err());
        assert!(element_type_of("memories/2025-09-19/notes.yaml").is_err());
        assert_eq!(element_type_of("memories/m.yaml").unwrap(), ElementType::Memory);
    }
}
