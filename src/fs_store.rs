//! Filesystem-backed [`LocalStore`].
//!
//! Elements live directly under `<root>/<type dir>/`, e.g.
//! `<root>/skills/code-review.md`. Subdirectories of a type directory are not
//! listed.
//! Locators are root-relative paths with `/` separators. Writes land in a
//! temporary sibling file first and are renamed into place, so readers see
//! either the old or the new content, never a torn file.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{EngineError, Result};
use crate::models::{is_element_file, ElementType};
use crate::traits::{LocalFile, LocalStore};

pub struct FsLocalStore {
    root: PathBuf,
    excludes: Option<GlobSet>,
}

impl FsLocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excludes: None,
        }
    }

    /// Skip root-relative paths matching any of `patterns`.
    pub fn with_excludes(root: impl Into<PathBuf>, patterns: &[String]) -> anyhow::Result<Self> {
        let excludes = if patterns.is_empty() {
            None
        } else {
            Some(build_globset(patterns)?)
        };
        Ok(Self {
            root: root.into(),
            excludes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, locator: &str) -> Result<PathBuf> {
        let rel = Path::new(locator);
        let safe = !locator.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(EngineError::Io(format!("invalid locator '{}'", locator)));
        }
        Ok(self.root.join(rel))
    }
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid exclude glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

fn walk_type_dir(
    root: &Path,
    element_type: ElementType,
    excludes: Option<&GlobSet>,
) -> anyhow::Result<Vec<LocalFile>> {
    let dir = root.join(element_type.dir_name());
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&dir).max_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !is_element_file(&name) {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let locator = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if excludes.is_some_and(|set| set.is_match(&locator)) {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        files.push(LocalFile {
            locator,
            modified_at: modified_time(&metadata),
        });
    }

    files.sort_by(|a, b| a.locator.cmp(&b.locator));
    Ok(files)
}

fn modified_time(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default()
}

#[async_trait]
impl LocalStore for FsLocalStore {
    async fn list(&self, element_type: ElementType) -> Result<Vec<LocalFile>> {
        let root = self.root.clone();
        let excludes = self.excludes.clone();
        tokio::task::spawn_blocking(move || walk_type_dir(&root, element_type, excludes.as_ref()))
            .await
            .map_err(|e| EngineError::Io(format!("scan task failed: {}", e)))?
            .map_err(|e| EngineError::Io(format!("{:#}", e)))
    }

    async fn stat(&self, locator: &str) -> Result<Option<LocalFile>> {
        let path = self.resolve(locator)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(LocalFile {
                locator: locator.to_string(),
                modified_at: modified_time(&metadata),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, locator: &str) -> Result<Vec<u8>> {
        let path = self.resolve(locator)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn write(&self, locator: &str, content: &[u8]) -> Result<LocalFile> {
        let path = self.resolve(locator)?;
        let parent = path
            .parent()
            .ok_or_else(|| EngineError::Io(format!("invalid locator '{}'", locator)))?;
        tokio::fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&tmp, content).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let metadata = tokio::fs::metadata(&path).await?;
        tracing::debug!(locator, bytes = content.len(), "element written");
        Ok(LocalFile {
            locator: locator.to_string(),
            modified_at: modified_time(&metadata),
        })
    }

    async fn delete(&self, locator: &str) -> Result<()> {
        let path = self.resolve(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
