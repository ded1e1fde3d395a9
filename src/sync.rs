//! Sync manager: applies comparer decisions to real storage.
//!
//! # Pipeline
//!
//! ```text
//!  local index ──┐
//!                ├─► compare_with_baseline ─► plan ─► execute (bounded) ─► SyncReport
//!  remote (fresh)┘        (pure)             (pure)   per-key locked
//! ```
//!
//! Planning decides one [`Step`] per key from the direction, the mode and
//! the conflict policy. Execution runs steps concurrently up to
//! `max_in_flight`; two steps touching the same `(element_type, id)`, even
//! from different `sync` calls, are serialized by [`KeyLocks`].
//!
//! Every element gets exactly one report entry. A failure on one element
//! never aborts the rest of the batch.
//!
//! # Writes
//!
//! Both uploads and downloads pass the [`ContentValidator`] first. A blocking
//! report (`severity >= high`) turns into a `failed` entry carrying the
//! findings. Uploads send the change marker the plan was made against, so a
//! remote that moved mid-sync answers `409` and the element is reported as a
//! conflict instead of being overwritten.
//!
//! # Deadline
//!
//! The deadline is checked before an element starts and bounds its read
//! phase. Once the write has been issued it runs to completion, so an
//! element is either fully applied or reported `skipped` with
//! `"deadline exceeded"`.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::clock::{deadline_after, Clock};
use crate::error::{EngineError, Result};
use crate::index_local::LocalPortfolioIndex;
use crate::index_remote::RemotePortfolioIndex;
use crate::keylock::KeyLocks;
use crate::models::{content_hash, ElementKey, IndexEntry};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::sync_compare::{
    compare_with_baseline, ComparedElement, ConflictKind, SyncBaseline, SyncClassification,
    SyncMode,
};
use crate::traits::{ContentValidator, LocalStore, SourceIndex};

// ═══════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Push,
    Pull,
    /// Report only; nothing is written.
    Compare,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
            SyncDirection::Compare => "compare",
        })
    }
}

impl FromStr for SyncDirection {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "push" => Ok(SyncDirection::Push),
            "pull" => Ok(SyncDirection::Pull),
            "compare" => Ok(SyncDirection::Compare),
            other => Err(EngineError::Config(format!(
                "unknown sync direction: '{}'. Use push, pull, or compare.",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    All,
    Single(ElementKey),
}

impl SyncScope {
    fn includes(&self, key: &ElementKey) -> bool {
        match self {
            SyncScope::All => true,
            SyncScope::Single(only) => only == key,
        }
    }
}

/// How conflicts are handled when both sides hold different content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Leave both sides untouched and report the conflict.
    #[default]
    Manual,
    /// The side with the later `modified_at` wins; ties stay conflicts.
    NewerWins,
}

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub direction: SyncDirection,
    pub scope: SyncScope,
    pub mode: SyncMode,
    pub dry_run: bool,
    /// Overrides the configured deadline.
    pub deadline: Option<Duration>,
}

impl SyncRequest {
    pub fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            scope: SyncScope::All,
            mode: SyncMode::Additive,
            dry_run: false,
            deadline: None,
        }
    }

    pub fn push() -> Self {
        Self::new(SyncDirection::Push)
    }

    pub fn pull() -> Self {
        Self::new(SyncDirection::Pull)
    }

    pub fn compare() -> Self {
        Self::new(SyncDirection::Compare)
    }

    pub fn with_scope(mut self, scope: SyncScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Report
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Uploaded,
    Downloaded,
    Deleted,
    Skipped,
    Conflict,
    Failed,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncAction::Uploaded => "uploaded",
            SyncAction::Downloaded => "downloaded",
            SyncAction::Deleted => "deleted",
            SyncAction::Skipped => "skipped",
            SyncAction::Conflict => "conflict",
            SyncAction::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReportEntry {
    pub key: ElementKey,
    pub action: SyncAction,
    pub reason: Option<String>,
}

impl SyncReportEntry {
    fn new(key: ElementKey, action: SyncAction, reason: Option<String>) -> Self {
        Self {
            key,
            action,
            reason,
        }
    }

    fn skipped(key: ElementKey, reason: impl Into<String>) -> Self {
        Self::new(key, SyncAction::Skipped, Some(reason.into()))
    }

    fn failed(key: ElementKey, err: &EngineError) -> Self {
        Self::new(key, SyncAction::Failed, Some(err.to_string()))
    }
}

/// Outcome of one sync invocation, one entry per element considered,
/// ordered by key.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub direction: SyncDirection,
    pub mode: SyncMode,
    pub entries: Vec<SyncReportEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn count(&self, action: SyncAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Elements whose transfer or deletion landed.
    pub fn succeeded(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.action,
                    SyncAction::Uploaded | SyncAction::Downloaded | SyncAction::Deleted
                )
            })
            .count()
    }

    pub fn conflicts(&self) -> usize {
        self.count(SyncAction::Conflict)
    }

    pub fn failures(&self) -> usize {
        self.count(SyncAction::Failed)
    }

    pub fn entry(&self, key: &ElementKey) -> Option<&SyncReportEntry> {
        self.entries.iter().find(|e| &e.key == key)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Manager
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub max_in_flight: usize,
    pub conflict_policy: ConflictPolicy,
    pub deadline: Option<Duration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            conflict_policy: ConflictPolicy::Manual,
            deadline: Some(Duration::from_secs(120)),
        }
    }
}

/// What to do with one key.
#[derive(Debug, Clone)]
enum Step {
    Upload {
        local: IndexEntry,
        /// Remote path to write; the remote's own locator when it has one.
        target: String,
        expected_marker: Option<String>,
    },
    Download {
        remote: IndexEntry,
        target: String,
    },
    DeleteLocal {
        local: IndexEntry,
    },
    /// Both sides agree; remember it as the common state.
    Agree {
        content_hash: String,
    },
    Report {
        action: SyncAction,
        reason: String,
    },
}

impl Step {
    fn describe(&self) -> &'static str {
        match self {
            Step::Upload { .. } => "upload",
            Step::Download { .. } => "download",
            Step::DeleteLocal { .. } => "delete locally",
            Step::Agree { .. } | Step::Report { .. } => "do nothing",
        }
    }

    fn writes(&self) -> bool {
        matches!(
            self,
            Step::Upload { .. } | Step::Download { .. } | Step::DeleteLocal { .. }
        )
    }
}

pub struct SyncManager {
    local: Arc<LocalPortfolioIndex>,
    remote: Arc<RemotePortfolioIndex>,
    validator: Arc<dyn ContentValidator>,
    locks: KeyLocks<ElementKey>,
    baseline: Mutex<SyncBaseline>,
    settings: SyncSettings,
    clock: Arc<dyn Clock>,
    progress: Arc<dyn SyncProgressReporter>,
}

impl SyncManager {
    pub fn new(
        local: Arc<LocalPortfolioIndex>,
        remote: Arc<RemotePortfolioIndex>,
        validator: Arc<dyn ContentValidator>,
        settings: SyncSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local,
            remote,
            validator,
            locks: KeyLocks::new(),
            baseline: Mutex::new(SyncBaseline::new()),
            settings,
            clock,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Seed the last-known common state, e.g. from a previous process.
    pub fn with_baseline(self, baseline: SyncBaseline) -> Self {
        *self.baseline.lock() = baseline;
        self
    }

    pub fn baseline(&self) -> SyncBaseline {
        self.baseline.lock().clone()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub async fn push(&self, scope: SyncScope, mode: SyncMode) -> Result<SyncReport> {
        self.sync(&SyncRequest::push().with_scope(scope).with_mode(mode))
            .await
    }

    pub async fn pull(&self, scope: SyncScope, mode: SyncMode) -> Result<SyncReport> {
        self.sync(&SyncRequest::pull().with_scope(scope).with_mode(mode))
            .await
    }

    pub async fn compare(&self, scope: SyncScope, mode: SyncMode) -> Result<SyncReport> {
        self.sync(&SyncRequest::compare().with_scope(scope).with_mode(mode))
            .await
    }

    /// Run one sync invocation.
    ///
    /// Fails only when the remote snapshot cannot be taken; everything after
    /// that is reported per element.
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncReport> {
        let started_at = self.clock.utc_now();
        let deadline = request
            .deadline
            .or(self.settings.deadline)
            .and_then(deadline_after);
        let direction = request.direction;

        self.progress
            .report(SyncProgressEvent::Snapshotting { direction });
        let remote_entries = within(deadline, self.remote.fresh_entries()).await?;
        let local_entries = self.local.entries();

        let local: Vec<IndexEntry> = local_entries
            .iter()
            .filter(|e| request.scope.includes(&e.key()))
            .cloned()
            .collect();
        let remote: Vec<IndexEntry> = remote_entries
            .iter()
            .filter(|e| request.scope.includes(&e.key()))
            .cloned()
            .collect();

        let comparison = {
            let baseline = self.baseline.lock();
            compare_with_baseline(&local, &remote, request.mode, Some(&*baseline))
        };

        let mut plan: Vec<(ElementKey, Step)> = comparison
            .elements
            .into_values()
            .map(|element| {
                let step = self.plan(request, &element);
                (element.key, step)
            })
            .collect();
        if let SyncScope::Single(key) = &request.scope {
            if plan.is_empty() {
                plan.push((
                    key.clone(),
                    Step::Report {
                        action: SyncAction::Skipped,
                        reason: "not present in either source".to_string(),
                    },
                ));
            }
        }

        tracing::info!(
            direction = %direction,
            mode = ?request.mode,
            dry_run = request.dry_run,
            elements = plan.len(),
            "sync planned"
        );

        let total = plan.len() as u64;
        let done = AtomicU64::new(0);
        let done = &done;
        let mut entries: Vec<SyncReportEntry> = stream::iter(plan)
            .map(|(key, step)| async move {
                let entry = self.execute(key, step, deadline).await;
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                self.progress.report(SyncProgressEvent::Applying {
                    direction,
                    n,
                    total,
                    last: entry.action,
                });
                entry
            })
            .buffer_unordered(self.settings.max_in_flight.max(1))
            .collect()
            .await;
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let report = SyncReport {
            direction,
            mode: request.mode,
            entries,
            started_at,
            finished_at: self.clock.utc_now(),
        };

        if report.count(SyncAction::Uploaded) > 0 {
            // Next reader sees our own writes.
            if let Err(e) = self.remote.invalidate().await {
                tracing::warn!(error = %e, "failed to invalidate remote index after push");
            }
        }

        self.progress.report(SyncProgressEvent::Finished {
            direction,
            succeeded: report.succeeded() as u64,
            conflicts: report.conflicts() as u64,
            failures: report.failures() as u64,
        });
        Ok(report)
    }

    fn plan(&self, request: &SyncRequest, element: &ComparedElement) -> Step {
        let classification = element.classification;
        let step = match (request.direction, classification, &element.local, &element.remote) {
            (SyncDirection::Compare, SyncClassification::Conflict(_), _, _) => Step::Report {
                action: SyncAction::Conflict,
                reason: classification.to_string(),
            },
            (SyncDirection::Compare, _, _, _) => Step::Report {
                action: SyncAction::Skipped,
                reason: classification.to_string(),
            },

            (_, SyncClassification::Unchanged, Some(local), _) => Step::Agree {
                content_hash: local.content_hash.clone(),
            },

            (SyncDirection::Push, SyncClassification::LocalOnly, Some(local), _) => Step::Upload {
                local: local.clone(),
                target: local.locator.clone(),
                expected_marker: None,
            },
            (SyncDirection::Push, SyncClassification::RemoteOnly, _, _) => Step::Report {
                action: SyncAction::Skipped,
                reason: match request.mode {
                    SyncMode::Additive => "remote-only".to_string(),
                    SyncMode::Mirror => "remote-only; remote copies are never deleted".to_string(),
                },
            },

            (SyncDirection::Pull, SyncClassification::RemoteOnly, _, Some(remote)) => {
                Step::Download {
                    remote: remote.clone(),
                    target: remote.locator.clone(),
                }
            }
            (SyncDirection::Pull, SyncClassification::LocalOnly, Some(local), _) => {
                match request.mode {
                    SyncMode::Additive => Step::Report {
                        action: SyncAction::Skipped,
                        reason: "local-only".to_string(),
                    },
                    SyncMode::Mirror => Step::DeleteLocal {
                        local: local.clone(),
                    },
                }
            }

            (direction, SyncClassification::Conflict(kind), Some(local), Some(remote)) => {
                self.resolve(direction, kind, local, remote)
            }

            _ => Step::Report {
                action: SyncAction::Skipped,
                reason: classification.to_string(),
            },
        };

        if request.dry_run {
            if step.writes() {
                return Step::Report {
                    action: SyncAction::Skipped,
                    reason: format!("dry run: would {}", step.describe()),
                };
            }
            // Agreement is still reported, but a dry run leaves the baseline alone.
            if let Step::Agree { .. } = step {
                return Step::Report {
                    action: SyncAction::Skipped,
                    reason: "unchanged".to_string(),
                };
            }
        }
        step
    }

    fn resolve(
        &self,
        direction: SyncDirection,
        kind: ConflictKind,
        local: &IndexEntry,
        remote: &IndexEntry,
    ) -> Step {
        let unresolved = || Step::Report {
            action: SyncAction::Conflict,
            reason: EngineError::ConflictUnresolved(
                SyncClassification::Conflict(kind).to_string(),
            )
            .to_string(),
        };
        if self.settings.conflict_policy == ConflictPolicy::Manual {
            return unresolved();
        }

        let local_wins = match kind {
            ConflictKind::LocalNewer => true,
            ConflictKind::RemoteNewer => false,
            ConflictKind::Diverged => match local.modified_at.cmp(&remote.modified_at) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => return unresolved(),
            },
        };

        match (direction, local_wins) {
            (SyncDirection::Push, true) => Step::Upload {
                local: local.clone(),
                target: remote.locator.clone(),
                expected_marker: remote.change_marker.clone(),
            },
            (SyncDirection::Pull, false) => Step::Download {
                remote: remote.clone(),
                target: local.locator.clone(),
            },
            (SyncDirection::Push, false) => Step::Report {
                action: SyncAction::Skipped,
                reason: "remote is newer".to_string(),
            },
            (SyncDirection::Pull, true) => Step::Report {
                action: SyncAction::Skipped,
                reason: "local is newer".to_string(),
            },
            (SyncDirection::Compare, _) => unresolved(),
        }
    }

    async fn execute(&self, key: ElementKey, step: Step, deadline: Option<Instant>) -> SyncReportEntry {
        let entry = match step {
            Step::Report { action, reason } => SyncReportEntry::new(key, action, Some(reason)),
            Step::Agree { content_hash } => {
                self.baseline
                    .lock()
                    .record(key.clone(), content_hash, self.clock.utc_now());
                SyncReportEntry::skipped(key, "unchanged")
            }
            Step::Upload {
                local,
                target,
                expected_marker,
            } => {
                self.upload(key, &local, &target, expected_marker.as_deref(), deadline)
                    .await
            }
            Step::Download { remote, target } => self.download(key, &remote, &target, deadline).await,
            Step::DeleteLocal { local } => self.delete_local(key, &local, deadline).await,
        };

        match entry.action {
            SyncAction::Failed => {
                tracing::warn!(key = %entry.key, reason = ?entry.reason, "sync element failed")
            }
            SyncAction::Conflict => {
                tracing::info!(key = %entry.key, reason = ?entry.reason, "sync conflict")
            }
            action => tracing::debug!(key = %entry.key, action = %action, "sync element"),
        }
        entry
    }

    async fn upload(
        &self,
        key: ElementKey,
        local: &IndexEntry,
        target: &str,
        expected_marker: Option<&str>,
        deadline: Option<Instant>,
    ) -> SyncReportEntry {
        let _guard = self.locks.lock(key.clone()).await;
        if expired(deadline) {
            return SyncReportEntry::skipped(key, "deadline exceeded");
        }

        let content = match within(deadline, self.local.store().read(&local.locator)).await {
            Ok(content) => content,
            Err(EngineError::DeadlineExceeded) => {
                return SyncReportEntry::skipped(key, "deadline exceeded")
            }
            Err(e) => return SyncReportEntry::failed(key, &e),
        };
        if let Some(rejected) = self.check(&key, &content, deadline).await {
            return rejected;
        }

        let hash = content_hash(&content);
        match self.remote.put(target, &content, expected_marker).await {
            Ok(_marker) => {
                self.baseline
                    .lock()
                    .record(key.clone(), hash, self.clock.utc_now());
                SyncReportEntry::new(key, SyncAction::Uploaded, None)
            }
            Err(EngineError::Conflict(_)) => SyncReportEntry::new(
                key,
                SyncAction::Conflict,
                Some(format!(
                    "remote changed during sync ({})",
                    SyncClassification::Conflict(ConflictKind::Diverged)
                )),
            ),
            Err(e) => SyncReportEntry::failed(key, &e),
        }
    }

    async fn download(
        &self,
        key: ElementKey,
        remote: &IndexEntry,
        target: &str,
        deadline: Option<Instant>,
    ) -> SyncReportEntry {
        let _guard = self.locks.lock(key.clone()).await;
        if expired(deadline) {
            return SyncReportEntry::skipped(key, "deadline exceeded");
        }

        let content = match within(deadline, self.remote.get_content(&remote.locator)).await {
            Ok(content) => content,
            Err(EngineError::DeadlineExceeded) => {
                return SyncReportEntry::skipped(key, "deadline exceeded")
            }
            Err(e) => return SyncReportEntry::failed(key, &e),
        };
        if let Some(rejected) = self.check(&key, &content, deadline).await {
            return rejected;
        }

        let written = match self.local.store().write(target, &content).await {
            Ok(file) => file,
            Err(e) => return SyncReportEntry::failed(key, &e),
        };
        if let Err(e) = self
            .local
            .apply_write(target, &content, written.modified_at)
        {
            return SyncReportEntry::failed(key, &e);
        }
        self.baseline
            .lock()
            .record(key.clone(), content_hash(&content), self.clock.utc_now());
        SyncReportEntry::new(key, SyncAction::Downloaded, None)
    }

    async fn delete_local(
        &self,
        key: ElementKey,
        local: &IndexEntry,
        deadline: Option<Instant>,
    ) -> SyncReportEntry {
        let _guard = self.locks.lock(key.clone()).await;
        if expired(deadline) {
            return SyncReportEntry::skipped(key, "deadline exceeded");
        }
        if let Err(e) = self.local.store().delete(&local.locator).await {
            return SyncReportEntry::failed(key, &e);
        }
        self.local.remove(&key);
        self.baseline.lock().forget(&key);
        SyncReportEntry::new(
            key,
            SyncAction::Deleted,
            Some("mirror: not present remotely".to_string()),
        )
    }

    /// Run the validator; `Some` is the report entry for a refused payload.
    async fn check(
        &self,
        key: &ElementKey,
        content: &[u8],
        deadline: Option<Instant>,
    ) -> Option<SyncReportEntry> {
        match within(deadline, self.validator.validate(key.element_type, content)).await {
            Ok(report) if report.is_blocking() => Some(SyncReportEntry::failed(
                key.clone(),
                &EngineError::ContentRejected(report.summary()),
            )),
            Ok(_) => None,
            Err(EngineError::DeadlineExceeded) => {
                Some(SyncReportEntry::skipped(key.clone(), "deadline exceeded"))
            }
            Err(e) => Some(SyncReportEntry::failed(key.clone(), &e)),
        }
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|at| Instant::now() >= at)
}

async fn within<T, F>(deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await?,
        None => fut.await,
    }
}
