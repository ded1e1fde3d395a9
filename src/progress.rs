//! Sync progress reporting.
//!
//! The sync manager emits one event when it starts taking snapshots, one per
//! completed element, and one when the report is final. Reporters decide
//! where those go; the library default logs them through `tracing` so hosts
//! that install a subscriber see progress without extra wiring.

use crate::sync::{SyncAction, SyncDirection};

/// A single progress event for one sync invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// Local and remote snapshots are being taken. Total unknown.
    Snapshotting { direction: SyncDirection },
    /// `n` of `total` planned elements have an outcome.
    Applying {
        direction: SyncDirection,
        n: u64,
        total: u64,
        last: SyncAction,
    },
    Finished {
        direction: SyncDirection,
        succeeded: u64,
        conflicts: u64,
        failures: u64,
    },
}

/// Receives sync progress. Called from the sync pipeline, possibly from
/// several tasks at once.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Logs progress as structured `tracing` events.
pub struct TracingProgress;

impl SyncProgressReporter for TracingProgress {
    fn report(&self, event: SyncProgressEvent) {
        match event {
            SyncProgressEvent::Snapshotting { direction } => {
                tracing::info!(direction = %direction, "sync snapshotting");
            }
            SyncProgressEvent::Applying {
                direction,
                n,
                total,
                last,
            } => {
                tracing::debug!(
                    direction = %direction,
                    action = %last,
                    "sync applying {} / {} elements",
                    format_number(n),
                    format_number(total)
                );
            }
            SyncProgressEvent::Finished {
                direction,
                succeeded,
                conflicts,
                failures,
            } => {
                tracing::info!(
                    direction = %direction,
                    succeeded,
                    conflicts,
                    failures,
                    "sync finished"
                );
            }
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}
