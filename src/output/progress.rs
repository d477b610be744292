//! Progress notification interface
//!
//! The orchestrator pushes task and quota updates to a [`ProgressSink`]. A
//! sink only observes; it has no handle on the checkpoint store.

use crate::state::QuotaSummary;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Incremental progress of one task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub task_name: String,
    pub total_estimate: u64,
    pub processed_delta: u64,
    pub failed_delta: u64,
    pub skipped_delta: u64,
}

impl ProgressUpdate {
    pub fn processed(task_name: &str, total_estimate: u64) -> Self {
        Self {
            task_name: task_name.to_string(),
            total_estimate,
            processed_delta: 1,
            ..Self::default()
        }
    }

    pub fn failed(task_name: &str, total_estimate: u64) -> Self {
        Self {
            task_name: task_name.to_string(),
            total_estimate,
            failed_delta: 1,
            ..Self::default()
        }
    }

    pub fn skipped(task_name: &str, total_estimate: u64) -> Self {
        Self {
            task_name: task_name.to_string(),
            total_estimate,
            skipped_delta: 1,
            ..Self::default()
        }
    }
}

/// Receiver of progress notifications
pub trait ProgressSink: Send + Sync {
    fn task_started(&self, task_name: &str, total_estimate: u64);

    fn task_progress(&self, update: &ProgressUpdate);

    fn task_finished(&self, task_name: &str, completed: bool);

    fn quota(&self, summary: &QuotaSummary);
}

/// Discards every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn task_started(&self, _task_name: &str, _total_estimate: u64) {}

    fn task_progress(&self, _update: &ProgressUpdate) {}

    fn task_finished(&self, _task_name: &str, _completed: bool) {}

    fn quota(&self, _summary: &QuotaSummary) {}
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    total: u64,
    processed: u64,
    failed: u64,
    skipped: u64,
}

impl Totals {
    fn done(&self) -> u64 {
        self.processed + self.failed + self.skipped
    }
}

/// Renders progress as tracing events
///
/// Running totals are logged at info level every `log_every` units and at
/// task boundaries; individual units go to debug.
#[derive(Debug)]
pub struct LogProgress {
    log_every: u64,
    totals: Mutex<HashMap<String, Totals>>,
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new(100)
    }
}

impl LogProgress {
    pub fn new(log_every: u64) -> Self {
        Self {
            log_every: log_every.max(1),
            totals: Mutex::new(HashMap::new()),
        }
    }
}

impl ProgressSink for LogProgress {
    fn task_started(&self, task_name: &str, total_estimate: u64) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.insert(
            task_name.to_string(),
            Totals {
                total: total_estimate,
                ..Totals::default()
            },
        );
        tracing::info!(task = task_name, total = total_estimate, "Task started");
    }

    fn task_progress(&self, update: &ProgressUpdate) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = totals.entry(update.task_name.clone()).or_default();
        entry.total = entry.total.max(update.total_estimate);
        entry.processed += update.processed_delta;
        entry.failed += update.failed_delta;
        entry.skipped += update.skipped_delta;

        if entry.done() % self.log_every == 0 {
            tracing::info!(
                task = %update.task_name,
                "{}/{} (processed {}, failed {}, skipped {})",
                entry.done(),
                entry.total,
                entry.processed,
                entry.failed,
                entry.skipped
            );
        }
    }

    fn task_finished(&self, task_name: &str, completed: bool) {
        let totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = totals.get(task_name).copied().unwrap_or_default();
        if completed {
            tracing::info!(
                task = task_name,
                processed = entry.processed,
                skipped = entry.skipped,
                "Task completed"
            );
        } else {
            tracing::warn!(
                task = task_name,
                processed = entry.processed,
                failed = entry.failed,
                skipped = entry.skipped,
                "Task left incomplete"
            );
        }
    }

    fn quota(&self, summary: &QuotaSummary) {
        tracing::debug!(
            remaining = summary.remaining,
            limit = summary.limit,
            reset_in = summary.seconds_until_reset,
            conservative = summary.conservative_mode,
            "Quota {:.1}% used",
            summary.usage_percentage
        );
    }
}
