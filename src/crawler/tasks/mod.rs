//! Task definitions
//!
//! One task per data category. Bulk tasks fetch a whole paginated collection;
//! fan-out tasks fetch one unit per previously discovered key. Every task
//! skips units whose artifact already exists, which is what makes a resumed
//! run cheap.

mod bulk;
mod commit_detail;
mod pr_dependency;

pub use bulk::BulkTask;
pub use commit_detail::CommitDetailTask;
pub use pr_dependency::PrDependencyTask;

use crate::crawler::{ApiClient, CancellationToken, FetchError};
use crate::output::{ProgressSink, ProgressUpdate};
use crate::state::{Subject, TaskKind};
use crate::storage::{CheckpointStore, OutputLayout};
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Everything a task needs while it runs
#[derive(Clone)]
pub struct TaskContext {
    pub subject: Subject,
    pub client: Arc<ApiClient>,
    pub checkpoint: Arc<CheckpointStore>,
    pub layout: OutputLayout,
    pub progress: Arc<dyn ProgressSink>,
    pub cancel: CancellationToken,
    /// Upper bound on concurrent requests within one batch
    pub max_concurrent: usize,
    /// Units between periodic checkpoint saves
    pub checkpoint_interval: u64,
}

/// A named unit of crawl work
#[async_trait]
pub trait CrawlTask: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Cheap upper-bound guess of the number of units, for progress display
    async fn estimate_size(&self, ctx: &TaskContext) -> u64;

    /// Fetches and persists every outstanding unit
    ///
    /// Per-unit outcomes go through `recorder`. An `Err` means the run as a
    /// whole failed; what was recorded before it stays valid.
    async fn run(&self, ctx: &TaskContext, recorder: &TaskRecorder) -> Result<()>;
}

/// Builds the task for `kind`
pub fn build_task(kind: TaskKind) -> Box<dyn CrawlTask> {
    if let Some(dependency) = kind.dependency_type() {
        return Box::new(PrDependencyTask::new(dependency));
    }
    match kind {
        TaskKind::CommitDetails => Box::new(CommitDetailTask),
        _ => Box::new(BulkTask::new(kind)),
    }
}

/// Counts of one task run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task: TaskKind,
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: bool,
    /// Whether the task was marked completed in the checkpoint
    pub completed: bool,
    pub error: Option<String>,
}

/// Records unit outcomes of one task run
///
/// Each outcome is written to the checkpoint store and pushed to the
/// progress sink. The recorder also keeps this run's own counts, which
/// decide whether the task may be marked completed.
pub struct TaskRecorder {
    kind: TaskKind,
    checkpoint: Arc<CheckpointStore>,
    progress: Arc<dyn ProgressSink>,
    save_interval: u64,
    total: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    since_save: AtomicU64,
    cancelled: AtomicBool,
}

impl TaskRecorder {
    pub fn new(ctx: &TaskContext, kind: TaskKind, total: u64) -> Self {
        Self {
            kind,
            checkpoint: ctx.checkpoint.clone(),
            progress: ctx.progress.clone(),
            save_interval: ctx.checkpoint_interval.max(1),
            total: AtomicU64::new(total),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            since_save: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Replaces the size estimate once the real number of units is known
    pub fn reconcile_total(&self, actual: u64) {
        self.total.store(actual, Ordering::SeqCst);
        self.checkpoint.reconcile_total(self.kind, actual);
    }

    pub fn processed(&self, key: &str) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.since_save.fetch_add(1, Ordering::SeqCst);
        self.checkpoint.record_processed(self.kind, key);
        self.progress
            .task_progress(&ProgressUpdate::processed(self.kind.name(), self.total()));
        tracing::debug!(task = self.kind.name(), key, "Unit processed");
    }

    pub fn failed(&self, key: &str, error: &FetchError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.since_save.fetch_add(1, Ordering::SeqCst);
        self.checkpoint.record_failed(self.kind, key);
        self.progress
            .task_progress(&ProgressUpdate::failed(self.kind.name(), self.total()));
        tracing::warn!(task = self.kind.name(), key, "Unit failed: {}", error);
    }

    pub fn skipped(&self, key: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        self.checkpoint.record_skipped(self.kind, key);
        self.progress
            .task_progress(&ProgressUpdate::skipped(self.kind.name(), self.total()));
        tracing::debug!(task = self.kind.name(), key, "Unit already on disk, skipped");
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Persists the checkpoint once enough units have been recorded
    pub async fn maybe_save(&self) -> Result<()> {
        if self.since_save.load(Ordering::SeqCst) >= self.save_interval {
            self.since_save.store(0, Ordering::SeqCst);
            self.checkpoint.save().await?;
            tracing::debug!(task = self.kind.name(), "Periodic checkpoint saved");
        }
        Ok(())
    }

    pub fn report(&self) -> TaskReport {
        TaskReport {
            task: self.kind,
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            cancelled: self.is_cancelled(),
            completed: false,
            error: None,
        }
    }
}

/// Splits fetch failures into unit-scoped ones and a task-ending one
///
/// Every failure is recorded against its key. The first task-scoped error
/// is kept in `fatal` so the caller can stop after the current batch.
pub(crate) fn record_failure(
    recorder: &TaskRecorder,
    key: &str,
    error: FetchError,
    fatal: &mut Option<FetchError>,
) {
    recorder.failed(key, &error);
    if !error.is_unit_failure() && fatal.is_none() {
        *fatal = Some(error);
    }
}
