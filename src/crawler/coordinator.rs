//! Harvest coordinator - phased orchestration of the crawl tasks
//!
//! This module drives a whole run for one subject, including:
//! - Opening or resuming the subject's checkpoint
//! - Running the phases in order, the dependency fan-out concurrently
//! - Deciding which tasks may be marked completed
//! - Saving the checkpoint at phase boundaries and on interruption
//! - Validating the output tree and retiring the checkpoint

use crate::config::{validate, Config};
use crate::crawler::scheduler::{check_runnable, pending_tasks, upstream_completed};
use crate::crawler::tasks::{build_task, TaskContext, TaskRecorder, TaskReport};
use crate::crawler::{ApiClient, CancellationToken};
use crate::output::{validate_output_tree, LogProgress, ProgressSink, ValidationReport};
use crate::state::{Phase, QuotaGate, QuotaPolicy, Subject, TaskKind};
use crate::storage::{CheckpointStore, OutputLayout};
use crate::Result;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Options fixed at the start of a run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Discard any existing checkpoint first
    pub fresh: bool,
    /// Hash of the configuration file, stored in the checkpoint
    pub config_hash: Option<String>,
}

/// Summary of one coordinator run
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub phases_run: Vec<Phase>,
    pub tasks: Vec<TaskReport>,
    pub cancelled: bool,
    /// Set once the tree validated and the checkpoint was deleted
    pub finalized: bool,
    pub validation: Option<ValidationReport>,
    pub requests_issued: u64,
    pub elapsed: Duration,
}

impl CrawlReport {
    pub fn task(&self, kind: TaskKind) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task == kind)
    }

    pub fn total_skipped(&self) -> u64 {
        self.tasks.iter().map(|t| t.skipped).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.tasks.iter().map(|t| t.failed).sum()
    }
}

/// Main harvest coordinator
pub struct Coordinator {
    ctx: TaskContext,
}

impl Coordinator {
    /// Creates a coordinator for `subject`
    ///
    /// Validates the configuration, opens (or discards, with
    /// `options.fresh`) the subject's checkpoint and builds the shared
    /// quota gate and API client.
    pub async fn new(
        config: Config,
        subject: Subject,
        options: RunOptions,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        validate(&config)?;

        let layout = OutputLayout::new(&config.output.base_folder, &subject);
        let checkpoint = Arc::new(
            CheckpointStore::open(&layout, &subject, options.config_hash, options.fresh).await?,
        );

        let gate = Arc::new(QuotaGate::new(QuotaPolicy::from(&config.rate_limit)));
        let client = Arc::new(ApiClient::new(&config, gate, progress.clone())?);

        let ctx = TaskContext {
            subject,
            client,
            checkpoint,
            layout,
            progress,
            cancel,
            max_concurrent: config.rate_limit.max_concurrent_requests,
            checkpoint_interval: config.checkpoint.interval,
        };

        Ok(Self { ctx })
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.ctx.checkpoint
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.ctx.client
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.ctx.layout
    }

    /// Runs every outstanding phase
    ///
    /// Returns once all phases ran, or as soon as cancellation is observed
    /// at a phase or batch boundary. The checkpoint is saved either way.
    pub async fn run(&self) -> Result<CrawlReport> {
        let start = Instant::now();
        let checkpoint = &self.ctx.checkpoint;

        if checkpoint.is_resumed() {
            tracing::info!(
                "Resuming harvest of {}\n{}",
                self.ctx.subject,
                checkpoint.resume_summary()
            );
        } else {
            tracing::info!("Starting harvest of {}", self.ctx.subject);
        }

        let mut report = CrawlReport::default();

        for phase in Phase::all() {
            if self.ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            if phase != Phase::Foundation {
                self.refresh_known_ids().await;
            }

            tracing::info!("Entering {} phase", phase);
            let tasks = self.run_phase(phase).await;
            let interrupted = tasks.iter().any(|t| t.cancelled);
            report.phases_run.push(phase);
            report.tasks.extend(tasks);

            checkpoint.save().await?;

            if interrupted {
                report.cancelled = true;
                break;
            }
        }

        report.requests_issued = self.ctx.client.requests_issued();
        report.elapsed = start.elapsed();

        if report.cancelled {
            checkpoint.save().await?;
            tracing::warn!(
                "Harvest interrupted; progress saved to {}",
                checkpoint.path().display()
            );
            return Ok(report);
        }

        let incomplete: Vec<&str> = TaskKind::sequence()
            .iter()
            .filter(|kind| !checkpoint.is_completed(**kind))
            .map(|kind| kind.name())
            .collect();
        if !incomplete.is_empty() {
            tracing::warn!(
                "Harvest finished with incomplete tasks: {}; rerun to resume",
                incomplete.join(", ")
            );
            return Ok(report);
        }

        let validation = validate_output_tree(&self.ctx.layout).await;
        if validation.is_valid() {
            checkpoint.remove().await?;
            report.finalized = true;
            tracing::info!(
                "Harvest of {} complete in {:?} ({} requests)",
                self.ctx.subject,
                report.elapsed,
                report.requests_issued
            );
        } else {
            tracing::warn!(
                "Output validation found {} problems; keeping checkpoint",
                validation.errors.len()
            );
            for error in validation.errors.iter().take(10) {
                tracing::warn!("  {}", error);
            }
        }
        report.validation = Some(validation);

        Ok(report)
    }

    async fn run_phase(&self, phase: Phase) -> Vec<TaskReport> {
        let kinds = pending_tasks(phase, &self.ctx.checkpoint);

        if phase.is_concurrent() {
            return join_all(kinds.into_iter().map(|kind| self.run_task(kind))).await;
        }

        let mut reports = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            reports.push(self.run_task(kind).await);
        }
        reports
    }

    /// Runs one task and applies the completion rule
    ///
    /// A task is marked completed only when it returned Ok, recorded no unit
    /// failures in this run, was not cancelled, and everything upstream of
    /// it is completed.
    async fn run_task(&self, kind: TaskKind) -> TaskReport {
        let ctx = &self.ctx;

        if let Err(e) = check_runnable(kind, &ctx.checkpoint) {
            tracing::warn!(task = kind.name(), "Not running: {}", e);
            return TaskReport {
                task: kind,
                processed: 0,
                failed: 0,
                skipped: 0,
                cancelled: false,
                completed: false,
                error: Some(e.to_string()),
            };
        }

        let task = build_task(kind);
        let total = task.estimate_size(ctx).await;
        ctx.checkpoint.init_task(kind, total);
        ctx.progress.task_started(kind.name(), total);

        let recorder = TaskRecorder::new(ctx, kind, total);
        let outcome = task.run(ctx, &recorder).await;
        let mut report = recorder.report();

        match outcome {
            Ok(()) => {
                if report.failed == 0
                    && !report.cancelled
                    && upstream_completed(kind, &ctx.checkpoint)
                {
                    ctx.checkpoint.mark_completed(kind);
                    report.completed = true;
                } else if report.failed > 0 {
                    tracing::warn!(
                        task = kind.name(),
                        failed = report.failed,
                        "Task finished with failed units"
                    );
                }
            }
            Err(e) => {
                tracing::error!(task = kind.name(), "Task failed: {}", e);
                report.error = Some(e.to_string());
            }
        }

        ctx.progress.task_finished(kind.name(), report.completed);
        report
    }

    /// Merges identifiers found in the output tree into the checkpoint
    ///
    /// Keeps the fan-out key sets intact when the checkpoint was lost or
    /// discarded but the tree survived.
    async fn refresh_known_ids(&self) {
        let layout = &self.ctx.layout;
        let checkpoint = &self.ctx.checkpoint;

        match layout.read_pull_numbers().await {
            Ok(Some(numbers)) => checkpoint.add_primary_ids(numbers),
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read pull request list: {}", e),
        }

        match layout.read_commit_shas().await {
            Ok(Some(shas)) => checkpoint.add_secondary_ids(shas),
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read commit list: {}", e),
        }

        let review_ids = layout.read_review_commit_ids(&checkpoint.primary_ids()).await;
        checkpoint.add_secondary_ids(review_ids);

        tracing::debug!(
            pull_requests = checkpoint.primary_ids().len(),
            commit_ids = checkpoint.secondary_ids().len(),
            "Known identifiers refreshed"
        );
    }
}

/// Runs a complete harvest with log-based progress reporting
///
/// This is the main entry point for harvesting a repository.
pub async fn run_harvest(
    config: Config,
    subject: Subject,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<CrawlReport> {
    let coordinator = Coordinator::new(
        config,
        subject,
        options,
        Arc::new(LogProgress::default()),
        cancel,
    )
    .await?;
    coordinator.run().await
}
