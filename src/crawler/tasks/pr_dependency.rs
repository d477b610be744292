//! Per-pull-request dependents: files, reviews, commits, review comments

use super::{record_failure, CrawlTask, TaskContext, TaskRecorder};
use crate::crawler::fetcher::pr_dependency_endpoint;
use crate::crawler::scheduler::dependency_batch_size;
use crate::state::{DependencyType, TaskKind};
use crate::storage::{artifact_exists, extract_review_commit_ids, write_json_atomic};
use crate::{HarvestError, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Fetches one dependency type for every known pull request
#[derive(Debug, Clone, Copy)]
pub struct PrDependencyTask {
    dependency: DependencyType,
}

impl PrDependencyTask {
    pub fn new(dependency: DependencyType) -> Self {
        Self { dependency }
    }
}

#[async_trait]
impl CrawlTask for PrDependencyTask {
    fn kind(&self) -> TaskKind {
        self.dependency.task_kind()
    }

    async fn estimate_size(&self, ctx: &TaskContext) -> u64 {
        ctx.checkpoint.primary_ids().len() as u64
    }

    async fn run(&self, ctx: &TaskContext, recorder: &TaskRecorder) -> Result<()> {
        let numbers = ctx.checkpoint.primary_ids();
        recorder.reconcile_total(numbers.len() as u64);
        let batch = dependency_batch_size(ctx.max_concurrent);

        for chunk in numbers.chunks(batch) {
            if ctx.cancel.is_cancelled() {
                recorder.mark_cancelled();
                break;
            }

            let mut pending = Vec::with_capacity(chunk.len());
            for &number in chunk {
                let path = ctx.layout.pr_dependency_file(number, self.dependency);
                if artifact_exists(&path).await {
                    recorder.skipped(&number.to_string());
                } else {
                    pending.push(number);
                }
            }

            let client = &ctx.client;
            let subject = &ctx.subject;
            let dependency = self.dependency;
            let results = client
                .batch_fetch(&pending, batch, |number| async move {
                    let endpoint = pr_dependency_endpoint(subject, number, dependency);
                    client.paginate(&endpoint, &[]).await
                })
                .await;

            let mut fatal = None;
            for (number, result) in results {
                let key = number.to_string();
                match result {
                    Ok(items) => {
                        let data = Value::Array(items);
                        if self.dependency == DependencyType::Reviews {
                            ctx.checkpoint
                                .add_secondary_ids(extract_review_commit_ids(&data));
                        }
                        let path = ctx.layout.pr_dependency_file(number, self.dependency);
                        write_json_atomic(&path, &data).await?;
                        recorder.processed(&key);
                    }
                    Err(e) => record_failure(recorder, &key, e, &mut fatal),
                }
            }

            recorder.maybe_save().await?;

            if let Some(e) = fatal {
                return Err(HarvestError::TaskFailed {
                    task: self.kind().name().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(())
    }
}
