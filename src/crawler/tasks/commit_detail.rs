//! Per-commit detail documents

use super::{record_failure, CrawlTask, TaskContext, TaskRecorder};
use crate::crawler::fetcher::commit_endpoint;
use crate::crawler::scheduler::detail_batch_size;
use crate::state::TaskKind;
use crate::storage::{is_valid_commit_id, write_json_atomic};
use crate::{HarvestError, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Fetches the detail document of every known commit id
///
/// Ids come from the commit list and from review payloads; the union is
/// deduplicated before anything is fetched. The batch size follows the
/// remaining quota and is recomputed before every batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitDetailTask;

#[async_trait]
impl CrawlTask for CommitDetailTask {
    fn kind(&self) -> TaskKind {
        TaskKind::CommitDetails
    }

    async fn estimate_size(&self, ctx: &TaskContext) -> u64 {
        ctx.checkpoint.secondary_ids().len() as u64
    }

    async fn run(&self, ctx: &TaskContext, recorder: &TaskRecorder) -> Result<()> {
        let ids: Vec<String> = ctx
            .checkpoint
            .secondary_ids()
            .into_iter()
            .filter(|id| is_valid_commit_id(id))
            .collect();
        recorder.reconcile_total(ids.len() as u64);

        let existing = ctx.layout.existing_commit_details().await?;
        let mut pending = Vec::new();
        for id in ids {
            if existing.contains(&id) {
                recorder.skipped(&id);
            } else {
                pending.push(id);
            }
        }

        let client = &ctx.client;
        let subject = &ctx.subject;
        let mut offset = 0;

        while offset < pending.len() {
            if ctx.cancel.is_cancelled() {
                recorder.mark_cancelled();
                break;
            }

            let remaining = client.gate().status().remaining;
            let batch = detail_batch_size(remaining, ctx.max_concurrent);
            let end = (offset + batch).min(pending.len());
            let chunk = &pending[offset..end];
            offset = end;

            tracing::debug!(batch, remaining, "Fetching commit detail batch");

            let results = client
                .batch_fetch(chunk, batch, |sha| async move {
                    let endpoint = commit_endpoint(subject, &sha);
                    client.request(&endpoint, &[]).await
                })
                .await;

            let mut fatal = None;
            for (sha, result) in results {
                match result {
                    Ok(detail) => {
                        // A vanished commit becomes an empty artifact
                        let data = detail.unwrap_or_else(|| Value::Array(Vec::new()));
                        write_json_atomic(&ctx.layout.commit_detail_file(&sha), &data).await?;
                        recorder.processed(&sha);
                    }
                    Err(e) => record_failure(recorder, &sha, e, &mut fatal),
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
