//! Bulk collection tasks: every pull request, every commit

use super::{CrawlTask, TaskContext, TaskRecorder};
use crate::crawler::fetcher::{commits_endpoint, pulls_endpoint};
use crate::state::TaskKind;
use crate::storage::{
    artifact_exists, extract_commit_shas, extract_pull_numbers, read_json_if_exists,
    write_json_atomic,
};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

/// Key recorded for the single unit of a bulk task
const BULK_KEY: &str = "all";

/// Fetches one complete paginated collection and extracts its identifiers
#[derive(Debug, Clone, Copy)]
pub struct BulkTask {
    kind: TaskKind,
}

impl BulkTask {
    /// `kind` must be `PullRequests` or `Commits`; anything else is treated
    /// as `Commits`
    pub fn new(kind: TaskKind) -> Self {
        Self { kind }
    }

    fn is_pulls(&self) -> bool {
        self.kind == TaskKind::PullRequests
    }

    fn artifact(&self, ctx: &TaskContext) -> PathBuf {
        if self.is_pulls() {
            ctx.layout.pulls_file()
        } else {
            ctx.layout.commits_file()
        }
    }

    /// Publishes the identifiers found in the collection
    fn extract_ids(&self, ctx: &TaskContext, data: &Value) -> usize {
        if self.is_pulls() {
            let numbers = extract_pull_numbers(data);
            let count = numbers.len();
            ctx.checkpoint.add_primary_ids(numbers);
            count
        } else {
            let shas = extract_commit_shas(data);
            let count = shas.len();
            ctx.checkpoint.add_secondary_ids(shas);
            count
        }
    }
}

#[async_trait]
impl CrawlTask for BulkTask {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn estimate_size(&self, _ctx: &TaskContext) -> u64 {
        1
    }

    async fn run(&self, ctx: &TaskContext, recorder: &TaskRecorder) -> Result<()> {
        let path = self.artifact(ctx);

        if artifact_exists(&path).await {
            if let Some(data) = read_json_if_exists(&path).await? {
                let count = self.extract_ids(ctx, &data);
                tracing::info!(
                    task = self.kind.name(),
                    count,
                    "Collection already on disk, re-read identifiers"
                );
            }
            recorder.skipped(BULK_KEY);
            return Ok(());
        }

        let (endpoint, params) = if self.is_pulls() {
            (pulls_endpoint(&ctx.subject), vec![("state", "all".to_string())])
        } else {
            (commits_endpoint(&ctx.subject), Vec::new())
        };

        let items = match ctx.client.paginate(&endpoint, &params).await {
            Ok(items) => items,
            Err(e) => {
                recorder.failed(BULK_KEY, &e);
                return Err(e.into());
            }
        };

        let data = Value::Array(items);
        write_json_atomic(&path, &data).await?;
        let count = self.extract_ids(ctx, &data);
        recorder.processed(BULK_KEY);

        tracing::info!(
            task = self.kind.name(),
            count,
            "Collection saved to {}",
            path.display()
        );
        Ok(())
    }
}
