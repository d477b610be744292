//! End-to-end harvest runs against the mock API

use crate::common::{
    create_coordinator, create_test_config, mount_pages, quiet_coordinator, repo_path,
    small_repo, subject,
};
use repo_harvest::crawler::CancellationToken;
use repo_harvest::output::{ProgressSink, ProgressUpdate};
use repo_harvest::state::{DependencyType, Phase, QuotaSummary, TaskKind};
use repo_harvest::storage::{load_snapshot, read_json_if_exists, OutputLayout};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_full_harvest_writes_tree_and_retires_checkpoint() {
    let server = MockServer::start().await;
    let fixture = small_repo();
    fixture.mount(&server).await;

    let dir = TempDir::new().unwrap();
    let coordinator = quiet_coordinator(create_test_config(&server, &dir)).await;
    let report = coordinator.run().await.unwrap();

    assert!(!report.cancelled);
    assert!(report.finalized, "{:?}", report.validation);
    assert_eq!(
        report.phases_run,
        vec![Phase::Foundation, Phase::DependencyFanOut, Phase::DetailFanOut]
    );
    assert!(report.tasks.iter().all(|t| t.completed));

    let layout = coordinator.layout();
    assert!(!layout.checkpoint_file().exists());

    let pulls = read_json_if_exists(&layout.pulls_file()).await.unwrap().unwrap();
    assert_eq!(pulls.as_array().unwrap().len(), 2);

    for number in [1, 2] {
        for dep in DependencyType::all() {
            assert!(
                layout.pr_dependency_file(number, dep).exists(),
                "missing {} for {}",
                dep,
                number
            );
        }
    }

    for sha in fixture.detail_ids() {
        let detail = read_json_if_exists(&layout.commit_detail_file(sha))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail["sha"], sha);
    }
}

#[tokio::test]
async fn test_second_run_makes_no_requests() {
    let server = MockServer::start().await;
    small_repo().mount(&server).await;
    let dir = TempDir::new().unwrap();

    let first = quiet_coordinator(create_test_config(&server, &dir)).await;
    assert!(first.run().await.unwrap().finalized);
    assert!(first.client().requests_issued() > 0);

    let second = quiet_coordinator(create_test_config(&server, &dir)).await;
    let report = second.run().await.unwrap();

    assert_eq!(report.requests_issued, 0);
    assert!(report.finalized);
    assert_eq!(report.task(TaskKind::PullRequests).unwrap().skipped, 1);
    assert_eq!(report.task(TaskKind::PrFiles).unwrap().skipped, 2);
    assert_eq!(report.task(TaskKind::CommitDetails).unwrap().skipped, 4);
}

#[tokio::test]
async fn test_commit_details_deduplicated_across_sources() {
    // Commits {aaa, bbb, ccc} and reviews {bbb, ccc, ddd}; every detail
    // mock expects exactly one call and is verified when the server drops.
    let server = MockServer::start().await;
    let fixture = small_repo();
    fixture.mount(&server).await;

    let dir = TempDir::new().unwrap();
    let coordinator = quiet_coordinator(create_test_config(&server, &dir)).await;
    let report = coordinator.run().await.unwrap();

    let details = report.task(TaskKind::CommitDetails).unwrap();
    assert_eq!(details.processed, 4);
    assert_eq!(details.failed, 0);
    assert_eq!(fixture.detail_ids().len(), 4);
}

#[tokio::test]
async fn test_missing_reviews_become_empty_artifact() {
    let server = MockServer::start().await;
    mount_pages(&server, &repo_path("pulls"), vec![json!([{"number": 7}])]).await;
    mount_pages(&server, &repo_path("commits"), vec![json!([])]).await;
    Mock::given(method("GET"))
        .and(path(repo_path("pulls/7/reviews")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let coordinator = quiet_coordinator(create_test_config(&server, &dir)).await;
    let report = coordinator.run().await.unwrap();

    let reviews = report.task(TaskKind::PrReviews).unwrap();
    assert_eq!(reviews.processed, 1);
    assert_eq!(reviews.failed, 0);
    assert!(reviews.completed);

    let path = coordinator
        .layout()
        .pr_dependency_file(7, DependencyType::Reviews);
    let data = read_json_if_exists(&path).await.unwrap().unwrap();
    assert_eq!(data, json!([]));
    assert!(report.finalized);
}

#[tokio::test]
async fn test_resume_fetches_only_remaining_units() {
    let dir = TempDir::new().unwrap();

    // First run: files for PR 3 are rejected, everything else succeeds
    let server = MockServer::start().await;
    mount_pages(
        &server,
        &repo_path("pulls"),
        vec![json!([{"number": 1}, {"number": 2}, {"number": 3}])],
    )
    .await;
    mount_pages(&server, &repo_path("commits"), vec![json!([])]).await;
    Mock::given(method("GET"))
        .and(path(repo_path("pulls/3/files")))
        .respond_with(ResponseTemplate::new(422))
        .mount(&server)
        .await;

    let first = quiet_coordinator(create_test_config(&server, &dir)).await;
    let report = first.run().await.unwrap();

    let files = report.task(TaskKind::PrFiles).unwrap();
    assert_eq!(files.processed, 2);
    assert_eq!(files.failed, 1);
    assert!(!files.completed);
    assert!(!report.finalized);

    let snapshot = load_snapshot(&first.layout().checkpoint_file(), &subject())
        .await
        .unwrap()
        .unwrap();
    let progress = snapshot.task(TaskKind::PrFiles).unwrap();
    assert!(progress.failed_keys.contains("3"));
    assert!(!progress.completed);
    assert!(snapshot.task(TaskKind::PrReviews).unwrap().completed);

    // Second run against a healthy server picks up only the missing unit
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(repo_path("pulls/3/files")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&healthy)
        .await;

    let second = quiet_coordinator(create_test_config(&healthy, &dir)).await;
    assert!(second.checkpoint().is_resumed());
    let report = second.run().await.unwrap();

    let files = report.task(TaskKind::PrFiles).unwrap();
    assert_eq!(files.skipped, 2);
    assert_eq!(files.processed, 1);
    assert!(files.completed);
    assert!(report.task(TaskKind::PrReviews).is_none());
    assert_eq!(report.requests_issued, 1);
    assert!(report.finalized);
    assert!(!second.layout().checkpoint_file().exists());
}

#[tokio::test]
async fn test_server_errors_leave_task_incomplete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(repo_path("pulls")))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;
    mount_pages(&server, &repo_path("commits"), vec![json!([{"sha": "abc"}])]).await;
    Mock::given(method("GET"))
        .and(path(repo_path("commits/abc")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sha": "abc"})))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let coordinator = quiet_coordinator(create_test_config(&server, &dir)).await;
    let report = coordinator.run().await.unwrap();

    let pulls = report.task(TaskKind::PullRequests).unwrap();
    assert!(!pulls.completed);
    assert!(pulls.error.is_some());

    // The commit list is independent of the pull request list
    assert!(report.task(TaskKind::Commits).unwrap().completed);

    // Per-PR tasks cannot run without the pull request list
    let files = report.task(TaskKind::PrFiles).unwrap();
    assert!(files.error.as_deref().unwrap_or("").contains("pull_requests"));

    // Details run on the ids known so far but stay incomplete
    let details = report.task(TaskKind::CommitDetails).unwrap();
    assert_eq!(details.processed, 1);
    assert!(!details.completed);

    assert!(!report.finalized);
    assert!(coordinator.layout().checkpoint_file().exists());
    assert!(!coordinator.layout().pulls_file().exists());
}

/// Cancels the run as soon as the named task starts
struct CancelOnStart {
    task: &'static str,
    token: CancellationToken,
}

impl ProgressSink for CancelOnStart {
    fn task_started(&self, task_name: &str, _total_estimate: u64) {
        if task_name == self.task {
            self.token.cancel();
        }
    }

    fn task_progress(&self, _update: &ProgressUpdate) {}

    fn task_finished(&self, _task_name: &str, _completed: bool) {}

    fn quota(&self, _summary: &QuotaSummary) {}
}

#[tokio::test]
async fn test_cancellation_saves_checkpoint_and_resumes() {
    let server = MockServer::start().await;
    small_repo().mount(&server).await;
    let dir = TempDir::new().unwrap();

    let token = CancellationToken::new();
    let sink = Arc::new(CancelOnStart {
        task: TaskKind::PrFiles.name(),
        token: token.clone(),
    });
    let first = create_coordinator(create_test_config(&server, &dir), token, sink).await;
    let report = first.run().await.unwrap();

    assert!(report.cancelled);
    assert!(!report.finalized);
    assert!(!report.phases_run.contains(&Phase::DetailFanOut));
    assert!(report.task(TaskKind::CommitDetails).is_none());
    assert!(first.layout().checkpoint_file().exists());
    assert!(first.checkpoint().is_completed(TaskKind::PullRequests));
    assert!(!first.checkpoint().is_completed(TaskKind::PrFiles));

    let second = quiet_coordinator(create_test_config(&server, &dir)).await;
    assert!(second.checkpoint().is_resumed());
    let report = second.run().await.unwrap();

    assert!(report.finalized);
    assert!(report.task(TaskKind::PullRequests).is_none());
    assert!(!second.layout().checkpoint_file().exists());
}

#[tokio::test]
async fn test_lost_checkpoint_recovers_keys_from_tree() {
    let server = MockServer::start().await;
    small_repo().mount(&server).await;
    let dir = TempDir::new().unwrap();

    let token = CancellationToken::new();
    let sink = Arc::new(CancelOnStart {
        task: TaskKind::CommitDetails.name(),
        token: token.clone(),
    });
    let first = create_coordinator(create_test_config(&server, &dir), token, sink).await;
    assert!(first.run().await.unwrap().cancelled);

    // Corrupt the checkpoint; the tree alone must be enough to finish
    std::fs::write(first.layout().checkpoint_file(), b"{\"subjectIdentity\": ").unwrap();

    let second = quiet_coordinator(create_test_config(&server, &dir)).await;
    assert!(!second.checkpoint().is_resumed());
    let report = second.run().await.unwrap();

    assert_eq!(report.task(TaskKind::CommitDetails).unwrap().processed, 4);
    assert!(report.finalized);
}

/// Reads the on-disk commit detail progress every time a detail is processed
struct DiskProgressReader {
    checkpoint: PathBuf,
    seen: Mutex<Vec<u64>>,
}

impl DiskProgressReader {
    fn new(dir: &TempDir) -> Self {
        let layout = OutputLayout::new(dir.path(), &subject());
        Self {
            checkpoint: layout.checkpoint_file(),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

impl ProgressSink for DiskProgressReader {
    fn task_started(&self, _task_name: &str, _total_estimate: u64) {}

    fn task_progress(&self, update: &ProgressUpdate) {
        if update.task_name != TaskKind::CommitDetails.name() || update.processed_delta == 0 {
            return;
        }
        let bytes = std::fs::read(&self.checkpoint).unwrap();
        let snapshot: Value = serde_json::from_slice(&bytes).unwrap();
        let count = snapshot["tasks"][TaskKind::CommitDetails.name()]["processedCount"]
            .as_u64()
            .unwrap_or(0);
        self.seen.lock().unwrap().push(count);
    }

    fn task_finished(&self, _task_name: &str, _completed: bool) {}

    fn quota(&self, _summary: &QuotaSummary) {}
}

// Commit details run alone in their phase, so no sibling task saves the
// checkpoint in between; one request per batch makes every unit a batch.
async fn detail_progress_on_disk(interval: u64) -> Vec<u64> {
    let server = MockServer::start().await;
    small_repo().mount(&server).await;
    let dir = TempDir::new().unwrap();

    let mut config = create_test_config(&server, &dir);
    config.rate_limit.max_concurrent_requests = 1;
    config.checkpoint.interval = interval;

    let sink = Arc::new(DiskProgressReader::new(&dir));
    let coordinator = create_coordinator(config, CancellationToken::new(), sink.clone()).await;
    let report = coordinator.run().await.unwrap();

    assert!(report.finalized);
    sink.seen()
}

#[tokio::test]
async fn test_checkpoint_saved_periodically_within_task() {
    // Each unit sees the save made after the previous one
    assert_eq!(detail_progress_on_disk(1).await, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_checkpoint_interval_skips_intermediate_saves() {
    assert_eq!(detail_progress_on_disk(2).await, vec![0, 0, 2, 2]);
    assert_eq!(detail_progress_on_disk(10).await, vec![0, 0, 0, 0]);
}
