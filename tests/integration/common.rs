//! Shared fixtures for the integration tests

use repo_harvest::config::Config;
use repo_harvest::crawler::{CancellationToken, Coordinator, RunOptions};
use repo_harvest::output::{NoProgress, ProgressSink};
use repo_harvest::Subject;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const OWNER: &str = "octo";
pub const REPO: &str = "widgets";

pub fn subject() -> Subject {
    Subject::new(OWNER, REPO).unwrap()
}

pub fn repo_path(suffix: &str) -> String {
    format!("/repos/{}/{}/{}", OWNER, REPO, suffix)
}

/// Creates a configuration pointed at the mock server with all waits shrunk
pub fn create_test_config(server: &MockServer, dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.api.base_url = server.uri();
    config.api.token = Some("test-token".to_string());
    config.rate_limit.min_delay_ms = 0;
    config.rate_limit.exhausted_padding_secs = 0;
    config.rate_limit.rejection_padding_secs = 0;
    config.retry.max_retries = 3;
    config.retry.base_backoff_ms = 1;
    config.retry.max_backoff_ms = 10;
    config.output.base_folder = dir.path().to_string_lossy().into_owned();
    config.checkpoint.interval = 1;
    config
}

pub async fn create_coordinator(
    config: Config,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
) -> Coordinator {
    Coordinator::new(config, subject(), RunOptions::default(), progress, cancel)
        .await
        .unwrap()
}

pub async fn quiet_coordinator(config: Config) -> Coordinator {
    create_coordinator(config, CancellationToken::new(), Arc::new(NoProgress)).await
}

/// Mounts a paginated list: page `i` returns `pages[i - 1]`, the page after
/// the last returns `[]`
pub async fn mount_pages(server: &MockServer, list_path: &str, pages: Vec<Value>) {
    let count = pages.len();
    for (i, page) in pages.into_iter().enumerate() {
        Mock::given(method("GET"))
            .and(path(list_path))
            .and(query_param("page", (i + 1).to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(page))
            .mount(server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path(list_path))
        .and(query_param("page", (count + 1).to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
}

/// A small repository served by the mock API
///
/// Per-PR files, commits and comments are left unmounted, so the server
/// answers 404 for them.
pub struct RepoFixture {
    pub pulls: Vec<u64>,
    pub commits: Vec<&'static str>,
    pub reviews: Vec<(u64, Vec<&'static str>)>,
}

impl RepoFixture {
    /// Every commit id the harvest should fetch details for
    pub fn detail_ids(&self) -> BTreeSet<&'static str> {
        let mut ids: BTreeSet<&'static str> = self.commits.iter().copied().collect();
        for (_, review_ids) in &self.reviews {
            ids.extend(review_ids.iter().copied());
        }
        ids
    }

    /// Mounts the whole repository; each detail must be fetched exactly once
    pub async fn mount(&self, server: &MockServer) {
        let pulls: Vec<Value> = self
            .pulls
            .iter()
            .map(|n| json!({"number": n, "title": format!("PR {}", n)}))
            .collect();
        mount_pages(server, &repo_path("pulls"), vec![Value::Array(pulls)]).await;

        let commits: Vec<Value> = self.commits.iter().map(|sha| json!({"sha": sha})).collect();
        mount_pages(server, &repo_path("commits"), vec![Value::Array(commits)]).await;

        for (number, review_ids) in &self.reviews {
            let reviews: Vec<Value> = review_ids
                .iter()
                .map(|id| json!({"state": "APPROVED", "commit_id": id}))
                .collect();
            mount_pages(
                server,
                &repo_path(&format!("pulls/{}/reviews", number)),
                vec![Value::Array(reviews)],
            )
            .await;
        }

        for sha in self.detail_ids() {
            Mock::given(method("GET"))
                .and(path(repo_path(&format!("commits/{}", sha))))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(json!({"sha": sha, "files": []})),
                )
                .expect(1)
                .mount(server)
                .await;
        }
    }
}

pub fn small_repo() -> RepoFixture {
    RepoFixture {
        pulls: vec![1, 2],
        commits: vec!["aaa", "bbb", "ccc"],
        reviews: vec![(1, vec!["bbb", "ccc"]), (2, vec!["ddd"])],
    }
}
