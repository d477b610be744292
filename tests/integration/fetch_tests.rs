//! Fetch layer behaviour against the mock API

use crate::common::{create_test_config, mount_pages, repo_path, subject};
use repo_harvest::config::Config;
use repo_harvest::crawler::{
    commit_endpoint, pr_dependency_endpoint, pulls_endpoint, ApiClient, FetchError,
};
use repo_harvest::output::NoProgress;
use repo_harvest::state::{DependencyType, QuotaGate, QuotaPolicy};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn create_client(config: &Config) -> ApiClient {
    let gate = Arc::new(QuotaGate::new(QuotaPolicy::from(&config.rate_limit)));
    ApiClient::new(config, gate, Arc::new(NoProgress)).unwrap()
}

#[tokio::test]
async fn test_paginate_collects_until_empty_page() {
    let server = MockServer::start().await;
    mount_pages(
        &server,
        &repo_path("pulls"),
        vec![json!([{"number": 1}, {"number": 2}]), json!([{"number": 3}])],
    )
    .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(&create_test_config(&server, &dir));

    let items = client
        .paginate(&pulls_endpoint(&subject()), &[("state", "all".to_string())])
        .await
        .unwrap();

    let numbers: Vec<u64> = items.iter().filter_map(|i| i["number"].as_u64()).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(client.requests_issued(), 3);
}

#[tokio::test]
async fn test_requests_carry_standard_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(repo_path("commits/abc")))
        .and(header("authorization", "Bearer test-token"))
        .and(header("x-github-api-version", "2022-11-28"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sha": "abc"})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(&create_test_config(&server, &dir));

    let detail = client
        .request(&commit_endpoint(&subject(), "abc"), &[])
        .await
        .unwrap();
    assert_eq!(detail, Some(json!({"sha": "abc"})));
}

#[tokio::test]
async fn test_not_found_is_absence() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let client = create_client(&create_test_config(&server, &dir));

    let detail = client
        .request(&commit_endpoint(&subject(), "gone"), &[])
        .await
        .unwrap();
    assert!(detail.is_none());

    let reviews = client
        .paginate(
            &pr_dependency_endpoint(&subject(), 9, DependencyType::Reviews),
            &[],
        )
        .await
        .unwrap();
    assert!(reviews.is_empty());
    assert_eq!(client.requests_issued(), 2);
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(repo_path("commits/abc")))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(&create_test_config(&server, &dir));

    let err = client
        .request(&commit_endpoint(&subject(), "abc"), &[])
        .await
        .unwrap_err();

    assert!(!err.is_unit_failure());
    match err {
        FetchError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_transient_error_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(repo_path("commits/abc")))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(repo_path("commits/abc")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sha": "abc"})))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(&create_test_config(&server, &dir));

    let detail = client
        .request(&commit_endpoint(&subject(), "abc"), &[])
        .await
        .unwrap();
    assert!(detail.is_some());
    assert_eq!(client.requests_issued(), 3);
}

#[tokio::test]
async fn test_quota_rejections_do_not_consume_retries() {
    let server = MockServer::start().await;
    let reset = chrono::Utc::now().timestamp().to_string();
    Mock::given(method("GET"))
        .and(path(repo_path("commits/abc")))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("x-ratelimit-limit", "5000")
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("x-ratelimit-reset", reset.as_str()),
        )
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(repo_path("commits/abc")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sha": "abc"})))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&server, &dir);
    config.retry.max_retries = 1;
    let client = create_client(&config);

    let detail = client
        .request(&commit_endpoint(&subject(), "abc"), &[])
        .await
        .unwrap();

    assert!(detail.is_some());
    assert_eq!(client.requests_issued(), 4);
    assert!(client.gate().status().conservative_mode_enabled);
}

#[tokio::test]
async fn test_plain_forbidden_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(repo_path("commits/abc")))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(&create_test_config(&server, &dir));

    let err = client
        .request(&commit_endpoint(&subject(), "abc"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::ClientFatal { status: 403, .. }));
    assert!(err.is_unit_failure());
    assert!(!client.gate().status().conservative_mode_enabled);
}

#[tokio::test]
async fn test_authoritative_headers_update_gate() {
    let server = MockServer::start().await;
    let reset = (chrono::Utc::now().timestamp() + 1800).to_string();
    Mock::given(method("GET"))
        .and(path(repo_path("commits/abc")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"sha": "abc"}))
                .insert_header("x-ratelimit-limit", "5000")
                .insert_header("x-ratelimit-remaining", "4321")
                .insert_header("x-ratelimit-reset", reset.as_str()),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(&create_test_config(&server, &dir));
    client
        .request(&commit_endpoint(&subject(), "abc"), &[])
        .await
        .unwrap();

    let status = client.gate().status();
    assert_eq!(status.remaining, 4321);
    assert_eq!(status.limit, 5000);
}

#[tokio::test]
async fn test_non_array_page_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(repo_path("pulls")))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "odd"})))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(&create_test_config(&server, &dir));

    let err = client
        .paginate(&pulls_endpoint(&subject()), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::UnexpectedPayload { .. }));
}

#[tokio::test]
async fn test_batch_fetch_isolates_failures() {
    let server = MockServer::start().await;
    for sha in ["c1", "c3"] {
        Mock::given(method("GET"))
            .and(path(repo_path(&format!("commits/{}", sha))))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sha": sha})))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path(repo_path("commits/c2")))
        .respond_with(ResponseTemplate::new(422))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(&create_test_config(&server, &dir));
    let subject = subject();
    let ids: Vec<String> = ["c1", "c2", "c3"].iter().map(|s| s.to_string()).collect();

    let client_ref = &client;
    let subject_ref = &subject;
    let results = client
        .batch_fetch(&ids, 2, |sha| async move {
            client_ref
                .request(&commit_endpoint(subject_ref, &sha), &[])
                .await
        })
        .await;

    let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["c1", "c2", "c3"]);
    assert!(matches!(results[0].1, Ok(Some(_))));
    assert!(matches!(
        results[1].1,
        Err(FetchError::ClientFatal { status: 422, .. })
    ));
    assert!(matches!(results[2].1, Ok(Some(_))));
}
