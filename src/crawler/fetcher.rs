//! HTTP fetcher for the repository API
//!
//! This module handles all outbound requests, including:
//! - Building the HTTP client with the API's standard headers
//! - Pacing every call through the shared quota gate
//! - Classifying responses and retrying transient failures
//! - Page-by-page collection of list endpoints
//! - Chunked concurrent fetching of per-key resources

use crate::config::Config;
use crate::crawler::retry::{RetryDecision, RetryPolicy};
use crate::output::ProgressSink;
use crate::state::{DependencyType, QuotaGate, QuotaHeaders, Subject};
use futures_util::future::join_all;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Delays at least this long are logged at info level
const NOTABLE_WAIT: Duration = Duration::from_secs(5);

/// Errors surfaced by the fetch layer
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{endpoint} returned HTTP {status}")]
    ClientFatal { endpoint: String, status: u16 },

    #[error("{endpoint} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Unexpected payload from {endpoint}: {detail}")]
    UnexpectedPayload { endpoint: String, detail: String },

    #[error("Invalid endpoint {0}")]
    InvalidEndpoint(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl FetchError {
    /// True for failures confined to one unit of work
    ///
    /// Exhausted retries mean the upstream is unhealthy and end the whole
    /// task run instead.
    pub fn is_unit_failure(&self) -> bool {
        matches!(
            self,
            Self::ClientFatal { .. } | Self::UnexpectedPayload { .. } | Self::InvalidEndpoint(_)
        )
    }
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Classification of one HTTP exchange
#[derive(Debug)]
pub enum FetchOutcome {
    Payload(Value),
    NotFound,
    /// Explicit quota rejection with the wait the gate asked for
    RateLimited(Duration),
    ServerTransient(u16),
    TransientNetwork(String),
    ClientFatal(u16),
}

/// Builds an HTTP client with the API's standard headers
pub fn build_http_client(config: &Config) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
    headers.insert(
        "x-github-api-version",
        HeaderValue::from_static("2022-11-28"),
    );

    if let Some(token) = config.api.resolve_token() {
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("API token contains invalid characters; sending requests unauthenticated"),
        }
    } else {
        tracing::warn!("No API token configured; the unauthenticated quota is much smaller");
    }

    Client::builder()
        .user_agent(config.api.user_agent.clone())
        .default_headers(headers)
        .timeout(Duration::from_secs(config.api.request_timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

// ===== Endpoints =====

pub fn pulls_endpoint(subject: &Subject) -> String {
    format!("repos/{}/{}/pulls", subject.owner(), subject.name())
}

pub fn commits_endpoint(subject: &Subject) -> String {
    format!("repos/{}/{}/commits", subject.owner(), subject.name())
}

pub fn pr_dependency_endpoint(subject: &Subject, number: u64, dependency: DependencyType) -> String {
    format!(
        "repos/{}/{}/pulls/{}/{}",
        subject.owner(),
        subject.name(),
        number,
        dependency.as_str()
    )
}

pub fn commit_endpoint(subject: &Subject, sha: &str) -> String {
    format!("repos/{}/{}/commits/{}", subject.owner(), subject.name(), sha)
}

/// Quota-aware client for the repository API
///
/// One client, and therefore one quota gate, is shared by every task of a
/// run.
pub struct ApiClient {
    http: Client,
    base_url: Url,
    items_per_page: u32,
    gate: Arc<QuotaGate>,
    retry: RetryPolicy,
    progress: Arc<dyn ProgressSink>,
    requests_issued: AtomicU64,
}

impl ApiClient {
    pub fn new(
        config: &Config,
        gate: Arc<QuotaGate>,
        progress: Arc<dyn ProgressSink>,
    ) -> FetchResult<Self> {
        let mut base = config.api.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).map_err(|_| FetchError::InvalidEndpoint(config.api.base_url.clone()))?;

        Ok(Self {
            http: build_http_client(config)?,
            base_url,
            items_per_page: config.api.items_per_page,
            gate,
            retry: RetryPolicy::from(&config.retry),
            progress,
            requests_issued: AtomicU64::new(0),
        })
    }

    pub fn gate(&self) -> &Arc<QuotaGate> {
        &self.gate
    }

    /// Number of HTTP requests sent so far, retries included
    pub fn requests_issued(&self) -> u64 {
        self.requests_issued.load(Ordering::SeqCst)
    }

    fn endpoint_url(&self, endpoint: &str) -> FetchResult<Url> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|_| FetchError::InvalidEndpoint(endpoint.to_string()))
    }

    /// Fetches one resource
    ///
    /// Returns `Ok(None)` when the resource does not exist. Transient
    /// failures are retried with backoff up to the retry budget; quota
    /// rejections are waited out and re-issued without touching that budget.
    pub async fn request(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> FetchResult<Option<Value>> {
        let url = self.endpoint_url(endpoint)?;
        let mut transient_failures = 0u32;
        let mut waited_out_rejection = false;

        loop {
            // A rejection wait already covers the reset window
            if !waited_out_rejection {
                let delay = self.gate.delay_before_next(1);
                if delay >= NOTABLE_WAIT {
                    tracing::info!(endpoint, "Quota gate holding requests for {:?}", delay);
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            waited_out_rejection = false;

            self.gate.record_issued();
            self.requests_issued.fetch_add(1, Ordering::SeqCst);

            let outcome = self.send_once(&url, params).await;
            self.progress.quota(&self.gate.summary());

            let last_error = match outcome {
                FetchOutcome::Payload(value) => return Ok(Some(value)),
                FetchOutcome::NotFound => {
                    tracing::debug!(endpoint, "Resource not found");
                    return Ok(None);
                }
                FetchOutcome::RateLimited(wait) => {
                    tracing::warn!(endpoint, "Rate limited, waiting {:?}", wait);
                    tokio::time::sleep(wait).await;
                    waited_out_rejection = true;
                    continue;
                }
                FetchOutcome::ClientFatal(status) => {
                    return Err(FetchError::ClientFatal {
                        endpoint: endpoint.to_string(),
                        status,
                    });
                }
                FetchOutcome::ServerTransient(status) => format!("HTTP {}", status),
                FetchOutcome::TransientNetwork(error) => error,
            };

            transient_failures += 1;
            match self.retry.should_retry(transient_failures) {
                RetryDecision::Retry { delay } => {
                    tracing::warn!(
                        endpoint,
                        attempt = transient_failures,
                        max = self.retry.max_retries(),
                        "{}, retrying in {:?}",
                        last_error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp { reason } => {
                    tracing::error!(endpoint, "{}: {}", last_error, reason);
                    return Err(FetchError::RetriesExhausted {
                        endpoint: endpoint.to_string(),
                        attempts: transient_failures,
                        last_error,
                    });
                }
            }
        }
    }

    /// Sends a single request and classifies the response
    async fn send_once(&self, url: &Url, params: &[(&str, String)]) -> FetchOutcome {
        let response = match self.http.get(url.clone()).query(params).send().await {
            Ok(response) => response,
            Err(e) => return FetchOutcome::TransientNetwork(e.to_string()),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let quota = QuotaHeaders::from_headers(&headers);

        if is_quota_rejection(status, &headers) {
            let mut wait = self.gate.on_rate_limit_rejection(quota);
            if let Some(retry_after) = retry_after(&headers) {
                wait = wait.max(retry_after);
            }
            return FetchOutcome::RateLimited(wait);
        }

        if let Some(quota) = quota {
            self.gate.update_from_authoritative_headers(quota);
        }

        if status == StatusCode::NOT_FOUND {
            return FetchOutcome::NotFound;
        }
        if status.is_server_error() {
            return FetchOutcome::ServerTransient(status.as_u16());
        }
        if !status.is_success() {
            return FetchOutcome::ClientFatal(status.as_u16());
        }

        match response.json::<Value>().await {
            Ok(value) => FetchOutcome::Payload(value),
            Err(e) => FetchOutcome::TransientNetwork(format!("failed to read body: {}", e)),
        }
    }

    /// Collects every page of a list endpoint, in order
    ///
    /// Stops at the first empty page. A missing resource yields whatever was
    /// collected so far, usually nothing.
    pub async fn paginate(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> FetchResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let mut page_params: Vec<(&str, String)> = params.to_vec();
            page_params.push(("page", page.to_string()));
            page_params.push(("per_page", self.items_per_page.to_string()));

            let data = match self.request(endpoint, &page_params).await? {
                Some(data) => data,
                None => break,
            };

            let batch = match data {
                Value::Array(batch) => batch,
                other => {
                    return Err(FetchError::UnexpectedPayload {
                        endpoint: endpoint.to_string(),
                        detail: format!("expected a JSON array, got {}", json_kind(&other)),
                    })
                }
            };

            if batch.is_empty() {
                break;
            }

            tracing::debug!(endpoint, page, count = batch.len(), "Fetched page");
            items.extend(batch);
            page += 1;
        }

        Ok(items)
    }

    /// Runs `fetch` for every id, `concurrency_hint` at a time
    ///
    /// Each chunk waits on the quota gate before it starts. Results come back
    /// in the order of `ids`; one item failing never aborts its siblings.
    pub async fn batch_fetch<K, T, F, Fut>(
        &self,
        ids: &[K],
        concurrency_hint: usize,
        fetch: F,
    ) -> Vec<(K, FetchResult<T>)>
    where
        K: Clone,
        F: Fn(K) -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        let mut results = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(concurrency_hint.max(1)) {
            let delay = self.gate.delay_before_next(chunk.len() as u64);
            if delay >= NOTABLE_WAIT {
                tracing::info!(batch = chunk.len(), "Quota gate holding batch for {:?}", delay);
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let outcomes = join_all(chunk.iter().cloned().map(&fetch)).await;
            results.extend(chunk.iter().cloned().zip(outcomes));
        }

        results
    }
}

/// 429 always; 403 only when the quota headers or `retry-after` say so
fn is_quota_rejection(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    if status != StatusCode::FORBIDDEN {
        return false;
    }

    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);

    exhausted || headers.contains_key(RETRY_AFTER)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
