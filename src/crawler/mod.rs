//! Crawler module for quota-aware repository harvesting
//!
//! This module contains the core harvesting logic, including:
//! - HTTP fetching with pagination, retry and quota pacing
//! - The task definitions for every data category
//! - Phase planning and batch sizing
//! - Overall run coordination and cooperative cancellation

mod coordinator;
mod fetcher;
mod retry;
mod scheduler;
mod shutdown;
pub mod tasks;

pub use coordinator::{run_harvest, Coordinator, CrawlReport, RunOptions};
pub use fetcher::{
    build_http_client, commit_endpoint, commits_endpoint, pr_dependency_endpoint,
    pulls_endpoint, ApiClient, FetchError, FetchOutcome, FetchResult,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{dependency_batch_size, detail_batch_size};
pub use shutdown::CancellationToken;
pub use tasks::TaskReport;
