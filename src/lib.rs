//! Repo-Harvest: a resumable, quota-aware repository data harvester
//!
//! This crate extracts the pull requests, commits and per-pull-request
//! dependents (files, reviews, commit lists, review comments) of a hosted
//! repository from a rate-limited paginated HTTP API, writes them to a
//! deterministic file tree, and resumes interrupted runs from a checkpoint
//! without redoing finished work.

pub mod config;
pub mod crawler;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Repo-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error("Task {task} requires {requires} to have completed")]
    MissingDependency { task: String, requires: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Repo-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{CancellationToken, Coordinator, CrawlReport};
pub use state::{QuotaGate, QuotaStatus, Subject, TaskKind};
pub use storage::{CheckpointSnapshot, CheckpointStore, OutputLayout, TaskProgress};
