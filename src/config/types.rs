use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Repo-Harvest
///
/// Every section is optional; missing sections and keys fall back to the
/// defaults below.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(rename = "rate-limit")]
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub output: OutputConfig,
    pub checkpoint: CheckpointConfig,
}

/// Upstream API settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Root of the REST API
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Access token; when absent the variable named by `token_env` is read
    pub token: Option<String>,

    /// Environment variable consulted for the token
    #[serde(rename = "token-env")]
    pub token_env: String,

    /// Page size used for every paginated request (the API caps this at 100)
    #[serde(rename = "items-per-page")]
    pub items_per_page: u32,

    /// Ceiling applied to each individual HTTP call
    #[serde(rename = "request-timeout-secs")]
    pub request_timeout_secs: u64,

    /// User-Agent header value
    #[serde(rename = "user-agent")]
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: None,
            token_env: "GH_TOKEN".to_string(),
            items_per_page: 100,
            request_timeout_secs: 30,
            user_agent: format!("repo-harvest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ApiConfig {
    /// Returns the configured token, or the one found in the environment
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var(&self.token_env).ok().filter(|t| !t.is_empty()))
    }
}

/// Quota gate settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests kept in reserve; doubled once conservative mode engages
    pub buffer: u64,

    /// Upper bound on concurrent requests within one batch
    #[serde(rename = "max-concurrent-requests")]
    pub max_concurrent_requests: usize,

    /// Pause between requests while the local request window is quiet
    #[serde(rename = "min-delay-ms")]
    pub min_delay_ms: u64,

    /// Added to the time-until-reset when the quota is exhausted
    #[serde(rename = "exhausted-padding-secs")]
    pub exhausted_padding_secs: u64,

    /// Added to the time-until-reset after an explicit quota rejection
    #[serde(rename = "rejection-padding-secs")]
    pub rejection_padding_secs: u64,

    /// Consecutive rejections that switch on conservative mode
    #[serde(rename = "conservative-after")]
    pub conservative_after: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            buffer: 200,
            max_concurrent_requests: 10,
            min_delay_ms: 100,
            exhausted_padding_secs: 60,
            rejection_padding_secs: 120,
            conservative_after: 3,
        }
    }
}

/// Retry settings for transient failures
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Transient failures tolerated before a request is given up
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff (milliseconds)
    #[serde(rename = "base-backoff-ms")]
    pub base_backoff_ms: u64,

    /// Backoff ceiling (milliseconds)
    #[serde(rename = "max-backoff-ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 60_000,
            max_backoff_ms: 300_000,
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Folder under which one directory per subject is created
    #[serde(rename = "base-folder")]
    pub base_folder: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_folder: "crawled-data".to_string(),
        }
    }
}

/// Checkpoint persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Units processed inside a fan-out task between periodic saves
    pub interval: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { interval: 50 }
    }
}
