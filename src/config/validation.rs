use crate::config::types::{
    ApiConfig, CheckpointConfig, Config, OutputConfig, RateLimitConfig, RetryConfig,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_api_config(&config.api)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_retry_config(&config.retry)?;
    validate_output_config(&config.output)?;
    validate_checkpoint_config(&config.checkpoint)?;
    Ok(())
}

/// Validates upstream API settings
fn validate_api_config(config: &ApiConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base-url: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "base-url '{}' must use http or https",
            config.base_url
        )));
    }

    if config.items_per_page < 1 || config.items_per_page > 100 {
        return Err(ConfigError::Validation(format!(
            "items-per-page must be between 1 and 100, got {}",
            config.items_per_page
        )));
    }

    if config.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates quota gate settings
fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_requests < 1 || config.max_concurrent_requests > 100 {
        return Err(ConfigError::Validation(format!(
            "max-concurrent-requests must be between 1 and 100, got {}",
            config.max_concurrent_requests
        )));
    }

    if config.conservative_after < 1 {
        return Err(ConfigError::Validation(
            "conservative-after must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates retry settings
fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.max_retries < 1 {
        return Err(ConfigError::Validation(format!(
            "max-retries must be >= 1, got {}",
            config.max_retries
        )));
    }

    if config.max_backoff_ms < config.base_backoff_ms {
        return Err(ConfigError::Validation(format!(
            "max-backoff-ms ({}) must not be smaller than base-backoff-ms ({})",
            config.max_backoff_ms, config.base_backoff_ms
        )));
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.base_folder.is_empty() {
        return Err(ConfigError::Validation(
            "base-folder cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_checkpoint_config(config: &CheckpointConfig) -> Result<(), ConfigError> {
    if config.interval < 1 {
        return Err(ConfigError::Validation(
            "checkpoint interval must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates a repository owner or name segment
///
/// Segments end up in both request paths and folder names, so only the
/// characters the hosting service itself allows are accepted.
pub fn validate_subject_segment(segment: &str) -> Result<(), ConfigError> {
    if segment.is_empty() {
        return Err(ConfigError::Validation(
            "repository owner and name cannot be empty".to_string(),
        ));
    }

    if segment == "." || segment == ".." {
        return Err(ConfigError::Validation(format!(
            "'{}' is not a valid repository segment",
            segment
        )));
    }

    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ConfigError::Validation(format!(
            "'{}' contains characters not allowed in a repository owner or name",
            segment
        )));
    }

    Ok(())
}
