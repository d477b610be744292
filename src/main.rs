//! Repo-Harvest main entry point
//!
//! This is the command-line interface for the Repo-Harvest repository
//! data harvester.

use anyhow::Context;
use clap::Parser;
use repo_harvest::config::{load_config_with_hash, Config};
use repo_harvest::crawler::{run_harvest, CancellationToken, CrawlReport, RunOptions};
use repo_harvest::output::{print_report, validate_output_tree};
use repo_harvest::{OutputLayout, Subject};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Quota buffer used with --conservative
const CONSERVATIVE_BUFFER: u64 = 500;

/// Concurrency ceiling used with --conservative
const CONSERVATIVE_CONCURRENCY: usize = 5;

/// Repo-Harvest: a resumable repository data harvester
///
/// Downloads the pull requests, commits, per-pull-request files, reviews,
/// commits and review comments, and every commit's details for one
/// repository. Interrupted runs resume where they stopped.
#[derive(Parser, Debug)]
#[command(name = "repo-harvest")]
#[command(version)]
#[command(about = "A resumable, quota-aware repository data harvester", long_about = None)]
struct Cli {
    /// Repository owner
    #[arg(long)]
    owner: String,

    /// Repository name
    #[arg(long)]
    repo: String,

    /// Path to TOML configuration file
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Discard the checkpoint and start over; files already on disk are kept
    #[arg(long)]
    fresh: bool,

    /// Validate the existing output tree and exit
    #[arg(long, conflicts_with = "fresh")]
    validate_only: bool,

    /// Override the maximum number of concurrent requests
    #[arg(long, value_name = "N")]
    max_concurrent: Option<usize>,

    /// Keep a larger quota reserve and fewer requests in flight
    #[arg(long)]
    conservative: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    let subject = Subject::new(&cli.owner, &cli.repo).context("Invalid repository")?;

    let (mut config, config_hash) = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            let (config, hash) = load_config_with_hash(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (config, Some(hash))
        }
        None => (Config::default(), None),
    };

    apply_overrides(&mut config, cli.max_concurrent, cli.conservative);

    if cli.validate_only {
        return handle_validate(&config, &subject).await;
    }

    handle_harvest(config, subject, cli.fresh, config_hash).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("repo_harvest=info,warn"),
            1 => EnvFilter::new("repo_harvest=debug,info"),
            2 => EnvFilter::new("repo_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn apply_overrides(config: &mut Config, max_concurrent: Option<usize>, conservative: bool) {
    if let Some(n) = max_concurrent {
        config.rate_limit.max_concurrent_requests = n;
    }
    if conservative {
        config.rate_limit.buffer = config.rate_limit.buffer.max(CONSERVATIVE_BUFFER);
        config.rate_limit.max_concurrent_requests = config
            .rate_limit
            .max_concurrent_requests
            .min(CONSERVATIVE_CONCURRENCY);
        tracing::info!(
            "Conservative settings: buffer {}, concurrency {}",
            config.rate_limit.buffer,
            config.rate_limit.max_concurrent_requests
        );
    }
}

/// Handles --validate-only: checks the output tree and prints statistics
async fn handle_validate(config: &Config, subject: &Subject) -> anyhow::Result<ExitCode> {
    let layout = OutputLayout::new(&config.output.base_folder, subject);
    println!("Output: {}\n", layout.root().display());

    let report = validate_output_tree(&layout).await;
    print_report(&report);

    Ok(if report.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Handles the main harvest operation
async fn handle_harvest(
    config: Config,
    subject: Subject,
    fresh: bool,
    config_hash: Option<String>,
) -> anyhow::Result<ExitCode> {
    if fresh {
        tracing::info!("Starting fresh harvest (discarding checkpoint)");
    }

    let cancel = CancellationToken::new();
    cancel
        .cancel_on_shutdown_signal()
        .context("Failed to install shutdown signal handlers")?;

    let options = RunOptions { fresh, config_hash };
    let report = run_harvest(config, subject, options, cancel)
        .await
        .context("Harvest failed")?;

    log_report(&report);

    Ok(if report.finalized {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn log_report(report: &CrawlReport) {
    for task in &report.tasks {
        tracing::info!(
            task = task.task.name(),
            processed = task.processed,
            failed = task.failed,
            skipped = task.skipped,
            completed = task.completed,
            "Task summary"
        );
        if let Some(error) = &task.error {
            tracing::error!(task = task.task.name(), "{}", error);
        }
    }

    if report.cancelled {
        tracing::warn!("Interrupted; run again to resume");
    } else if !report.finalized {
        tracing::warn!(
            "Not all data was collected ({} failed units); run again to resume",
            report.total_failed()
        );
    }
}
