//! Output tree validation and statistics
//!
//! Reads only the finished output tree, never the checkpoint. A run is
//! finalized (its checkpoint deleted) only when this reports no errors.

use crate::state::DependencyType;
use crate::storage::{
    extract_commit_shas, extract_pull_numbers, extract_review_commit_ids, OutputLayout,
    StorageError,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Review coverage below this share of pull requests produces a warning
const LOW_REVIEW_COVERAGE: f64 = 0.1;

/// Minimum number of pull requests before review coverage is judged
const COVERAGE_SAMPLE: usize = 10;

/// Per-dependency artifact counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependencyStats {
    /// Artifacts holding at least one item
    pub with_data: usize,
    /// Artifacts holding an empty array
    pub empty: usize,
    pub missing: usize,
}

/// Counts describing an output tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeStatistics {
    pub pull_requests: usize,
    pub commits: usize,
    /// Distinct commit ids known from commits and reviews
    pub known_commit_ids: usize,
    pub commit_details: usize,
    pub dependencies: BTreeMap<&'static str, DependencyStats>,
}

/// Outcome of validating an output tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub stats: TreeStatistics,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

enum Artifact {
    Missing,
    Invalid(String),
    Items(Value),
}

async fn read_artifact(path: &Path, expect_array: bool) -> Artifact {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Artifact::Missing,
        Err(e) => return Artifact::Invalid(StorageError::io(path, e).to_string()),
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) if expect_array && !value.is_array() => {
            Artifact::Invalid(format!("{} is not a JSON array", path.display()))
        }
        Ok(value) => Artifact::Items(value),
        Err(e) => Artifact::Invalid(format!("{}: {}", path.display(), e)),
    }
}

/// Checks that every artifact implied by the tree's own collections exists
/// and parses
pub async fn validate_output_tree(layout: &OutputLayout) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut numbers = Vec::new();
    match read_artifact(&layout.pulls_file(), true).await {
        Artifact::Items(data) => numbers = extract_pull_numbers(&data),
        Artifact::Missing => report
            .errors
            .push(format!("Missing {}", layout.pulls_file().display())),
        Artifact::Invalid(reason) => report.errors.push(format!("Invalid {}", reason)),
    }
    report.stats.pull_requests = numbers.len();

    let mut commit_ids = BTreeSet::new();
    match read_artifact(&layout.commits_file(), true).await {
        Artifact::Items(data) => {
            commit_ids = extract_commit_shas(&data);
            report.stats.commits = data.as_array().map(Vec::len).unwrap_or(0);
        }
        Artifact::Missing => report
            .errors
            .push(format!("Missing {}", layout.commits_file().display())),
        Artifact::Invalid(reason) => report.errors.push(format!("Invalid {}", reason)),
    }

    for dependency in DependencyType::all() {
        let mut stats = DependencyStats::default();
        for &number in &numbers {
            let path = layout.pr_dependency_file(number, dependency);
            match read_artifact(&path, true).await {
                Artifact::Items(data) => {
                    if data.as_array().map(Vec::is_empty).unwrap_or(true) {
                        stats.empty += 1;
                    } else {
                        stats.with_data += 1;
                    }
                    if dependency == DependencyType::Reviews {
                        commit_ids.extend(extract_review_commit_ids(&data));
                    }
                }
                Artifact::Missing => {
                    stats.missing += 1;
                    report.errors.push(format!(
                        "Missing {} for pull request {}",
                        dependency, number
                    ));
                }
                Artifact::Invalid(reason) => report.errors.push(format!("Invalid {}", reason)),
            }
        }
        report.stats.dependencies.insert(dependency.as_str(), stats);
    }
    report.stats.known_commit_ids = commit_ids.len();

    for sha in &commit_ids {
        match read_artifact(&layout.commit_detail_file(sha), false).await {
            Artifact::Items(_) => report.stats.commit_details += 1,
            Artifact::Missing => report
                .errors
                .push(format!("Missing commit detail for {}", sha)),
            Artifact::Invalid(reason) => report.errors.push(format!("Invalid {}", reason)),
        }
    }

    if numbers.is_empty() {
        report
            .warnings
            .push("No pull requests found for this repository".to_string());
    }

    if numbers.len() >= COVERAGE_SAMPLE {
        let reviewed = report
            .stats
            .dependencies
            .get(DependencyType::Reviews.as_str())
            .map(|s| s.with_data)
            .unwrap_or(0);
        let coverage = reviewed as f64 / numbers.len() as f64;
        if coverage < LOW_REVIEW_COVERAGE {
            report.warnings.push(format!(
                "Only {:.1}% of pull requests have reviews",
                coverage * 100.0
            ));
        }
    }

    report
}

/// Prints a validation report to stdout
pub fn print_report(report: &ValidationReport) {
    let stats = &report.stats;

    println!("=== Output Validation ===\n");

    println!("Overview:");
    println!("  Pull requests: {}", stats.pull_requests);
    println!("  Commits: {}", stats.commits);
    println!("  Known commit ids: {}", stats.known_commit_ids);
    println!("  Commit details on disk: {}", stats.commit_details);
    println!();

    println!("Pull request dependencies:");
    for (name, dep) in &stats.dependencies {
        println!(
            "  {}: {} with data, {} empty, {} missing",
            name, dep.with_data, dep.empty, dep.missing
        );
    }
    println!();

    if !report.warnings.is_empty() {
        println!("Warnings:");
        for warning in &report.warnings {
            println!("  - {}", warning);
        }
        println!();
    }

    if report.is_valid() {
        println!("Result: valid");
    } else {
        println!("Errors ({}):", report.errors.len());
        for error in report.errors.iter().take(20) {
            println!("  - {}", error);
        }
        if report.errors.len() > 20 {
            println!("  ... and {} more", report.errors.len() - 20);
        }
        println!();
        println!("Result: invalid");
    }
}
