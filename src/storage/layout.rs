//! Deterministic output tree for one subject
//!
//! ```text
//! <base>/<owner>-<name>/
//!   .checkpoint.json
//!   pull/all_data.json
//!   pull/<number>/<files|reviews|commits|comments>/all_data.json
//!   commit/all_data.json
//!   commit/all/<sha>.json
//! ```
//!
//! The presence of an artifact is what resumption keys on, so every artifact
//! is written to a temporary sibling first and renamed into place.

use crate::state::{DependencyType, Subject};
use crate::storage::{StorageError, StorageResult};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const DATA_FILE: &str = "all_data.json";
const CHECKPOINT_FILE: &str = ".checkpoint.json";

/// Paths of every artifact belonging to one subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(base_folder: impl AsRef<Path>, subject: &Subject) -> Self {
        Self {
            root: base_folder.as_ref().join(subject.folder_name()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub fn pull_dir(&self) -> PathBuf {
        self.root.join("pull")
    }

    pub fn pulls_file(&self) -> PathBuf {
        self.pull_dir().join(DATA_FILE)
    }

    pub fn commits_file(&self) -> PathBuf {
        self.root.join("commit").join(DATA_FILE)
    }

    pub fn commit_detail_dir(&self) -> PathBuf {
        self.root.join("commit").join("all")
    }

    pub fn commit_detail_file(&self, sha: &str) -> PathBuf {
        self.commit_detail_dir().join(format!("{}.json", sha))
    }

    pub fn pr_dependency_file(&self, number: u64, dependency: DependencyType) -> PathBuf {
        self.pull_dir()
            .join(number.to_string())
            .join(dependency.as_str())
            .join(DATA_FILE)
    }

    // ===== Discovery =====

    /// PR numbers listed in `pull/all_data.json`, if the file exists
    pub async fn read_pull_numbers(&self) -> StorageResult<Option<Vec<u64>>> {
        Ok(read_json_if_exists(&self.pulls_file())
            .await?
            .map(|data| extract_pull_numbers(&data)))
    }

    /// Commit ids listed in `commit/all_data.json`, if the file exists
    pub async fn read_commit_shas(&self) -> StorageResult<Option<BTreeSet<String>>> {
        Ok(read_json_if_exists(&self.commits_file())
            .await?
            .map(|data| extract_commit_shas(&data)))
    }

    /// Commit ids referenced by the stored reviews of the given PRs
    ///
    /// Unreadable review files are skipped with a warning; the reviews task
    /// re-fetches nothing that already exists, so a broken file would
    /// otherwise stop discovery for good.
    pub async fn read_review_commit_ids(&self, numbers: &[u64]) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for &number in numbers {
            let path = self.pr_dependency_file(number, DependencyType::Reviews);
            match read_json_if_exists(&path).await {
                Ok(Some(data)) => ids.extend(extract_review_commit_ids(&data)),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable reviews file: {}", e),
            }
        }
        ids
    }

    /// Commit ids that already have a detail file
    pub async fn existing_commit_details(&self) -> StorageResult<BTreeSet<String>> {
        let dir = self.commit_detail_dir();
        let mut existing = BTreeSet::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(existing),
            Err(e) => return Err(StorageError::io(&dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(sha) = name.strip_suffix(".json") {
                existing.insert(sha.to_string());
            }
        }

        Ok(existing)
    }
}

/// Returns true when an artifact already exists at `path`
pub async fn artifact_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Writes `data` as pretty JSON, atomically replacing any existing file
///
/// The content goes to `<file>.tmp` in the same directory and is renamed into
/// place, so readers only ever see a complete document.
pub async fn write_json_atomic(path: &Path, data: &Value) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(data)?;
    write_bytes_atomic(path, &bytes).await
}

pub(crate) async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StorageError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StorageError::io(path, e))?;

    Ok(())
}

pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Reads and parses a JSON file, returning None when it does not exist
pub async fn read_json_if_exists(path: &Path) -> StorageResult<Option<Value>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

// ===== Identifier extraction =====

/// Pull request numbers from a list of pull request objects
pub fn extract_pull_numbers(data: &Value) -> Vec<u64> {
    let mut numbers: Vec<u64> = data
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("number").and_then(Value::as_u64))
                .collect()
        })
        .unwrap_or_default();
    numbers.sort_unstable();
    numbers.dedup();
    numbers
}

/// Commit ids (`sha`) from a list of commit objects
pub fn extract_commit_shas(data: &Value) -> BTreeSet<String> {
    extract_string_field(data, "sha")
}

/// Commit ids (`commit_id`) referenced by a list of reviews
pub fn extract_review_commit_ids(data: &Value) -> BTreeSet<String> {
    extract_string_field(data, "commit_id")
}

fn extract_string_field(data: &Value, field: &str) -> BTreeSet<String> {
    data.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_str))
                .filter(|id| is_valid_commit_id(id))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Commit ids become file names, so only plain hex-like tokens are accepted
pub fn is_valid_commit_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.chars().all(|c| c.is_ascii_alphanumeric())
}
