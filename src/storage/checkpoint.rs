//! Durable per-subject progress record
//!
//! The store keeps the live snapshot in memory behind a mutex and persists it
//! on request. Tasks never touch the snapshot directly; every mutation goes
//! through an accessor here.

use crate::state::{Subject, TaskKind};
use crate::storage::layout::{temp_path, write_bytes_atomic};
use crate::storage::{OutputLayout, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Progress of one task across runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_name: String,
    pub completed: bool,
    pub total_estimate: u64,
    pub processed_count: u64,
    #[serde(default)]
    pub failed_keys: BTreeSet<String>,
    #[serde(default)]
    pub skipped_keys: BTreeSet<String>,
    pub last_updated_at: DateTime<Utc>,
}

impl TaskProgress {
    fn new(kind: TaskKind, total_estimate: u64, now: DateTime<Utc>) -> Self {
        Self {
            task_name: kind.name().to_string(),
            completed: false,
            total_estimate,
            processed_count: 0,
            failed_keys: BTreeSet::new(),
            skipped_keys: BTreeSet::new(),
            last_updated_at: now,
        }
    }
}

/// Everything persisted in `.checkpoint.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSnapshot {
    /// `owner/name` of the harvested repository
    pub subject_identity: String,
    pub started_at: DateTime<Utc>,
    pub last_saved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskProgress>,
    /// Pull request numbers enumerated so far
    #[serde(default)]
    pub completed_primary_ids: BTreeSet<u64>,
    /// Commit ids enumerated so far, from any source
    #[serde(default)]
    pub completed_secondary_ids: BTreeSet<String>,
}

impl CheckpointSnapshot {
    pub fn new(subject: &Subject, config_hash: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            subject_identity: subject.to_string(),
            started_at: now,
            last_saved_at: now,
            config_hash,
            tasks: BTreeMap::new(),
            completed_primary_ids: BTreeSet::new(),
            completed_secondary_ids: BTreeSet::new(),
        }
    }

    pub fn task(&self, kind: TaskKind) -> Option<&TaskProgress> {
        self.tasks.get(kind.name())
    }

    fn task_mut(&mut self, kind: TaskKind) -> &mut TaskProgress {
        let now = Utc::now();
        let entry = self
            .tasks
            .entry(kind.name().to_string())
            .or_insert_with(|| TaskProgress::new(kind, 0, now));
        entry.last_updated_at = now;
        entry
    }
}

/// Reads a checkpoint file
///
/// Returns `Ok(None)` when no file exists. A file that does not parse, or
/// that belongs to another subject, is an error; callers decide whether to
/// recover.
pub async fn load_snapshot(path: &Path, subject: &Subject) -> StorageResult<Option<CheckpointSnapshot>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };

    let snapshot: CheckpointSnapshot =
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let expected = subject.to_string();
    if snapshot.subject_identity != expected {
        return Err(StorageError::SubjectMismatch {
            expected,
            found: snapshot.subject_identity,
        });
    }

    Ok(Some(snapshot))
}

/// Sole owner of a subject's checkpoint
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    resumed: bool,
    state: Mutex<CheckpointSnapshot>,
    save_lock: tokio::sync::Mutex<()>,
}

impl CheckpointStore {
    /// Loads the subject's checkpoint, or starts a new one
    ///
    /// With `fresh` set any existing file is discarded first. A corrupt or
    /// foreign checkpoint is discarded with a warning rather than failing
    /// the run.
    pub async fn open(
        layout: &OutputLayout,
        subject: &Subject,
        config_hash: Option<String>,
        fresh: bool,
    ) -> StorageResult<Self> {
        let path = layout.checkpoint_file();

        if fresh {
            discard_file(&path).await?;
        }

        let loaded = match load_snapshot(&path, subject).await {
            Ok(snapshot) => snapshot,
            Err(e @ StorageError::Corrupt { .. }) | Err(e @ StorageError::SubjectMismatch { .. }) => {
                tracing::warn!("Discarding unusable checkpoint, starting fresh: {}", e);
                discard_file(&path).await?;
                None
            }
            Err(e) => return Err(e),
        };

        let (snapshot, resumed) = match loaded {
            Some(mut snapshot) => {
                if let (Some(stored), Some(current)) = (&snapshot.config_hash, &config_hash) {
                    if stored != current {
                        tracing::warn!(
                            "Configuration changed since the checkpoint was written; resuming anyway"
                        );
                    }
                }
                if config_hash.is_some() {
                    snapshot.config_hash = config_hash;
                }
                (snapshot, true)
            }
            None => (CheckpointSnapshot::new(subject, config_hash), false),
        };

        Ok(Self {
            path,
            resumed,
            state: Mutex::new(snapshot),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the store was loaded from an existing file
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    // ===== Task progress =====

    pub fn is_completed(&self, kind: TaskKind) -> bool {
        self.lock().task(kind).map(|t| t.completed).unwrap_or(false)
    }

    /// Registers a task run, raising its estimate if the new one is larger
    pub fn init_task(&self, kind: TaskKind, total_estimate: u64) {
        let mut state = self.lock();
        let task = state.task_mut(kind);
        task.total_estimate = task.total_estimate.max(total_estimate);
    }

    /// Replaces the estimate once the real size is known
    pub fn reconcile_total(&self, kind: TaskKind, actual: u64) {
        self.lock().task_mut(kind).total_estimate = actual;
    }

    /// Records a fetched and persisted unit
    ///
    /// A key that failed in an earlier attempt is cleared from the failures.
    pub fn record_processed(&self, kind: TaskKind, key: &str) {
        let mut state = self.lock();
        let task = state.task_mut(kind);
        task.processed_count += 1;
        task.failed_keys.remove(key);
    }

    pub fn record_failed(&self, kind: TaskKind, key: &str) {
        self.lock().task_mut(kind).failed_keys.insert(key.to_string());
    }

    pub fn record_skipped(&self, kind: TaskKind, key: &str) {
        let mut state = self.lock();
        let task = state.task_mut(kind);
        task.skipped_keys.insert(key.to_string());
        task.failed_keys.remove(key);
    }

    pub fn mark_completed(&self, kind: TaskKind) {
        self.lock().task_mut(kind).completed = true;
    }

    pub fn task_progress(&self, kind: TaskKind) -> Option<TaskProgress> {
        self.lock().task(kind).cloned()
    }

    // ===== Derived key sets =====

    pub fn add_primary_ids(&self, ids: impl IntoIterator<Item = u64>) {
        self.lock().completed_primary_ids.extend(ids);
    }

    pub fn add_secondary_ids(&self, ids: impl IntoIterator<Item = String>) {
        self.lock().completed_secondary_ids.extend(ids);
    }

    /// Known pull request numbers, ascending
    pub fn primary_ids(&self) -> Vec<u64> {
        self.lock().completed_primary_ids.iter().copied().collect()
    }

    pub fn secondary_ids(&self) -> BTreeSet<String> {
        self.lock().completed_secondary_ids.clone()
    }

    pub fn snapshot(&self) -> CheckpointSnapshot {
        self.lock().clone()
    }

    // ===== Persistence =====

    /// Writes the current snapshot to disk, atomically
    ///
    /// Concurrent saves are serialized. Mutations made while a save is in
    /// flight are picked up by the next one.
    pub async fn save(&self) -> StorageResult<()> {
        let _guard = self.save_lock.lock().await;

        let bytes = {
            let mut state = self.lock();
            state.last_saved_at = Utc::now();
            serde_json::to_vec_pretty(&*state)?
        };

        write_bytes_atomic(&self.path, &bytes).await?;
        tracing::debug!("Checkpoint saved to {}", self.path.display());
        Ok(())
    }

    /// Deletes the checkpoint file; the subject is then considered complete
    pub async fn remove(&self) -> StorageResult<()> {
        let _guard = self.save_lock.lock().await;
        discard_file(&self.path).await
    }

    pub fn resume_summary(&self) -> ResumeSummary {
        let state = self.lock();

        let tasks: Vec<TaskLine> = TaskKind::sequence()
            .into_iter()
            .filter_map(|kind| state.task(kind))
            .map(|t| TaskLine {
                task_name: t.task_name.clone(),
                completed: t.completed,
                processed: t.processed_count,
                total: t.total_estimate,
                failed: t.failed_keys.len(),
                skipped: t.skipped_keys.len(),
            })
            .collect();

        let incomplete_tasks = TaskKind::sequence()
            .into_iter()
            .filter(|kind| !state.task(*kind).map(|t| t.completed).unwrap_or(false))
            .map(|kind| kind.name().to_string())
            .collect();

        ResumeSummary {
            started_at: state.started_at,
            last_saved_at: state.last_saved_at,
            incomplete_tasks,
            pull_request_count: state.completed_primary_ids.len(),
            commit_id_count: state.completed_secondary_ids.len(),
            tasks,
        }
    }
}

async fn discard_file(path: &Path) -> StorageResult<()> {
    for target in [path.to_path_buf(), temp_path(path)] {
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&target, e)),
        }
    }
    Ok(())
}

/// One task's line in a resume summary
#[derive(Debug, Clone, PartialEq)]
pub struct TaskLine {
    pub task_name: String,
    pub completed: bool,
    pub processed: u64,
    pub total: u64,
    pub failed: usize,
    pub skipped: usize,
}

/// What a resumed run starts from
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeSummary {
    pub started_at: DateTime<Utc>,
    pub last_saved_at: DateTime<Utc>,
    /// Names of tasks not yet completed, in run order
    pub incomplete_tasks: Vec<String>,
    pub pull_request_count: usize,
    pub commit_id_count: usize,
    pub tasks: Vec<TaskLine>,
}

impl fmt::Display for ResumeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "started {}, last saved {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.last_saved_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(
            f,
            "known pull requests: {}, known commit ids: {}",
            self.pull_request_count, self.commit_id_count
        )?;
        for line in &self.tasks {
            let mark = if line.completed { "done" } else { "pending" };
            writeln!(
                f,
                "  {:<16} {:>7} {}/{} (failed {}, skipped {})",
                line.task_name, mark, line.processed, line.total, line.failed, line.skipped
            )?;
        }
        write!(f, "remaining: {}", self.incomplete_tasks.join(", "))
    }
}
