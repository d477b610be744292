//! Phase planning and batch sizing
//!
//! The scheduler decides which tasks a phase still has to run, whether a
//! task's prerequisites allow it to run or to be marked completed, and how
//! many requests a fan-out batch may issue at once.

use crate::state::{Phase, TaskKind};
use crate::storage::CheckpointStore;
use crate::HarvestError;

/// Remaining quota below which commit detail batches shrink to the minimum
const LOW_QUOTA: u64 = 500;

/// Remaining quota below which commit detail batches are halved
const MODERATE_QUOTA: u64 = 1000;

/// Largest batch the commit detail task ever issues
const MAX_DETAIL_BATCH: usize = 20;

/// Largest batch a per-PR dependency task issues
const MAX_DEPENDENCY_BATCH: usize = 10;

/// Batch size for commit details given the remaining quota
///
/// Never increases as `remaining` decreases: 20 down to 10 below 1000, down
/// to 5 below 500. The configured maximum caps every tier, so it is also a
/// hard ceiling on requests in flight.
pub fn detail_batch_size(remaining: u64, configured_max: usize) -> usize {
    let tier = if remaining < LOW_QUOTA {
        5
    } else if remaining < MODERATE_QUOTA {
        10
    } else {
        MAX_DETAIL_BATCH
    };
    tier.min(configured_max).max(1)
}

/// Batch size for per-PR dependency fan-out
pub fn dependency_batch_size(configured_max: usize) -> usize {
    configured_max.clamp(1, MAX_DEPENDENCY_BATCH)
}

/// Tasks of `phase` that are not yet completed, in sequence order
pub fn pending_tasks(phase: Phase, checkpoint: &CheckpointStore) -> Vec<TaskKind> {
    phase
        .tasks()
        .into_iter()
        .filter(|kind| {
            let done = checkpoint.is_completed(*kind);
            if done {
                tracing::info!(task = kind.name(), "Already completed, skipping");
            }
            !done
        })
        .collect()
}

/// Checks that the prerequisites needed to run `kind` are completed
pub fn check_runnable(kind: TaskKind, checkpoint: &CheckpointStore) -> Result<(), HarvestError> {
    match kind
        .hard_upstream()
        .iter()
        .find(|up| !checkpoint.is_completed(**up))
    {
        Some(missing) => Err(HarvestError::MissingDependency {
            task: kind.name().to_string(),
            requires: missing.name().to_string(),
        }),
        None => Ok(()),
    }
}

/// Whether every task `kind` consumes has completed
pub fn upstream_completed(kind: TaskKind, checkpoint: &CheckpointStore) -> bool {
    kind.upstream().iter().all(|up| checkpoint.is_completed(*up))
}
