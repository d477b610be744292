//! Storage module for persisting harvest progress and data
//!
//! This module handles everything written to disk, including:
//! - The per-subject checkpoint snapshot and its atomic persistence
//! - The deterministic output tree and its atomic artifact writes
//! - Rediscovery of derived identifiers from an existing tree

mod checkpoint;
mod layout;
mod traits;

pub use checkpoint::{
    load_snapshot, CheckpointSnapshot, CheckpointStore, ResumeSummary, TaskLine, TaskProgress,
};
pub use layout::{
    artifact_exists, extract_commit_shas, extract_pull_numbers, extract_review_commit_ids,
    is_valid_commit_id, read_json_if_exists, write_json_atomic, OutputLayout,
};
pub use traits::{StorageError, StorageResult};
