//! State module for quota tracking and task identity
//!
//! # Components
//!
//! - `QuotaGate`: Tracks the remaining API allowance and paces outbound requests
//! - `TaskKind` / `Phase`: Identify the units of work and the stage they run in
//! - `Subject`: The repository being harvested

mod quota;
mod task;

// Re-export main types
pub use quota::{QuotaGate, QuotaHeaders, QuotaPolicy, QuotaStatus, QuotaSummary};
pub use task::{DependencyType, Phase, Subject, TaskKind};
