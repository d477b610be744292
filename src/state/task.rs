//! Task, phase and subject identifiers shared by the crawler and the checkpoint

use crate::config::validate_subject_segment;
use crate::ConfigError;
use std::fmt;

/// The repository being harvested
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    owner: String,
    name: String,
}

impl Subject {
    /// Creates a subject after checking both segments are path-safe
    pub fn new(owner: &str, name: &str) -> Result<Self, ConfigError> {
        validate_subject_segment(owner)?;
        validate_subject_segment(name)?;
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory name used for this subject's output tree
    pub fn folder_name(&self) -> String {
        format!("{}-{}", self.owner, self.name)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Per-pull-request resource kinds fetched by the dependency fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyType {
    Files,
    Reviews,
    Commits,
    Comments,
}

impl DependencyType {
    /// Folder segment under `pull/<n>/` and endpoint suffix under `pulls/<n>/`
    ///
    /// The two coincide for every kind: review comments live at
    /// `pulls/<n>/comments` upstream.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Reviews => "reviews",
            Self::Commits => "commits",
            Self::Comments => "comments",
        }
    }

    pub fn all() -> [Self; 4] {
        [Self::Files, Self::Reviews, Self::Commits, Self::Comments]
    }

    pub fn task_kind(&self) -> TaskKind {
        match self {
            Self::Files => TaskKind::PrFiles,
            Self::Reviews => TaskKind::PrReviews,
            Self::Commits => TaskKind::PrCommits,
            Self::Comments => TaskKind::PrComments,
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every unit of work the orchestrator schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    // ===== Foundation =====
    /// Paginated list of every pull request
    PullRequests,

    /// Paginated list of every commit on the default branch
    Commits,

    // ===== Dependency fan-out =====
    PrFiles,
    PrReviews,
    PrCommits,
    PrComments,

    // ===== Detail fan-out =====
    /// One detail document per discovered commit id
    CommitDetails,
}

impl TaskKind {
    /// Stable name used as the checkpoint key
    pub fn name(&self) -> &'static str {
        match self {
            Self::PullRequests => "pull_requests",
            Self::Commits => "commits",
            Self::PrFiles => "pr_files",
            Self::PrReviews => "pr_reviews",
            Self::PrCommits => "pr_commits",
            Self::PrComments => "pr_comments",
            Self::CommitDetails => "single_commits",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::sequence().into_iter().find(|kind| kind.name() == name)
    }

    /// All tasks in the order a complete run finishes them
    pub fn sequence() -> [Self; 7] {
        [
            Self::PullRequests,
            Self::Commits,
            Self::PrFiles,
            Self::PrReviews,
            Self::PrCommits,
            Self::PrComments,
            Self::CommitDetails,
        ]
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::PullRequests | Self::Commits => Phase::Foundation,
            Self::PrFiles | Self::PrReviews | Self::PrCommits | Self::PrComments => {
                Phase::DependencyFanOut
            }
            Self::CommitDetails => Phase::DetailFanOut,
        }
    }

    /// Tasks whose completed output this task consumes
    pub fn upstream(&self) -> &'static [TaskKind] {
        match self {
            Self::PullRequests | Self::Commits => &[],
            Self::PrFiles | Self::PrReviews | Self::PrCommits | Self::PrComments => {
                &[TaskKind::PullRequests]
            }
            Self::CommitDetails => &[TaskKind::Commits, TaskKind::PrReviews],
        }
    }

    /// Upstream tasks without which running this task is pointless
    ///
    /// Commit details can still make progress on the ids known so far, so it
    /// has none; it is simply not marked completed until its upstream is.
    pub fn hard_upstream(&self) -> &'static [TaskKind] {
        match self {
            Self::CommitDetails => &[],
            other => other.upstream(),
        }
    }

    pub fn dependency_type(&self) -> Option<DependencyType> {
        match self {
            Self::PrFiles => Some(DependencyType::Files),
            Self::PrReviews => Some(DependencyType::Reviews),
            Self::PrCommits => Some(DependencyType::Commits),
            Self::PrComments => Some(DependencyType::Comments),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Strictly ordered stages of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Bulk collections, run one after the other
    Foundation,

    /// Per-pull-request dependents, run concurrently
    DependencyFanOut,

    /// Per-commit detail documents
    DetailFanOut,
}

impl Phase {
    pub fn all() -> [Self; 3] {
        [Self::Foundation, Self::DependencyFanOut, Self::DetailFanOut]
    }

    /// Tasks belonging to this phase, in sequence order
    pub fn tasks(&self) -> Vec<TaskKind> {
        TaskKind::sequence()
            .into_iter()
            .filter(|kind| kind.phase() == *self)
            .collect()
    }

    /// Whether the phase's tasks are started together
    pub fn is_concurrent(&self) -> bool {
        matches!(self, Self::DependencyFanOut)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Foundation => "foundation",
            Self::DependencyFanOut => "dependency fan-out",
            Self::DetailFanOut => "detail fan-out",
        };
        f.write_str(name)
    }
}
