//! Task model definitions

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a queued task. A recorded run reuses it as its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a tracked repository.
///
/// Ordering is the lexicographic order of the hyphenated id, which the
/// round-robin band of the queue relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(pub Uuid);

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Priority tier of a task. Lower numeric value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Explicitly requested by a user, including re-runs
    Manual = 0,
    /// Uploaded archive
    Tar = 1,
    /// Commit discovered by a repository listener
    Listener = 2,
}

impl TaskPriority {
    pub fn as_int(self) -> u8 {
        self as u8
    }

    /// Whether `self` is served before `other`
    pub fn is_more_urgent_than(self, other: TaskPriority) -> bool {
        self < other
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Listener
    }
}

/// What a task benchmarks: a commit of a tracked repository or an uploaded archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSource {
    #[serde(rename_all = "camelCase")]
    Commit { repo_id: RepoId, commit_hash: String },
    #[serde(rename_all = "camelCase")]
    Tar {
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo_id: Option<RepoId>,
    },
}

impl TaskSource {
    pub fn repo_id(&self) -> Option<RepoId> {
        match self {
            Self::Commit { repo_id, .. } => Some(*repo_id),
            Self::Tar { repo_id, .. } => *repo_id,
        }
    }

    /// The `(repo, hash)` pair of a commit source
    pub fn commit(&self) -> Option<(RepoId, &str)> {
        match self {
            Self::Commit {
                repo_id,
                commit_hash,
            } => Some((*repo_id, commit_hash.as_str())),
            Self::Tar { .. } => None,
        }
    }
}

/// A queued, not yet executed unit of benchmark work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub author: String,
    pub priority: TaskPriority,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source: TaskSource,
    #[serde(default)]
    pub claimed: bool,
}

impl Task {
    /// Create a new unclaimed task with listener priority
    pub fn new(author: impl Into<String>, source: TaskSource) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            author: author.into(),
            priority: TaskPriority::default(),
            inserted_at: now,
            updated_at: now,
            source,
            claimed: false,
        }
    }

    /// Task benchmarking a commit
    pub fn commit(author: impl Into<String>, repo_id: RepoId, commit_hash: impl Into<String>) -> Self {
        Self::new(
            author,
            TaskSource::Commit {
                repo_id,
                commit_hash: commit_hash.into(),
            },
        )
    }

    /// Task benchmarking an uploaded archive
    pub fn tar(author: impl Into<String>, description: impl Into<String>, repo_id: Option<RepoId>) -> Self {
        Self::new(
            author,
            TaskSource::Tar {
                description: description.into(),
                repo_id,
            },
        )
        .with_priority(TaskPriority::Tar)
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set both timestamps
    pub fn with_inserted_at(mut self, at: DateTime<Utc>) -> Self {
        self.inserted_at = at;
        self.updated_at = at;
        self
    }

    /// Set the last-update timestamp only
    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    pub fn repo_id(&self) -> Option<RepoId> {
        self.source.repo_id()
    }
}
