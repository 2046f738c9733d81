//! Queue ordering policy
//!
//! Tasks are served in three bands:
//! 1. Manual tasks, most recently promoted first
//! 2. Tar tasks, most recently inserted first
//! 3. Listener tasks, round-robin over repositories in id order, most recently
//!    inserted first within a repository
//!
//! A `Policy` is a snapshot: it is built from the current unclaimed tasks and
//! the repository served last, and yields tasks in the order repeated claims
//! would return them.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};

use crate::task::{RepoId, Task, TaskPriority};

#[derive(Debug, Clone, Default)]
pub struct Policy {
    manual: VecDeque<Task>,
    tar: VecDeque<Task>,
    repos: BTreeMap<RepoId, VecDeque<Task>>,
    repoless: VecDeque<Task>,
    last_repo: Option<RepoId>,
}

impl Policy {
    pub fn new(tasks: impl IntoIterator<Item = Task>, last_repo: Option<RepoId>) -> Self {
        let mut manual = Vec::new();
        let mut tar = Vec::new();
        let mut repos: BTreeMap<RepoId, Vec<Task>> = BTreeMap::new();
        let mut repoless = Vec::new();

        for task in tasks {
            match task.priority {
                TaskPriority::Manual => manual.push(task),
                TaskPriority::Tar => tar.push(task),
                TaskPriority::Listener => match task.repo_id() {
                    Some(repo) => repos.entry(repo).or_default().push(task),
                    None => repoless.push(task),
                },
            }
        }

        manual.sort_by_key(|t| (Reverse(t.updated_at), t.id));
        tar.sort_by_key(|t| (Reverse(t.inserted_at), t.id));
        repoless.sort_by_key(|t| (Reverse(t.inserted_at), t.id));

        Self {
            manual: manual.into(),
            tar: tar.into(),
            repos: repos
                .into_iter()
                .map(|(repo, mut tasks)| {
                    tasks.sort_by_key(|t| (Reverse(t.inserted_at), t.id));
                    (repo, tasks.into())
                })
                .collect(),
            repoless: repoless.into(),
            last_repo,
        }
    }

    /// The repository whose listener task was yielded last
    pub fn last_repo(&self) -> Option<RepoId> {
        self.last_repo
    }

    /// The repository the round-robin band serves next.
    ///
    /// `last_repo` need not have tasks left; it only anchors the rotation.
    fn next_repo(&self) -> Option<RepoId> {
        self.last_repo
            .and_then(|last| self.repos.range((Excluded(last), Unbounded)).next())
            .or_else(|| self.repos.iter().next())
            .map(|(repo, _)| *repo)
    }

    fn step_round_robin(&mut self) -> Option<Task> {
        let repo = self.next_repo()?;
        let queue = self.repos.get_mut(&repo)?;
        let task = queue.pop_front();
        if queue.is_empty() {
            self.repos.remove(&repo);
        }
        self.last_repo = Some(repo);
        task
    }
}

impl Iterator for Policy {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        if let Some(task) = self.manual.pop_front() {
            return Some(task);
        }
        if let Some(task) = self.tar.pop_front() {
            return Some(task);
        }
        if let Some(task) = self.step_round_robin() {
            return Some(task);
        }
        self.repoless.pop_front()
    }
}
