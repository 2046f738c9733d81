//! Task queue
//!
//! The queue is the single source of truth for which tasks are pending and
//! which are claimed. Every mutation goes through one mutex so that a claim can
//! never interleave with an insert, delete or reprioritisation.

mod policy;

pub use policy::Policy;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::task::{RepoId, Task, TaskId, TaskPersistence, TaskPriority};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct QueueState {
    /// Repository whose listener task was claimed last
    last_repo: Option<RepoId>,
}

pub struct TaskQueue {
    store: Arc<dyn TaskPersistence>,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskPersistence>) -> Self {
        Self::with_last_repo(store, None)
    }

    /// Create a queue whose round-robin rotation resumes after `last_repo`
    pub fn with_last_repo(store: Arc<dyn TaskPersistence>, last_repo: Option<RepoId>) -> Self {
        Self {
            store,
            state: Mutex::new(QueueState { last_repo }),
        }
    }

    /// Un-claim every task left claimed by a previous process
    pub async fn recover(&self) -> Result<usize> {
        let _state = self.state.lock().await;
        let count = self.store.release_all().await?;
        if count > 0 {
            info!("Recovered {} task(s) claimed before restart", count);
        }
        Ok(count)
    }

    /// Add tasks to the queue, returning the ones actually inserted.
    ///
    /// At most one task exists per commit. A new task for a commit that is
    /// already queued is dropped, unless it is more urgent, in which case the
    /// existing task is promoted to the new priority instead.
    pub async fn insert(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        let _state = self.state.lock().await;
        let existing = self.store.list().await?;

        let mut to_insert: Vec<Task> = Vec::new();
        for task in tasks {
            let duplicate = task.source.commit().and_then(|commit| {
                existing
                    .iter()
                    .chain(to_insert.iter())
                    .find(|other| other.source.commit() == Some(commit))
                    .map(|other| (other.id, other.priority))
            });

            match duplicate {
                Some((id, priority)) if task.priority.is_more_urgent_than(priority) => {
                    if let Some(pos) = to_insert.iter().position(|t| t.id == id) {
                        to_insert[pos].priority = task.priority;
                    } else {
                        self.store.set_priority(id, task.priority).await?;
                        info!("Promoted task {} to {:?}", id, task.priority);
                    }
                }
                Some((id, _)) => debug!("Task for commit already queued as {}", id),
                None => to_insert.push(task),
            }
        }

        let inserted = self.store.insert_if_absent(to_insert).await?;
        for task in &inserted {
            info!("Queued task {} ({:?}) by {}", task.id, task.priority, task.author);
        }
        Ok(inserted)
    }

    /// Atomically select and claim the next task according to the policy
    pub async fn claim_next(&self) -> Result<Option<Task>> {
        let mut state = self.state.lock().await;
        let last_repo = state.last_repo;
        let selector = move |tasks: &[Task]| Policy::new(tasks.to_vec(), last_repo).next().map(|t| t.id);

        let claimed = self.store.claim_next(&selector).await?;
        if let Some(task) = &claimed {
            if task.priority == TaskPriority::Listener {
                if let Some(repo) = task.repo_id() {
                    state.last_repo = Some(repo);
                }
            }
            debug!("Claimed task {} for execution", task.id);
        }
        Ok(claimed)
    }

    /// Return a claimed task to the pending set. Returns false if it was deleted meanwhile.
    pub async fn release(&self, id: TaskId) -> Result<bool> {
        let _state = self.state.lock().await;
        let released = self.store.release(id).await?;
        if released {
            info!("Task {} returned to the queue", id);
        }
        Ok(released)
    }

    /// Delete tasks, returning the ids that were present
    pub async fn delete(&self, ids: &[TaskId]) -> Result<Vec<TaskId>> {
        let _state = self.state.lock().await;
        let removed = self.store.delete(ids).await?;
        if !removed.is_empty() {
            info!("Deleted {} task(s) from the queue", removed.len());
        }
        Ok(removed)
    }

    /// Delete every task of a repository
    pub async fn delete_repo(&self, repo: RepoId) -> Result<Vec<TaskId>> {
        let _state = self.state.lock().await;
        let ids: Vec<TaskId> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|t| t.repo_id() == Some(repo))
            .map(|t| t.id)
            .collect();
        let removed = self.store.delete(&ids).await?;
        info!("Deleted {} task(s) of repo {}", removed.len(), repo);
        Ok(removed)
    }

    /// Delete all tasks, returning the ids that were present
    pub async fn delete_all(&self) -> Result<Vec<TaskId>> {
        let _state = self.state.lock().await;
        let ids: Vec<TaskId> = self.store.list().await?.into_iter().map(|t| t.id).collect();
        self.store.delete_all().await?;
        info!("Deleted all {} task(s)", ids.len());
        Ok(ids)
    }

    /// Move a task to another priority tier
    pub async fn set_priority(&self, id: TaskId, priority: TaskPriority) -> Result<Task> {
        let _state = self.state.lock().await;
        self.store
            .set_priority(id, priority)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Pending tasks in the order `claim_next` would hand them out
    pub async fn list_ordered(&self) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        let pending = self.store.list().await?.into_iter().filter(|t| !t.claimed);
        Ok(Policy::new(pending, state.last_repo).collect())
    }

    /// Tasks currently claimed by a runner, oldest insertion first
    pub async fn in_progress(&self) -> Result<Vec<Task>> {
        let _state = self.state.lock().await;
        let mut claimed: Vec<Task> = self.store.list().await?.into_iter().filter(|t| t.claimed).collect();
        claimed.sort_by_key(|t| (t.inserted_at, t.id));
        Ok(claimed)
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        self.store.get(id).await
    }

    /// Ids of every stored task
    pub async fn ids(&self) -> Result<HashSet<TaskId>> {
        Ok(self.store.list().await?.into_iter().map(|t| t.id).collect())
    }

    pub async fn last_repo(&self) -> Option<RepoId> {
        self.state.lock().await.last_repo
    }
}
