//! Task persistence trait
//!
//! Defines the interface the task queue uses to store pending tasks.

use async_trait::async_trait;

use super::model::{Task, TaskId, TaskPriority};
use crate::Result;

/// Picks the next task out of the unclaimed tasks handed to it.
pub type TaskSelector<'a> = &'a (dyn Fn(&[Task]) -> Option<TaskId> + Send + Sync);

/// Durable storage for pending tasks.
///
/// Implementations must make every method atomic on its own; the queue adds a
/// single mutual-exclusion boundary on top so sequences of calls do not interleave.
#[async_trait]
pub trait TaskPersistence: Send + Sync {
    /// Insert all tasks whose id is not stored yet, returning the ones actually inserted
    async fn insert_if_absent(&self, tasks: Vec<Task>) -> Result<Vec<Task>>;

    /// Run `selector` over all unclaimed tasks and mark the selected one as claimed
    async fn claim_next(&self, selector: TaskSelector<'_>) -> Result<Option<Task>>;

    /// Mark a claimed task as unclaimed again. Returns false if the task is gone.
    async fn release(&self, id: TaskId) -> Result<bool>;

    /// Reset the claimed flag of every task, returning how many were claimed
    async fn release_all(&self) -> Result<usize>;

    /// Delete tasks by id, returning the ids that existed
    async fn delete(&self, ids: &[TaskId]) -> Result<Vec<TaskId>>;

    /// Delete every task
    async fn delete_all(&self) -> Result<usize>;

    /// Change a task's priority, bumping its update time
    async fn set_priority(&self, id: TaskId, priority: TaskPriority) -> Result<Option<Task>>;

    /// Get a task by id
    async fn get(&self, id: TaskId) -> Result<Option<Task>>;

    /// All stored tasks, claimed or not, in no particular order
    async fn list(&self) -> Result<Vec<Task>>;
}
