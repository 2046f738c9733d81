//! File-based task storage implementation
//!
//! Stores tasks as JSON in a file on disk.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

use super::model::{Task, TaskId, TaskPriority};
use super::repository::{TaskPersistence, TaskSelector};
use crate::Result;

/// File-based task store using JSON
pub struct FileTaskStore {
    /// Path to the JSON file
    path: PathBuf,
    /// In-memory cache of tasks
    cache: RwLock<HashMap<TaskId, Task>>,
}

impl FileTaskStore {
    /// Create a new FileTaskStore
    ///
    /// If the file doesn't exist, it will be created on first write.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let tasks: Vec<Task> = serde_json::from_str(&content)?;
            tasks.into_iter().map(|t| (t.id, t)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    /// Apply `change` to a copy of the cache and keep the copy once it is on disk.
    ///
    /// `change` reports whether it modified anything; unmodified copies are not written.
    /// On a failed write the cache stays as it was.
    async fn commit<T>(&self, change: impl FnOnce(&mut HashMap<TaskId, Task>) -> (T, bool)) -> Result<T> {
        let mut cache = self.cache.write().await;
        let mut staged = cache.clone();
        let (value, changed) = change(&mut staged);
        if changed {
            self.persist(&staged).await?;
            *cache = staged;
        }
        Ok(value)
    }

    async fn persist(&self, tasks: &HashMap<TaskId, Task>) -> Result<()> {
        let tasks: Vec<&Task> = tasks.values().collect();
        let content = serde_json::to_string_pretty(&tasks)?;

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Atomic replace
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskPersistence for FileTaskStore {
    async fn insert_if_absent(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        self.commit(|cache| {
            let mut inserted = Vec::new();
            for task in tasks {
                if !cache.contains_key(&task.id) {
                    cache.insert(task.id, task.clone());
                    inserted.push(task);
                }
            }
            let changed = !inserted.is_empty();
            (inserted, changed)
        })
        .await
    }

    async fn claim_next(&self, selector: TaskSelector<'_>) -> Result<Option<Task>> {
        let claimed = self
            .commit(|cache| {
                let unclaimed: Vec<Task> = cache.values().filter(|t| !t.claimed).cloned().collect();
                let claimed = match selector(&unclaimed).and_then(|id| cache.get_mut(&id)) {
                    Some(task) if !task.claimed => {
                        task.claimed = true;
                        Some(task.clone())
                    }
                    _ => None,
                };
                let changed = claimed.is_some();
                (claimed, changed)
            })
            .await?;
        if let Some(task) = &claimed {
            debug!("Claimed task {}", task.id);
        }
        Ok(claimed)
    }

    async fn release(&self, id: TaskId) -> Result<bool> {
        self.commit(|cache| match cache.get_mut(&id) {
            Some(task) => {
                task.claimed = false;
                (true, true)
            }
            None => (false, false),
        })
        .await
    }

    async fn release_all(&self) -> Result<usize> {
        self.commit(|cache| {
            let count = cache
                .values_mut()
                .filter(|t| t.claimed)
                .map(|t| t.claimed = false)
                .count();
            (count, count > 0)
        })
        .await
    }

    async fn delete(&self, ids: &[TaskId]) -> Result<Vec<TaskId>> {
        self.commit(|cache| {
            let removed: Vec<TaskId> = ids
                .iter()
                .filter(|id| cache.remove(id).is_some())
                .copied()
                .collect();
            let changed = !removed.is_empty();
            (removed, changed)
        })
        .await
    }

    async fn delete_all(&self) -> Result<usize> {
        self.commit(|cache| {
            let count = cache.len();
            cache.clear();
            (count, true)
        })
        .await
    }

    async fn set_priority(&self, id: TaskId, priority: TaskPriority) -> Result<Option<Task>> {
        self.commit(|cache| {
            let updated = cache.get_mut(&id).map(|task| {
                task.priority = priority;
                task.updated_at = Utc::now();
                task.clone()
            });
            let changed = updated.is_some();
            (updated, changed)
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let cache = self.cache.read().await;
        Ok(cache.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let cache = self.cache.read().await;
        Ok(cache.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RepoId;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn create_test_store() -> (FileTaskStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.json");
        let store = FileTaskStore::new(&path).await.unwrap();
        (store, temp_dir)
    }

    fn commit_task() -> Task {
        Task::commit("listener", RepoId(Uuid::new_v4()), "deadbeef")
    }

    #[tokio::test]
    async fn test_insert_if_absent_skips_known_ids() {
        let (store, _temp) = create_test_store().await;

        let task = commit_task();
        let inserted = store.insert_if_absent(vec![task.clone()]).await.unwrap();
        assert_eq!(inserted.len(), 1);

        let again = store
            .insert_if_absent(vec![task.clone(), commit_task()])
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].id, task.id);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claim_marks_claimed_and_hides_from_selector() {
        let (store, _temp) = create_test_store().await;
        let task = commit_task();
        store.insert_if_absent(vec![task.clone()]).await.unwrap();

        let first = store
            .claim_next(&|tasks: &[Task]| tasks.first().map(|t| t.id))
            .await
            .unwrap();
        assert_eq!(first.map(|t| t.id), Some(task.id));

        let second = store
            .claim_next(&|tasks: &[Task]| tasks.first().map(|t| t.id))
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(store.release(task.id).await.unwrap());
        let stored = store.get(task.id).await.unwrap().unwrap();
        assert!(!stored.claimed);
    }

    #[tokio::test]
    async fn test_release_unknown_task() {
        let (store, _temp) = create_test_store().await;
        assert!(!store.release(TaskId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_priority_bumps_update_time() {
        let (store, _temp) = create_test_store().await;
        let old = Utc::now() - chrono::Duration::hours(1);
        let task = commit_task().with_inserted_at(old);
        store.insert_if_absent(vec![task.clone()]).await.unwrap();

        let updated = store
            .set_priority(task.id, TaskPriority::Manual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.priority, TaskPriority::Manual);
        assert!(updated.updated_at > old);
        assert_eq!(updated.inserted_at, old);
    }

    #[tokio::test]
    async fn test_persistence_survives_reload_and_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.json");

        let task = commit_task();
        {
            let store = FileTaskStore::new(&path).await.unwrap();
            store.insert_if_absent(vec![task.clone()]).await.unwrap();
            store
                .claim_next(&|tasks: &[Task]| tasks.first().map(|t| t.id))
                .await
                .unwrap();
        }

        let reloaded = FileTaskStore::new(&path).await.unwrap();
        assert!(reloaded.get(task.id).await.unwrap().unwrap().claimed);
        assert_eq!(reloaded.release_all().await.unwrap(), 1);
        assert!(!reloaded.get(task.id).await.unwrap().unwrap().claimed);
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _temp) = create_test_store().await;
        let a = commit_task();
        let b = commit_task();
        store.insert_if_absent(vec![a.clone(), b.clone()]).await.unwrap();

        let removed = store.delete(&[a.id, TaskId::new()]).await.unwrap();
        assert_eq!(removed, vec![a.id]);
        assert_eq!(store.delete_all().await.unwrap(), 1);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_untouched() {
        let (store, temp) = create_test_store().await;
        let task = commit_task();
        store.insert_if_absent(vec![task.clone()]).await.unwrap();

        // A directory where the temp file goes makes every write fail
        let blocker = temp.path().join("tasks.json.tmp");
        tokio::fs::create_dir(&blocker).await.unwrap();

        let pick_first = |tasks: &[Task]| tasks.first().map(|t| t.id);
        assert!(store.claim_next(&pick_first).await.is_err());
        assert!(!store.get(task.id).await.unwrap().unwrap().claimed);
        assert!(store.set_priority(task.id, TaskPriority::Manual).await.is_err());
        assert_eq!(store.get(task.id).await.unwrap().unwrap().priority, TaskPriority::Listener);
        assert!(store.delete(&[task.id]).await.is_err());
        assert!(store.get(task.id).await.unwrap().is_some());

        tokio::fs::remove_dir(&blocker).await.unwrap();
        let claimed = store.claim_next(&pick_first).await.unwrap();
        assert_eq!(claimed.map(|t| t.id), Some(task.id));
    }
}
