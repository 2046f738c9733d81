use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::run_model::Run;
use super::sink::ResultSink;
use crate::task::TaskId;
use crate::{Error, Result};

/// Stores every run as `runs/<id>.json` under the data directory
pub struct FileRunStore {
    base_dir: PathBuf,
}

impl FileRunStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: data_dir.as_ref().join("runs"),
        }
    }

    fn run_path(&self, id: TaskId) -> PathBuf {
        self.base_dir.join(format!("{}.json", id))
    }

    pub async fn load_run(&self, id: TaskId) -> Result<Run> {
        let path = self.run_path(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::TaskNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// All recorded runs, most recently finished first
    pub async fn list_runs(&self) -> Result<Vec<Run>> {
        if !tokio::fs::try_exists(&self.base_dir).await? {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to read run file {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_str::<Run>(&content) {
                Ok(run) => runs.push(run),
                Err(e) => {
                    warn!("Failed to parse run file {}: {}", path.display(), e);
                    continue;
                }
            }
        }

        runs.sort_by(|a, b| b.stop_time.cmp(&a.stop_time));
        Ok(runs)
    }
}

#[async_trait]
impl ResultSink for FileRunStore {
    async fn record_run(&self, run: &Run) -> Result<bool> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.run_path(run.id);
        let json = serde_json::to_vec_pretty(run)?;

        // create_new makes the existence check and the creation one step
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Run {} already recorded", run.id);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = async {
            file.write_all(&json).await?;
            file.sync_all().await
        }
        .await
        {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }

        info!("Recorded run {} from runner {}", run.id, run.runner_name);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunError, RunErrorKind, RunResult};
    use crate::task::Task;
    use chrono::Utc;
    use tempfile::TempDir;

    fn failed_run(task: &Task, message: &str) -> Run {
        Run::finish(
            task,
            "runner-1",
            "",
            Utc::now(),
            RunResult::Error(RunError::new(RunErrorKind::BenchScript, message)),
        )
    }

    #[tokio::test]
    async fn test_record_run_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileRunStore::new(temp_dir.path());
        let task = Task::tar("alice", "upload", None);

        assert!(store.record_run(&failed_run(&task, "first")).await.unwrap());
        assert!(!store.record_run(&failed_run(&task, "second")).await.unwrap());

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        let stored = store.load_run(task.id).await.unwrap();
        assert_eq!(
            stored.result,
            RunResult::Error(RunError::new(RunErrorKind::BenchScript, "first"))
        );
    }

    #[tokio::test]
    async fn test_concurrent_records_store_once() {
        let temp_dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(FileRunStore::new(temp_dir.path()));
        let task = Task::tar("alice", "upload", None);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let run = failed_run(&task, &format!("attempt {}", i));
            handles.push(tokio::spawn(async move { store.record_run(&run).await.unwrap() }));
        }

        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);
        assert_eq!(store.list_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_run() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileRunStore::new(temp_dir.path());
        assert!(store.list_runs().await.unwrap().is_empty());
        assert!(matches!(
            store.load_run(TaskId::new()).await,
            Err(Error::TaskNotFound(_))
        ));
    }
}
