//! Archive provider
//!
//! Runners receive two kinds of archives: the shared benchmark tooling
//! repository and the payload of the task they execute. Both are produced
//! elsewhere and handed to the dispatcher as byte streams.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::task::{Task, TaskSource};
use crate::{Error, Result};

/// Archive bytes, in the order they are sent
pub type ArchiveStream = BoxStream<'static, std::io::Result<Bytes>>;

#[async_trait]
pub trait ArchiveProvider: Send + Sync {
    /// Hash of the current benchmark tooling
    async fn bench_hash(&self) -> Result<String>;

    /// Tar archive of the benchmark tooling
    async fn bench_archive(&self) -> Result<ArchiveStream>;

    /// Tar archive of the task's source
    async fn task_archive(&self, task: &Task) -> Result<ArchiveStream>;
}

/// Serves archives that were prepared on disk:
///
/// ```text
/// <root>/bench-repo.tar
/// <root>/bench-repo.hash
/// <root>/tars/<task id>.tar
/// <root>/commits/<repo id>/<commit hash>.tar
/// ```
pub struct DirArchiveProvider {
    root: PathBuf,
    chunk_size: usize,
}

impl DirArchiveProvider {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            root: root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, task: &Task) -> Result<PathBuf> {
        match &task.source {
            TaskSource::Tar { .. } => Ok(self.root.join("tars").join(format!("{}.tar", task.id))),
            TaskSource::Commit {
                repo_id,
                commit_hash,
            } => {
                if commit_hash.is_empty() || !commit_hash.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(Error::InvalidInput(format!(
                        "Invalid commit hash: {:?}",
                        commit_hash
                    )));
                }
                Ok(self
                    .root
                    .join("commits")
                    .join(repo_id.to_string())
                    .join(format!("{}.tar", commit_hash)))
            }
        }
    }

    async fn open(&self, path: &Path) -> Result<ArchiveStream> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::Archive(format!("No archive at {}", path.display())))
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Streaming archive {}", path.display());
        Ok(ReaderStream::with_capacity(file, self.chunk_size).boxed())
    }
}

#[async_trait]
impl ArchiveProvider for DirArchiveProvider {
    async fn bench_hash(&self) -> Result<String> {
        let path = self.root.join("bench-repo.hash");
        match tokio::fs::read_to_string(&path).await {
            Ok(hash) => Ok(hash.trim().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::Archive("Benchmark tooling hash is not available".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn bench_archive(&self) -> Result<ArchiveStream> {
        self.open(&self.root.join("bench-repo.tar")).await
    }

    async fn task_archive(&self, task: &Task) -> Result<ArchiveStream> {
        let path = self.task_path(task)?;
        self.open(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RepoId;
    use futures::TryStreamExt;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn collect(stream: ArchiveStream) -> Vec<Bytes> {
        stream.try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_bench_archive_and_hash() {
        let temp_dir = TempDir::new().unwrap();
        tokio::fs::write(temp_dir.path().join("bench-repo.tar"), vec![7u8; 10])
            .await
            .unwrap();
        tokio::fs::write(temp_dir.path().join("bench-repo.hash"), "cafe\n")
            .await
            .unwrap();

        let provider = DirArchiveProvider::new(temp_dir.path(), 4);
        assert_eq!(provider.bench_hash().await.unwrap(), "cafe");

        let chunks = collect(provider.bench_archive().await.unwrap()).await;
        assert!(chunks.iter().all(|c| c.len() <= 4));
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 10);
    }

    #[tokio::test]
    async fn test_task_archives() {
        let temp_dir = TempDir::new().unwrap();
        let repo = RepoId(Uuid::new_v4());
        let commit = Task::commit("listener", repo, "abc123");
        let tar = Task::tar("alice", "upload", None);

        let commit_dir = temp_dir.path().join("commits").join(repo.to_string());
        tokio::fs::create_dir_all(&commit_dir).await.unwrap();
        tokio::fs::write(commit_dir.join("abc123.tar"), b"commit").await.unwrap();
        tokio::fs::create_dir_all(temp_dir.path().join("tars")).await.unwrap();
        tokio::fs::write(temp_dir.path().join("tars").join(format!("{}.tar", tar.id)), b"tar")
            .await
            .unwrap();

        let provider = DirArchiveProvider::new(temp_dir.path(), 1024);
        let chunks = collect(provider.task_archive(&commit).await.unwrap()).await;
        assert_eq!(chunks.concat(), b"commit");
        let chunks = collect(provider.task_archive(&tar).await.unwrap()).await;
        assert_eq!(chunks.concat(), b"tar");
    }

    #[tokio::test]
    async fn test_missing_archive_and_bad_hash() {
        let temp_dir = TempDir::new().unwrap();
        let provider = DirArchiveProvider::new(temp_dir.path(), 1024);

        assert!(matches!(provider.bench_hash().await, Err(Error::Archive(_))));
        assert!(matches!(provider.bench_archive().await, Err(Error::Archive(_))));

        let sneaky = Task::commit("x", RepoId(Uuid::new_v4()), "../../etc/passwd");
        assert!(matches!(
            provider.task_archive(&sneaky).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
