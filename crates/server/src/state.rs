//! Application state

use std::sync::Arc;

use sha2::{Digest, Sha256};

use bench_core::archive::DirArchiveProvider;
use bench_core::queue::TaskQueue;
use bench_core::run::FileRunStore;
use bench_core::task::FileTaskStore;

use crate::config::{ServerConfig, SessionConfig};
use crate::dispatcher::Dispatcher;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    dispatcher: Arc<Dispatcher>,
    token_digest: [u8; 32],
    session: SessionConfig,
}

impl AppState {
    /// Open the stores under the configured directories and recover the queue
    pub async fn new(config: &ServerConfig) -> bench_core::Result<Self> {
        let task_store = FileTaskStore::new(config.data_dir.join("tasks.json")).await?;
        let queue = Arc::new(TaskQueue::new(Arc::new(task_store)));
        queue.recover().await?;

        let dispatcher = Dispatcher::new(
            queue,
            Arc::new(FileRunStore::new(&config.data_dir)),
            Arc::new(DirArchiveProvider::new(&config.archive_dir, config.chunk_size)),
        );
        Ok(Self::with_dispatcher(
            Arc::new(dispatcher),
            &config.runner_token,
            config.session.clone(),
        ))
    }

    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>, runner_token: &str, session: SessionConfig) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                dispatcher,
                token_digest: digest(runner_token),
                session,
            }),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.inner.session
    }

    /// Check a token presented by a runner
    ///
    /// Digests are compared over every byte so timing does not leak the match length.
    pub fn token_matches(&self, token: &str) -> bool {
        digests_equal(&digest(token), &self.inner.token_digest)
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

fn digests_equal(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
pub(crate) async fn build_test_state() -> (AppState, tempfile::TempDir) {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let data_dir = temp_dir.path().to_string_lossy().to_string();
    let config = ServerConfig::from_lookup(|name| match name {
        "BENCH_DATA_DIR" => Some(data_dir.clone()),
        "BENCH_RUNNER_TOKEN" => Some("secret".to_string()),
        _ => None,
    })
    .unwrap();
    let state = AppState::new(&config).await.unwrap();
    (state, temp_dir)
}
