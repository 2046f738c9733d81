//! Runner registry - the set of currently connected runners

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, info, warn};

use bench_core::task::{Task, TaskId};

use super::machine::SessionState;
use super::protocol::RunnerActivity;

/// Commands a session accepts from the dispatcher
#[derive(Debug)]
pub enum SessionCommand {
    /// Start working on a task. The task comes back if the session can't take it.
    Assign {
        task: Task,
        reply: oneshot::Sender<Result<(), Task>>,
    },
    /// Abort a task. Replies whether the session was holding it.
    Abort {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
}

/// Observable snapshot of a connected runner
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    pub name: String,
    pub info: String,
    pub state: SessionState,
    /// What the runner last reported doing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<RunnerActivity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bench_hash: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Receiving ends of a session, owned by its driver
pub struct SessionChannels {
    pub commands: mpsc::Receiver<SessionCommand>,
    pub status: watch::Sender<RunnerStatus>,
}

/// Dispatcher-side handle to one runner session
pub struct RunnerHandle {
    name: String,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<RunnerStatus>,
    available: AtomicBool,
}

impl RunnerHandle {
    pub fn new(name: impl Into<String>) -> (Arc<Self>, SessionChannels) {
        let name = name.into();
        let (command_tx, command_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(RunnerStatus {
            name: name.clone(),
            info: String::new(),
            state: SessionState::Idle,
            activity: None,
            task_id: None,
            bench_hash: None,
            connected_at: Utc::now(),
        });

        let handle = Arc::new(Self {
            name,
            commands: command_tx,
            status: status_rx,
            available: AtomicBool::new(false),
        });
        (
            handle,
            SessionChannels {
                commands: command_rx,
                status: status_tx,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest status snapshot; never waits for the session
    pub fn status(&self) -> RunnerStatus {
        self.status.borrow().clone()
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Take the runner out of the idle pool. Only one caller can win.
    pub fn try_reserve(&self) -> bool {
        self.available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Hand a task to the session, getting it back if the session did not accept it
    pub async fn assign(&self, task: Task) -> Result<(), Task> {
        let fallback = task.clone();
        let (reply, rx) = oneshot::channel();
        let command = SessionCommand::Assign { task, reply };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command).await {
            debug!("Runner {} is gone, assignment refused", self.name);
            return match command {
                SessionCommand::Assign { task, .. } => Err(task),
                SessionCommand::Abort { .. } => Err(fallback),
            };
        }
        rx.await.unwrap_or(Err(fallback))
    }

    /// Ask the session to abort a task
    pub async fn abort(&self, task_id: TaskId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Abort { task_id, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// Connected runners by name
#[derive(Default)]
pub struct RunnerRegistry {
    runners: RwLock<HashMap<String, Arc<RunnerHandle>>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runner, refusing it if the name is taken
    pub async fn register(&self, handle: Arc<RunnerHandle>) -> bool {
        let mut runners = self.runners.write().await;
        if runners.contains_key(handle.name()) {
            warn!("Runner name {} is already in use", handle.name());
            return false;
        }
        info!("Registered runner {}", handle.name());
        runners.insert(handle.name().to_string(), handle);
        true
    }

    pub async fn unregister(&self, name: &str) -> Option<Arc<RunnerHandle>> {
        let removed = self.runners.write().await.remove(name);
        if removed.is_some() {
            info!("Runner {} unregistered", name);
        }
        removed
    }

    pub async fn get(&self, name: &str) -> Option<Arc<RunnerHandle>> {
        self.runners.read().await.get(name).cloned()
    }

    /// Snapshot of every runner, sorted by name
    pub async fn list(&self) -> Vec<RunnerStatus> {
        let runners = self.runners.read().await;
        let mut statuses: Vec<RunnerStatus> = runners.values().map(|h| h.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Reserve some idle runner, if any
    pub async fn reserve_idle(&self) -> Option<Arc<RunnerHandle>> {
        let runners = self.runners.read().await;
        let mut candidates: Vec<&Arc<RunnerHandle>> =
            runners.values().filter(|h| h.is_available()).collect();
        candidates.sort_by(|a, b| a.name().cmp(b.name()));
        candidates.into_iter().find(|h| h.try_reserve()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.runners.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_name_is_refused() {
        let registry = RunnerRegistry::new();
        let (first, _first_channels) = RunnerHandle::new("runner-1");
        let (second, _second_channels) = RunnerHandle::new("runner-1");

        assert!(registry.register(first).await);
        assert!(!registry.register(second).await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.unregister("runner-1").await.is_some());
        let (third, _third_channels) = RunnerHandle::new("runner-1");
        assert!(registry.register(third).await);
    }

    #[tokio::test]
    async fn test_list_reads_snapshots() {
        let registry = RunnerRegistry::new();
        let (b, b_channels) = RunnerHandle::new("b");
        let (a, _a_channels) = RunnerHandle::new("a");
        registry.register(b).await;
        registry.register(a).await;

        b_channels.status.send_modify(|status| {
            status.state = SessionState::Executing;
            status.info = "16 cores".to_string();
        });

        let list = registry.list().await;
        let names: Vec<&str> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(list[1].state, SessionState::Executing);
        assert_eq!(list[1].info, "16 cores");
    }

    #[tokio::test]
    async fn test_reserve_idle_is_exclusive() {
        let registry = RunnerRegistry::new();
        let (handle, _channels) = RunnerHandle::new("runner-1");
        registry.register(handle.clone()).await;

        assert!(registry.reserve_idle().await.is_none());
        handle.set_available(true);
        assert!(registry.reserve_idle().await.is_some());
        assert!(registry.reserve_idle().await.is_none());
        assert!(!handle.is_available());
    }

    #[tokio::test]
    async fn test_assign_to_closed_session_returns_task() {
        let (handle, channels) = RunnerHandle::new("runner-1");
        drop(channels);

        let task = Task::tar("alice", "upload", None);
        let returned = handle.assign(task.clone()).await.unwrap_err();
        assert_eq!(returned.id, task.id);
        assert!(!handle.abort(task.id).await);
    }

    #[tokio::test]
    async fn test_assign_dropped_reply_returns_task() {
        let (handle, mut channels) = RunnerHandle::new("runner-1");
        tokio::spawn(async move {
            // accept the command, then go away without answering
            let _ = channels.commands.recv().await;
        });

        let task = Task::tar("alice", "upload", None);
        let returned = handle.assign(task.clone()).await.unwrap_err();
        assert_eq!(returned.id, task.id);
    }
}
