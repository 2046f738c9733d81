//! Dispatcher - matches idle runners to queued tasks

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bench_core::archive::ArchiveProvider;
use bench_core::queue::TaskQueue;
use bench_core::run::{ResultSink, Run};
use bench_core::task::{RepoId, Task, TaskId};

use crate::runner::registry::{RunnerHandle, RunnerRegistry, RunnerStatus};

/// Things that happened in the dispatcher, for anyone interested
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    RunRecorded { run_id: TaskId, runner: String },
    TaskReleased { task_id: TaskId },
    RunnerConnected { name: String },
    RunnerDisconnected { name: String },
}

pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    registry: RunnerRegistry,
    results: Arc<dyn ResultSink>,
    archives: Arc<dyn ArchiveProvider>,
    /// Which runner holds which task
    in_flight: Mutex<HashMap<TaskId, String>>,
    /// Serializes reserve-claim-assign rounds
    assign_lock: Mutex<()>,
    wake: Notify,
    event_tx: broadcast::Sender<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<TaskQueue>,
        results: Arc<dyn ResultSink>,
        archives: Arc<dyn ArchiveProvider>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            queue,
            registry: RunnerRegistry::new(),
            results,
            archives,
            in_flight: Mutex::new(HashMap::new()),
            assign_lock: Mutex::new(()),
            wake: Notify::new(),
            event_tx,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn archives(&self) -> &Arc<dyn ArchiveProvider> {
        &self.archives
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.event_tx.subscribe()
    }

    fn publish(&self, event: DispatchEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Run `assign_work` every time a runner becomes idle
    pub fn spawn_assigner(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                dispatcher.wake.notified().await;
                dispatcher.assign_work().await;
            }
        })
    }

    /// Log every dispatch event
    pub fn spawn_event_log(&self) -> JoinHandle<()> {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => debug!("Dispatch event: {:?}", event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event log fell behind, skipped {} event(s)", skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Schedule an assignment round
    pub fn notify_idle(&self) {
        self.wake.notify_one();
    }

    /// Register a runner. Returns false if the name is already in use.
    pub async fn add_runner(&self, handle: Arc<RunnerHandle>) -> bool {
        let name = handle.name().to_string();
        if !self.registry.register(handle).await {
            return false;
        }
        self.publish(DispatchEvent::RunnerConnected { name });
        true
    }

    pub async fn remove_runner(&self, name: &str) {
        if self.registry.unregister(name).await.is_some() {
            self.publish(DispatchEvent::RunnerDisconnected {
                name: name.to_string(),
            });
        }
    }

    pub async fn list_runners(&self) -> Vec<RunnerStatus> {
        self.registry.list().await
    }

    pub async fn runner_count(&self) -> usize {
        self.registry.len().await
    }

    /// Queue tasks and try to hand them out right away
    pub async fn enqueue(&self, tasks: Vec<Task>) -> bench_core::Result<Vec<Task>> {
        let inserted = self.queue.insert(tasks).await?;
        if !inserted.is_empty() {
            self.assign_work().await;
        }
        Ok(inserted)
    }

    /// Hand queued tasks to idle runners until one of them runs out
    pub async fn assign_work(&self) {
        let _guard = self.assign_lock.lock().await;

        loop {
            let Some(runner) = self.registry.reserve_idle().await else {
                return;
            };

            let task = match self.queue.claim_next().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    runner.set_available(true);
                    return;
                }
                Err(e) => {
                    error!("Failed to claim next task: {}", e);
                    runner.set_available(true);
                    return;
                }
            };

            let task_id = task.id;
            self.in_flight
                .lock()
                .await
                .insert(task_id, runner.name().to_string());

            match runner.assign(task).await {
                Ok(()) => info!("Assigned task {} to runner {}", task_id, runner.name()),
                Err(task) => {
                    warn!("Runner {} did not take task {}", runner.name(), task_id);
                    self.return_to_queue(task.id).await;
                }
            }
        }
    }

    /// Abort a task on whichever runner holds it. Returns false if no runner does.
    pub async fn abort(&self, task_id: TaskId) -> bool {
        let runner_name = self.in_flight.lock().await.get(&task_id).cloned();
        let Some(runner_name) = runner_name else {
            debug!("Abort for task {} which no runner holds", task_id);
            return false;
        };
        let Some(runner) = self.registry.get(&runner_name).await else {
            return false;
        };

        let aborted = runner.abort(task_id).await;
        if aborted {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.get(&task_id) == Some(&runner_name) {
                in_flight.remove(&task_id);
            }
            info!("Aborted task {} on runner {}", task_id, runner_name);
        }
        aborted
    }

    /// Delete tasks from the queue, aborting the ones a runner is working on
    pub async fn delete_tasks(&self, ids: &[TaskId]) -> bench_core::Result<Vec<TaskId>> {
        let deleted = self.queue.delete(ids).await?;
        self.abort_deleted(&deleted).await;
        Ok(deleted)
    }

    pub async fn delete_repo_tasks(&self, repo: RepoId) -> bench_core::Result<Vec<TaskId>> {
        let deleted = self.queue.delete_repo(repo).await?;
        self.abort_deleted(&deleted).await;
        Ok(deleted)
    }

    pub async fn clear_queue(&self) -> bench_core::Result<Vec<TaskId>> {
        let deleted = self.queue.delete_all().await?;
        self.abort_deleted(&deleted).await;
        Ok(deleted)
    }

    // Deletion comes first so an aborted task cannot be handed out again
    async fn abort_deleted(&self, ids: &[TaskId]) {
        for id in ids {
            if self.holder(*id).await.is_some() {
                self.abort(*id).await;
            }
        }
    }

    /// Runner currently holding a task
    pub async fn holder(&self, task_id: TaskId) -> Option<String> {
        self.in_flight.lock().await.get(&task_id).cloned()
    }

    /// Record a finished run and drop its task from the queue
    pub async fn complete_run(&self, run: Run) {
        match self.results.record_run(&run).await {
            Ok(recorded) => {
                if !recorded {
                    debug!("Run {} was recorded before", run.id);
                }
                self.in_flight.lock().await.remove(&run.id);
                if let Err(e) = self.queue.delete(&[run.id]).await {
                    error!("Failed to delete finished task {}: {}", run.id, e);
                }
                info!("Run {} finished on runner {}", run.id, run.runner_name);
                self.publish(DispatchEvent::RunRecorded {
                    run_id: run.id,
                    runner: run.runner_name,
                });
            }
            Err(e) => {
                if e.is_transient() {
                    warn!("Failed to record run {}, task will be retried: {}", run.id, e);
                } else {
                    error!("Failed to record run {}, task will be retried: {}", run.id, e);
                }
                self.return_to_queue(run.id).await;
            }
        }
    }

    /// A runner gave up a task without finishing it
    pub async fn release_task(&self, task: Task) {
        self.return_to_queue(task.id).await;
        self.notify_idle();
    }

    async fn return_to_queue(&self, task_id: TaskId) {
        self.in_flight.lock().await.remove(&task_id);
        match self.queue.release(task_id).await {
            Ok(true) => self.publish(DispatchEvent::TaskReleased { task_id }),
            Ok(false) => debug!("Released task {} is no longer queued", task_id),
            Err(e) => error!("Failed to release task {}: {}", task_id, e),
        }
    }
}
