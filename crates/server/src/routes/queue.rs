//! Queue inspection and maintenance

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use bench_core::task::{RepoId, Task, TaskId, TaskPriority, TaskSource};

use super::{map_core_error, ApiError, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InProgressTask {
    #[serde(flatten)]
    pub task: Task,
    pub runner: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Unclaimed tasks in the order they will be handed out
    pub pending: Vec<Task>,
    pub in_progress: Vec<InProgressTask>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub author: String,
    pub priority: Option<TaskPriority>,
    pub source: TaskSource,
}

impl NewTask {
    fn into_task(self) -> Result<Task, String> {
        if self.author.trim().is_empty() {
            return Err("author must not be empty".to_string());
        }
        if let Some((_, hash)) = self.source.commit() {
            if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(format!("invalid commit hash {:?}", hash));
            }
        }
        let priority = self.priority.unwrap_or(match self.source {
            TaskSource::Commit { .. } => TaskPriority::Listener,
            TaskSource::Tar { .. } => TaskPriority::Tar,
        });
        Ok(Task::new(self.author, self.source).with_priority(priority))
    }
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub tasks: Vec<NewTask>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearQuery {
    pub repo_id: Option<RepoId>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: Vec<TaskId>,
}

#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: TaskPriority,
}

async fn get_queue(State(state): State<AppState>) -> Result<Json<QueueSnapshot>, ApiError> {
    let dispatcher = state.dispatcher();
    let pending = dispatcher.queue().list_ordered().await.map_err(map_core_error)?;

    let mut in_progress = Vec::new();
    for task in dispatcher.queue().in_progress().await.map_err(map_core_error)? {
        let runner = dispatcher.holder(task.id).await;
        in_progress.push(InProgressTask { task, runner });
    }

    Ok(Json(QueueSnapshot {
        pending,
        in_progress,
    }))
}

async fn enqueue_tasks(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<Vec<Task>>), ApiError> {
    let tasks = req
        .tasks
        .into_iter()
        .map(NewTask::into_task)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| (StatusCode::BAD_REQUEST, Json(ErrorResponse { error })))?;

    let inserted = state
        .dispatcher()
        .enqueue(tasks)
        .await
        .map_err(map_core_error)?;
    Ok((StatusCode::CREATED, Json(inserted)))
}

async fn clear_queue(
    State(state): State<AppState>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let dispatcher = state.dispatcher();
    let deleted = match query.repo_id {
        Some(repo) => dispatcher.delete_repo_tasks(repo).await,
        None => dispatcher.clear_queue().await,
    }
    .map_err(map_core_error)?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .dispatcher()
        .delete_tasks(&[task_id])
        .await
        .map_err(map_core_error)?;
    if deleted.is_empty() {
        return Err(map_core_error(bench_core::Error::TaskNotFound(
            task_id.to_string(),
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn set_priority(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    Json(req): Json<PriorityRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .dispatcher()
        .queue()
        .set_priority(task_id, req.priority)
        .await
        .map_err(map_core_error)?;
    Ok(Json(task))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/queue",
            get(get_queue).post(enqueue_tasks).delete(clear_queue),
        )
        .route(
            "/api/queue/{task_id}",
            delete(delete_task).patch(set_priority),
        )
}
