//! Route handlers

pub mod health;
pub mod queue;
pub mod runners;

use axum::{http::StatusCode, Json, Router};
use serde::Serialize;
use tracing::error;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Every route of the server
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(runners::router())
        .merge(queue::router())
        .with_state(state)
}

pub(crate) fn map_core_error(err: bench_core::Error) -> ApiError {
    let status = match &err {
        bench_core::Error::TaskNotFound(_) => StatusCode::NOT_FOUND,
        bench_core::Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => {
            error!("Request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
