//! Runner endpoints

use axum::{extract::State, routing::get, Json, Router};

use crate::runner::handler::runner_ws_handler;
use crate::runner::registry::RunnerStatus;
use crate::state::AppState;

async fn list_runners(State(state): State<AppState>) -> Json<Vec<RunnerStatus>> {
    Json(state.dispatcher().list_runners().await)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/runner/ws", get(runner_ws_handler))
        .route("/api/runners", get(list_runners))
}
