//! `GET /tasks/{task_id}` - state of a task and, once terminal, its result.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use herald_core::TaskId;
use herald_core::observability::TaskStatus;
use herald_core::ports::ResultBackend;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/tasks/{task_id}", get(get_task))
}

async fn get_task(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<TaskStatus>, AppError> {
    let task_id: TaskId = raw
        .parse()
        .map_err(|e: herald_core::domain::ParseIdError| AppError::Validation(e.to_string()))?;

    state
        .results
        .status(task_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(task_id.to_string()))
}
