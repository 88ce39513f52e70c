//! `POST /notify` - accept a notification for asynchronous delivery.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router, middleware};
use serde::Serialize;

use herald_core::notification::{DEFAULT_MESSAGE, SendNotification, validate_message};

use crate::error::AppError;
use crate::middleware::rate_limit::rate_limit;
use crate::state::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/notify", post(notify))
        .route_layer(middleware::from_fn_with_state(state, rate_limit))
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub status: &'static str,
    pub task_id: String,
}

/// Pull the message out of a request body.
///
/// The body must be a JSON object; a missing or null `message` falls back
/// to the default text.
fn parse_message(body: &[u8]) -> Result<String, AppError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("request body must be JSON: {e}")))?;
    let serde_json::Value::Object(fields) = value else {
        return Err(AppError::Validation(
            "request body must be a JSON object".to_string(),
        ));
    };
    let message = match fields.get("message") {
        None | Some(serde_json::Value::Null) => DEFAULT_MESSAGE.to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(_) => return Err(AppError::Validation("message must be a string".to_string())),
    };
    validate_message(&message).map_err(|e| AppError::Validation(e.message().to_string()))?;
    Ok(message)
}

async fn notify(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let message = parse_message(&body)?;
    let task_id = state
        .producer
        .enqueue(&SendNotification::new(message))
        .await?;

    tracing::info!(task_id = %task_id, "notification accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "accepted",
            task_id: task_id.to_string(),
        }),
    ))
}
