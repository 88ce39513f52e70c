//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use herald_core::ports::Broker;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let broker = match state.broker.counts().await {
        Ok(counts) => json!({ "status": "ok", "counts": counts }),
        Err(e) => json!({ "status": "unavailable", "error": e.to_string() }),
    };
    Json(json!({
        "status": "ok",
        "service": "herald",
        "version": env!("CARGO_PKG_VERSION"),
        "broker": broker,
    }))
}
