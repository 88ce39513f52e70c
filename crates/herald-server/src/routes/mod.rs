pub mod health;
pub mod notify;
pub mod tasks;

use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

use crate::middleware::security::with_security_headers;
use crate::state::AppState;

/// Build the complete router with all routes.
pub fn create_router(state: AppState) -> Router {
    let max_body_bytes = state.max_body_bytes;
    let router = Router::new()
        .merge(health::router())
        .merge(notify::router(state.clone()))
        .merge(tasks::router())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state);
    with_security_headers(router)
}
