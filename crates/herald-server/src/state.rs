//! Shared application state for the axum server.

use std::sync::Arc;

use herald_core::app::{App, Producer};
use herald_core::ports::{Broker, ResultBackend};

use crate::middleware::rate_limit::RateLimiter;

/// State shared by every route handler via axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub producer: Producer,
    pub broker: Arc<dyn Broker>,
    pub results: Arc<dyn ResultBackend>,
    pub limiter: Arc<RateLimiter>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(app: &App, limiter: RateLimiter, max_body_bytes: usize) -> Self {
        Self {
            producer: app.producer().clone(),
            broker: app.broker(),
            results: app.results(),
            limiter: Arc::new(limiter),
            max_body_bytes,
        }
    }
}
