use thiserror::Error;

use crate::domain::{TaskId, TransitionError};

/// Failure talking to the task transport or result store.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker cannot be reached; the only error a producer surfaces.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("envelope codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The lease outlived its visibility timeout and the envelope was handed
    /// to another worker.
    #[error("lease lost for {0}")]
    LeaseLost(TaskId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("broker error: {0}")]
    Backend(String),
}

impl TransportError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

impl From<redis::RedisError> for TransportError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            TransportError::Unavailable(err.to_string())
        } else {
            TransportError::Backend(err.to_string())
        }
    }
}
