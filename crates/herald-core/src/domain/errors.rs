//! Failure taxonomy for task execution.
//!
//! Every failure raised while running a task is reduced to an [`ErrorKind`].
//! The kind alone decides whether the retry policy may spend budget on it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{TaskId, TaskState};

/// Operational class of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Payload can never succeed (empty, wrong shape, oversized, unknown task).
    StructuralValidation,

    /// Delivery failed in a way that may succeed later.
    DeliveryTransient,

    /// Hard execution limit breached; the attempt may have partially run.
    TimeoutExceeded,
}

impl ErrorKind {
    /// Permanent kinds are never retried.
    pub fn is_permanent(self) -> bool {
        !matches!(self, ErrorKind::DeliveryTransient)
    }
}

/// Maps an error type onto the failure taxonomy.
///
/// Implement this for the error type of a delivery channel (or any handler
/// dependency) to decide which of its failures are worth retrying.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Error returned by task handlers; carries its classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    kind: ErrorKind,
    message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StructuralValidation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeliveryTransient, message)
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ErrorKind::TimeoutExceeded,
            format!("hard time limit ({}s) exceeded", limit.as_secs()),
        )
    }

    /// Wrap any classified error, keeping its message.
    pub fn classify<E: Classify + fmt::Display>(err: &E) -> Self {
        Self::new(err.kind(), err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Classify for TaskError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Rejected state-machine mutation on a task envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("{task_id}: invalid transition {from} -> {to}")]
    Invalid {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("{task_id}: attempt {attempt} would exceed max_attempts {max_attempts}")]
    AttemptCeiling {
        task_id: TaskId,
        attempt: u32,
        max_attempts: u32,
    },
}
