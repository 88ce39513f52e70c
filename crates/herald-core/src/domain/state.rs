//! Task state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task envelope.
///
/// State transitions:
/// - Queued -> Started -> Succeeded
/// - Queued -> Started -> Failed
/// - Queued -> Started -> Retrying -> Queued (attempt incremented, `not_before` pushed out)
///
/// `Started -> Queued` is only taken by the transport when a lease's visibility
/// timeout expires (the worker holding it is presumed dead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting in the transport; runnable once `not_before` has passed.
    Queued,

    /// Leased by a worker and executing.
    Started,

    /// Delivered successfully.
    Succeeded,

    /// Failed permanently (validation, timeout, or retries exhausted).
    Failed,

    /// Failed transiently; waiting for its backoff to elapse.
    Retrying,
}

impl TaskState {
    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Started)
                | (Started, Succeeded)
                | (Started, Failed)
                | (Started, Retrying)
                | (Started, Queued)
                | (Retrying, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Started => "started",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
