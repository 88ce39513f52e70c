//! Result records: the terminal outcome of a task, addressable by task id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// Final status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
}

/// Why a task ended up failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Validation,
    Timeout,
    RetriesExhausted,
}

/// Written exactly once, when an envelope reaches a terminal state.
///
/// Only the final attempt is recorded: a task that fails twice and then
/// succeeds has a success record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub status: ResultStatus,

    /// Human-readable result (delivery confirmation or error text).
    pub detail: String,

    /// Structured output of a successful handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,

    /// Retries performed before this result.
    pub attempt: u32,

    pub completed_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn success(
        task_id: TaskId,
        attempt: u32,
        detail: impl Into<String>,
        output: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            status: ResultStatus::Success,
            detail: detail.into(),
            output: Some(output),
            reason: None,
            attempt,
            completed_at,
        }
    }

    pub fn failure(
        task_id: TaskId,
        attempt: u32,
        reason: FailureReason,
        detail: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            status: ResultStatus::Failed,
            detail: detail.into(),
            output: None,
            reason: Some(reason),
            attempt,
            completed_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}
