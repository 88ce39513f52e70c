use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ResultRecord, TaskEnvelope, TaskId, TaskName, TaskState};

/// Number of envelopes per state held by a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub started: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Queued => self.queued += 1,
            TaskState::Started => self.started += 1,
            TaskState::Retrying => self.retrying += 1,
            TaskState::Succeeded => self.succeeded += 1,
            TaskState::Failed => self.failed += 1,
        }
    }

    /// Envelopes not yet in a terminal state.
    pub fn pending(&self) -> usize {
        self.queued + self.started + self.retrying
    }
}

/// Answer to "what happened to task X?".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub task_name: TaskName,
    pub state: TaskState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub not_before: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Present once the task is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRecord>,
}

impl TaskStatus {
    pub fn from_envelope(envelope: &TaskEnvelope, result: Option<ResultRecord>) -> Self {
        Self {
            task_id: envelope.task_id(),
            task_name: envelope.task_name().clone(),
            state: envelope.state(),
            attempt: envelope.attempt(),
            max_attempts: envelope.max_attempts(),
            not_before: envelope.not_before(),
            last_error: envelope.last_error().map(str::to_string),
            result,
        }
    }
}
