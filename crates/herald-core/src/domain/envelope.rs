//! TaskEnvelope - one task invocation plus its delivery metadata.
//!
//! The envelope is what travels through the transport. All state-machine
//! mutation goes through the methods here so the invariants hold regardless of
//! which transport carries it:
//! - `attempt` never exceeds `max_attempts`
//! - terminal states are final
//! - `not_before` never moves backwards

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskName, TaskState, TransitionError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task_id: TaskId,
    task_name: TaskName,
    payload: serde_json::Value,
    attempt: u32,
    max_attempts: u32,
    not_before: DateTime<Utc>,
    state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// A fresh envelope, runnable immediately.
    pub fn new(
        task_id: TaskId,
        task_name: TaskName,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            task_name,
            payload,
            attempt: 0,
            max_attempts,
            not_before: now,
            state: TaskState::Queued,
            last_error: None,
            enqueued_at: now,
        }
    }

    /// Defer the first execution until `not_before`.
    pub fn scheduled_at(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = self.not_before.max(not_before);
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_name(&self) -> &TaskName {
        &self.task_name
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Runnable at `now`?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }

    fn transition(&mut self, to: TaskState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError::Invalid {
                task_id: self.task_id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Queued -> Started.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskState::Started)
    }

    /// Started -> Succeeded.
    pub fn succeed(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskState::Succeeded)
    }

    /// Started -> Failed.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(TaskState::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Started -> Retrying, consuming one retry.
    ///
    /// `not_before` is clamped so it never precedes the current one.
    pub fn schedule_retry(
        &mut self,
        not_before: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(TaskState::Retrying) {
            return Err(TransitionError::Invalid {
                task_id: self.task_id,
                from: self.state,
                to: TaskState::Retrying,
            });
        }
        if self.attempt >= self.max_attempts {
            return Err(TransitionError::AttemptCeiling {
                task_id: self.task_id,
                attempt: self.attempt + 1,
                max_attempts: self.max_attempts,
            });
        }
        self.state = TaskState::Retrying;
        self.attempt += 1;
        self.not_before = self.not_before.max(not_before);
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Retrying -> Queued.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskState::Queued)
    }

    /// Started -> Queued, for a lease whose visibility timeout expired.
    pub fn reclaim(&mut self) -> Result<(), TransitionError> {
        if self.state != TaskState::Started {
            return Err(TransitionError::Invalid {
                task_id: self.task_id,
                from: self.state,
                to: TaskState::Queued,
            });
        }
        self.transition(TaskState::Queued)
    }
}
