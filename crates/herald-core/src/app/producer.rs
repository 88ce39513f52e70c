//! Producer - the enqueue side.
//!
//! Enqueueing never waits for execution: it builds an envelope, appends it
//! to the transport and returns the new task id.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{TaskEnvelope, TaskId, TaskName};
use crate::error::TransportError;
use crate::ports::{Broker, Clock, IdGenerator};
use crate::typed::Task;

#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl Producer {
    pub fn new(
        broker: Arc<dyn Broker>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            broker,
            ids,
            clock,
            max_attempts,
        }
    }

    pub async fn enqueue<T: Task>(&self, task: &T) -> Result<TaskId, TransportError> {
        self.enqueue_raw(T::NAME, serde_json::to_value(task)?, Duration::ZERO)
            .await
    }

    /// Enqueue `task` so that its first attempt runs no earlier than `delay`
    /// from now.
    pub async fn enqueue_in<T: Task>(
        &self,
        task: &T,
        delay: Duration,
    ) -> Result<TaskId, TransportError> {
        self.enqueue_raw(T::NAME, serde_json::to_value(task)?, delay)
            .await
    }

    /// Enqueue an untyped payload. The worker validates it against whatever
    /// handler is registered under `name`.
    pub async fn enqueue_raw(
        &self,
        name: impl Into<TaskName>,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<TaskId, TransportError> {
        let now = self.clock.now();
        let task_id = self.ids.generate_task_id();
        let mut envelope =
            TaskEnvelope::new(task_id, name.into(), payload, self.max_attempts, now);
        if !delay.is_zero() {
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            let not_before = now
                .checked_add_signed(delay)
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
            envelope = envelope.scheduled_at(not_before);
        }

        tracing::debug!(
            task_id = %task_id,
            task_name = %envelope.task_name(),
            not_before = %envelope.not_before(),
            "enqueueing task"
        );
        self.broker.enqueue(envelope).await?;
        Ok(task_id)
    }
}
