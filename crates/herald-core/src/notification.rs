//! The notification task: validate a message and hand it to a delivery channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::TaskError;
use crate::ports::{Delivery, DeliveryError};
use crate::typed::{Handler, Task, TaskOutput};

pub const MAX_MESSAGE_CHARS: usize = 1000;
pub const PREVIEW_CHARS: usize = 50;
pub const DEFAULT_MESSAGE: &str = "Hello from Herald!";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendNotification {
    pub message: String,
}

impl SendNotification {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Task for SendNotification {
    const NAME: &'static str = "notification_tasks.send_notification";

    fn validate(&self) -> Result<(), TaskError> {
        validate_message(&self.message)
    }
}

/// Message rules shared by the worker and the HTTP edge.
pub fn validate_message(message: &str) -> Result<(), TaskError> {
    if message.trim().is_empty() {
        return Err(TaskError::validation("message is empty"));
    }
    let chars = message.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(TaskError::validation(format!(
            "message too long ({chars} > {MAX_MESSAGE_CHARS} characters)"
        )));
    }
    Ok(())
}

pub struct NotificationHandler<D> {
    delivery: D,
}

impl<D: Delivery> NotificationHandler<D> {
    pub fn new(delivery: D) -> Self {
        Self { delivery }
    }
}

#[async_trait]
impl<D: Delivery> Handler<SendNotification> for NotificationHandler<D> {
    async fn handle(&self, task: SendNotification) -> Result<TaskOutput, TaskError> {
        self.delivery
            .deliver(&task.message)
            .await
            .map_err(|e| TaskError::classify(&e))?;

        let preview: String = task.message.chars().take(PREVIEW_CHARS).collect();
        Ok(TaskOutput::new(
            format!("Sent: {}", task.message),
            serde_json::json!({
                "message_length": task.message.chars().count(),
                "preview": preview,
            }),
        ))
    }
}

/// Delivery channel that writes the notification to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(&self, message: &str) -> Result<(), DeliveryError> {
        tracing::info!(message, "notification delivered");
        Ok(())
    }
}
