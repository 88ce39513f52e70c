//! Handler traits.
//!
//! - `Handler<T>`: typed, what applications implement
//! - `DynHandler`: object-safe, what the registry stores
//! - `TypedHandler<T, H>`: erases `T` by decoding the payload first

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::task::Task;
use crate::domain::TaskError;

/// What a successful handler run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Human-readable confirmation, stored as the result detail.
    pub detail: String,
    pub output: serde_json::Value,
}

impl TaskOutput {
    pub fn new(detail: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            detail: detail.into(),
            output,
        }
    }
}

#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<TaskOutput, TaskError>;
}

#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: serde_json::Value) -> Result<TaskOutput, TaskError>;
    fn task_name(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, payload: serde_json::Value) -> Result<TaskOutput, TaskError> {
        // a payload that does not decode is as malformed as one that fails validate
        let task: T = serde_json::from_value(payload)
            .map_err(|e| TaskError::validation(format!("invalid payload: {e}")))?;
        task.validate()?;
        self.handler.handle(task).await
    }

    fn task_name(&self) -> &str {
        T::NAME
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Echo {
        pub text: String,
    }

    impl Task for Echo {
        const NAME: &'static str = "test.echo";

        fn validate(&self) -> Result<(), TaskError> {
            if self.text.is_empty() {
                return Err(TaskError::validation("text is empty"));
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Count {
        pub n: u32,
    }

    impl Task for Count {
        const NAME: &'static str = "test.count";
    }

    pub struct EchoHandler;

    #[async_trait]
    impl Handler<Echo> for EchoHandler {
        async fn handle(&self, task: Echo) -> Result<TaskOutput, TaskError> {
            Ok(TaskOutput::new(format!("echo: {}", task.text), json!({"len": task.text.len()})))
        }
    }

    pub struct CountHandler;

    #[async_trait]
    impl Handler<Count> for CountHandler {
        async fn handle(&self, task: Count) -> Result<TaskOutput, TaskError> {
            Ok(TaskOutput::new("counted", json!(task.n)))
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_runs() {
        let handler = TypedHandler::<Echo, _>::new(EchoHandler);

        let out = handler.handle_dyn(json!({"text": "hi"})).await.unwrap();

        assert_eq!(out.detail, "echo: hi");
        assert_eq!(out.output, json!({"len": 2}));
        assert_eq!(handler.task_name(), "test.echo");
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_validation_error() {
        let handler = TypedHandler::<Echo, _>::new(EchoHandler);

        let err = handler.handle_dyn(json!({"wrong": 1})).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StructuralValidation);
    }

    #[tokio::test]
    async fn validate_runs_before_handler() {
        let handler = TypedHandler::<Echo, _>::new(EchoHandler);

        let err = handler.handle_dyn(json!({"text": ""})).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StructuralValidation);
        assert_eq!(err.message(), "text is empty");
    }
}
