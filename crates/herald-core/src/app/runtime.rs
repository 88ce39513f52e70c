//! Runtime - dispatches an envelope to its handler under time limits.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{TaskEnvelope, TaskError};
use crate::typed::{TaskOutput, TaskRegistry};

/// Per-attempt execution limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimits {
    /// Past this, a warning is logged and the attempt keeps running.
    pub soft: Duration,
    /// Past this, the attempt is abandoned and fails with a timeout.
    pub hard: Duration,
}

impl TimeLimits {
    pub const DEFAULT_SOFT: Duration = Duration::from_secs(1500);
    pub const DEFAULT_HARD: Duration = Duration::from_secs(1800);

    pub fn new(soft: Duration, hard: Duration) -> Self {
        Self { soft, hard }
    }
}

impl Default for TimeLimits {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SOFT, Self::DEFAULT_HARD)
    }
}

pub struct Runtime {
    registry: Arc<TaskRegistry>,
    limits: TimeLimits,
}

impl Runtime {
    pub fn new(registry: Arc<TaskRegistry>, limits: TimeLimits) -> Self {
        Self { registry, limits }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn limits(&self) -> TimeLimits {
        self.limits
    }

    /// Run one attempt of `envelope`.
    ///
    /// An unknown task name is a validation error: no amount of retrying
    /// will make a handler appear.
    pub async fn execute(&self, envelope: &TaskEnvelope) -> Result<TaskOutput, TaskError> {
        let name = envelope.task_name();
        let handler = self
            .registry
            .get(name.as_str())
            .ok_or_else(|| TaskError::validation(format!("unknown task: {name}")))?;

        let run = handler.handle_dyn(envelope.payload().clone());
        let soft = tokio::time::sleep(self.limits.soft);
        let hard = tokio::time::sleep(self.limits.hard);
        tokio::pin!(run, soft, hard);

        let mut warned = false;
        loop {
            tokio::select! {
                out = &mut run => return out,
                _ = &mut soft, if !warned => {
                    warned = true;
                    tracing::warn!(
                        task_id = %envelope.task_id(),
                        task_name = %name,
                        limit_secs = self.limits.soft.as_secs(),
                        "soft time limit exceeded"
                    );
                }
                _ = &mut hard => {
                    tracing::error!(
                        task_id = %envelope.task_id(),
                        task_name = %name,
                        limit_secs = self.limits.hard.as_secs(),
                        "hard time limit exceeded; abandoning attempt"
                    );
                    return Err(TaskError::timeout(self.limits.hard));
                }
            }
        }
    }
}
