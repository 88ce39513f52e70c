//! Decision model: what the worker does after a failed attempt.
//!
//! The decider is a pure function of (attempt, ceiling, failure kind). The
//! worker interprets the returned [`Decision`]; nothing here touches the
//! transport.

use std::time::Duration;

use super::{ErrorKind, FailureReason, RetryPolicy};

/// The next action to take for a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Re-enqueue after `delay`.
    Retry { delay: Duration, reason: String },

    /// Finalize as failed.
    GiveUp { reason: FailureReason, detail: String },
}

/// Decides the next action from the attempt counter and failure class.
pub trait Decider: Send + Sync {
    /// * `attempt` - retries already performed (0 on the first execution)
    /// * `max_attempts` - retry ceiling for this envelope
    /// * `kind` - class of the failure that just happened
    fn decide(&self, attempt: u32, max_attempts: u32, kind: ErrorKind) -> Decision;
}

/// Permanent failures give up at once; transient ones retry until the
/// envelope's ceiling, spaced by the policy's backoff.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, attempt: u32, max_attempts: u32, kind: ErrorKind) -> Decision {
        match kind {
            ErrorKind::StructuralValidation => Decision::GiveUp {
                reason: FailureReason::Validation,
                detail: "payload failed validation; not retrying".to_string(),
            },
            ErrorKind::TimeoutExceeded => Decision::GiveUp {
                reason: FailureReason::Timeout,
                detail: "hard time limit exceeded; not retrying".to_string(),
            },
            ErrorKind::DeliveryTransient if attempt < max_attempts => {
                let delay = self.retry_policy.next_delay(attempt + 1);
                Decision::Retry {
                    delay,
                    reason: format!(
                        "retry {}/{} in {}s",
                        attempt + 1,
                        max_attempts,
                        delay.as_secs()
                    ),
                }
            }
            ErrorKind::DeliveryTransient => Decision::GiveUp {
                reason: FailureReason::RetriesExhausted,
                detail: format!("retries exhausted ({attempt}/{max_attempts})"),
            },
        }
    }
}
