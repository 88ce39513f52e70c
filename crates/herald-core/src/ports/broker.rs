//! Broker port - the task transport and result store.
//!
//! The transport carries whole envelopes. Workers never touch transport state
//! directly: each dequeued envelope comes with a [`TaskLease`] whose methods
//! are the only way to move it forward. Every lease method is atomic with
//! respect to other workers.
//!
//! # Implementations
//! - `InMemoryBroker`: single process (development, tests)
//! - `RedisBroker`: durable, shared by producer and worker processes

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ResultRecord, TaskEnvelope, TaskId};
use crate::error::TransportError;
use crate::observability::{QueueCounts, TaskStatus};

/// A worker's exclusive hold on one envelope.
///
/// Holding a lease hides the envelope from other workers until the lease is
/// finished with [`retry`](TaskLease::retry) or
/// [`complete`](TaskLease::complete), or until the broker's visibility timeout
/// expires and the envelope is handed out again.
#[async_trait]
pub trait TaskLease: Send {
    /// The envelope as it was when leased.
    fn envelope(&self) -> &TaskEnvelope;

    /// Persist the `Started` transition.
    async fn mark_started(&mut self, envelope: &TaskEnvelope) -> Result<(), TransportError>;

    /// Put a `Retrying` envelope back; it becomes visible at its `not_before`.
    async fn retry(self: Box<Self>, envelope: TaskEnvelope) -> Result<(), TransportError>;

    /// Store a terminal envelope together with its result record.
    async fn complete(
        self: Box<Self>,
        envelope: TaskEnvelope,
        result: ResultRecord,
    ) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Append one envelope.
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<(), TransportError>;

    /// Lease one due envelope, waiting up to `wait` for one to become due.
    ///
    /// Returns `Ok(None)` if nothing became available in time.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Box<dyn TaskLease>>, TransportError>;

    /// Envelopes per state.
    async fn counts(&self) -> Result<QueueCounts, TransportError>;
}

/// Read side of the result store.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    async fn get_result(&self, task_id: TaskId) -> Result<Option<ResultRecord>, TransportError>;

    /// Current state, plus the result record once terminal.
    async fn status(&self, task_id: TaskId) -> Result<Option<TaskStatus>, TransportError>;
}
