//! Worker loop: lease -> start -> execute -> decide -> retry or complete.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::runtime::Runtime;
use crate::domain::{
    Decider, Decision, FailureReason, ResultRecord, TaskEnvelope, TaskError, TaskState,
    TransitionError,
};
use crate::error::TransportError;
use crate::ports::{Broker, Clock, TaskLease};

/// Drives leased envelopes through the state machine.
///
/// The worker is the only writer of envelope state; the transport only
/// persists what it is handed (apart from reclaiming expired leases).
pub struct Worker {
    broker: Arc<dyn Broker>,
    runtime: Arc<Runtime>,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        runtime: Arc<Runtime>,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            runtime,
            decider,
            clock,
        }
    }

    /// Lease and process at most one envelope.
    ///
    /// Returns the state the envelope was left in, or `None` if nothing was
    /// due within `wait`.
    pub async fn run_once(&self, wait: Duration) -> Result<Option<TaskState>, TransportError> {
        match self.broker.dequeue(wait).await? {
            Some(lease) => self.process(lease).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run one attempt of a leased envelope and hand it back to the transport.
    pub async fn process(&self, mut lease: Box<dyn TaskLease>) -> Result<TaskState, TransportError> {
        let mut envelope = lease.envelope().clone();
        if envelope.state() == TaskState::Retrying {
            envelope.requeue()?;
        }
        envelope.start()?;
        lease.mark_started(&envelope).await?;
        tracing::info!(
            task_id = %envelope.task_id(),
            task_name = %envelope.task_name(),
            attempt = envelope.attempt(),
            "task started"
        );

        match self.runtime.execute(&envelope).await {
            Ok(out) => {
                envelope.succeed()?;
                let result = ResultRecord::success(
                    envelope.task_id(),
                    envelope.attempt(),
                    out.detail,
                    out.output,
                    self.clock.now(),
                );
                tracing::info!(
                    task_id = %envelope.task_id(),
                    attempt = envelope.attempt(),
                    "task succeeded"
                );
                lease.complete(envelope, result).await?;
                Ok(TaskState::Succeeded)
            }
            Err(err) => self.handle_failure(lease, envelope, err).await,
        }
    }

    async fn handle_failure(
        &self,
        lease: Box<dyn TaskLease>,
        mut envelope: TaskEnvelope,
        err: TaskError,
    ) -> Result<TaskState, TransportError> {
        let decision = self
            .decider
            .decide(envelope.attempt(), envelope.max_attempts(), err.kind());

        let (reason, detail) = match decision {
            Decision::Retry { delay, reason } => {
                let now = self.clock.now();
                let not_before = now
                    .max(envelope.not_before())
                    .checked_add_signed(chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX))
                    .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);

                match envelope.schedule_retry(not_before, err.message()) {
                    Ok(()) => {
                        tracing::warn!(
                            task_id = %envelope.task_id(),
                            attempt = envelope.attempt(),
                            error = %err,
                            not_before = %envelope.not_before(),
                            "{reason}"
                        );
                        lease.retry(envelope).await?;
                        return Ok(TaskState::Retrying);
                    }
                    // a decider may ask for more retries than the envelope allows
                    Err(TransitionError::AttemptCeiling { .. }) => (
                        FailureReason::RetriesExhausted,
                        format!(
                            "retries exhausted ({}/{}): {}",
                            envelope.attempt(),
                            envelope.max_attempts(),
                            err.message()
                        ),
                    ),
                    Err(other) => return Err(other.into()),
                }
            }
            Decision::GiveUp { reason, detail } => match reason {
                FailureReason::RetriesExhausted => (reason, format!("{detail}: {}", err.message())),
                FailureReason::Validation | FailureReason::Timeout => {
                    (reason, err.message().to_string())
                }
            },
        };

        envelope.fail(err.message())?;
        let result = ResultRecord::failure(
            envelope.task_id(),
            envelope.attempt(),
            reason,
            detail.clone(),
            self.clock.now(),
        );
        tracing::error!(
            task_id = %envelope.task_id(),
            attempt = envelope.attempt(),
            reason = ?reason,
            "task failed: {detail}"
        );
        lease.complete(envelope, result).await?;
        Ok(TaskState::Failed)
    }
}

/// Worker group handle.
/// - `request_shutdown` stops all loops from taking new leases
/// - `shutdown_and_join` also waits for in-flight attempts to finish
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` loops sharing one worker; each waits up to `poll_interval`
    /// per dequeue.
    pub fn spawn(n: usize, worker: Arc<Worker>, poll_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker = Arc::clone(&worker);
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, worker, poll_interval, &mut rx).await;
            }));
        }
        tracing::info!(concurrency = n, "worker group started");

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker loop panicked");
            }
        }
        tracing::info!("worker group stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    worker: Arc<Worker>,
    poll_interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // only the wait for a lease races shutdown; a leased envelope always
        // runs to completion
        let lease = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            lease = worker.broker.dequeue(poll_interval) => lease,
        };

        match lease {
            Ok(Some(lease)) => {
                let task_id = lease.envelope().task_id();
                if let Err(e) = worker.process(lease).await {
                    tracing::warn!(worker_id, task_id = %task_id, error = %e, "could not record attempt");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(worker_id, error = %e, "dequeue failed");
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
    tracing::debug!(worker_id, "worker loop exited");
}
