//! In-memory broker.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::{ResultRecord, TaskEnvelope, TaskId, TaskState};
use crate::error::TransportError;
use crate::observability::{QueueCounts, TaskStatus};
use crate::ports::{Broker, Clock, ResultBackend, SystemClock, TaskLease};

/// Heap entry; the heap is a min-heap on (not_before, seq).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    not_before: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed: earliest first
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct LeaseSlot {
    token: u64,
    visible_at: DateTime<Utc>,
}

struct TaskRecord {
    envelope: TaskEnvelope,
    result: Option<ResultRecord>,
    /// Seq of the live heap entry; older entries for this task are stale.
    seq: u64,
}

struct InMemoryState {
    /// Single source of truth for envelopes and results.
    records: HashMap<TaskId, TaskRecord>,

    /// Waiting envelopes (TaskIds only).
    scheduled: BinaryHeap<ScheduledTask>,

    /// Leased envelopes and when they become visible again.
    in_flight: HashMap<TaskId, LeaseSlot>,

    /// Terminal records in completion order, with their expiry.
    expiries: VecDeque<(DateTime<Utc>, TaskId)>,

    /// Lifetime succeeded/failed totals; outlive expired records.
    terminal: QueueCounts,

    next_seq: u64,
    next_token: u64,
    visibility_timeout: chrono::Duration,
    result_ttl: Option<chrono::Duration>,
}

impl InMemoryState {
    fn new(visibility_timeout: Duration, result_ttl: Option<Duration>) -> Self {
        Self {
            records: HashMap::new(),
            scheduled: BinaryHeap::new(),
            in_flight: HashMap::new(),
            expiries: VecDeque::new(),
            terminal: QueueCounts::default(),
            next_seq: 1,
            next_token: 1,
            visibility_timeout: chrono::Duration::from_std(visibility_timeout)
                .unwrap_or(chrono::Duration::MAX),
            result_ttl: result_ttl
                .map(|ttl| chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)),
        }
    }

    /// Store a terminal envelope and its result, and queue it for expiry.
    fn finish(
        &mut self,
        task_id: TaskId,
        envelope: TaskEnvelope,
        result: ResultRecord,
    ) -> Result<(), TransportError> {
        let record = self
            .records
            .get_mut(&task_id)
            .ok_or(TransportError::NotFound(task_id))?;
        self.terminal.record(envelope.state());
        if let Some(ttl) = self.result_ttl {
            let expires_at = result
                .completed_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.expiries.push_back((expires_at, task_id));
        }
        record.envelope = envelope;
        record.result = Some(result);
        Ok(())
    }

    /// Drop terminal records whose result TTL has passed.
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        while let Some(&(expires_at, task_id)) = self.expiries.front() {
            if expires_at > now {
                break;
            }
            self.expiries.pop_front();
            if self
                .records
                .get(&task_id)
                .is_some_and(|record| record.envelope.state().is_terminal())
            {
                self.records.remove(&task_id);
                tracing::debug!(task_id = %task_id, "result expired");
            }
        }
    }

    fn schedule(&mut self, task_id: TaskId, not_before: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(record) = self.records.get_mut(&task_id) {
            record.seq = seq;
        }
        self.scheduled.push(ScheduledTask {
            not_before,
            seq,
            task_id,
        });
    }

    /// Hand expired leases' envelopes back to the queue.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, slot)| slot.visible_at <= now)
            .map(|(task_id, _)| *task_id)
            .collect();

        for task_id in expired {
            self.in_flight.remove(&task_id);
            let Some(record) = self.records.get_mut(&task_id) else {
                continue;
            };
            if record.envelope.state() == TaskState::Started {
                // state is Started here, so reclaim cannot fail
                let _ = record.envelope.reclaim();
            }
            tracing::warn!(
                task_id = %task_id,
                attempt = record.envelope.attempt(),
                "visibility timeout expired; redelivering"
            );
            let not_before = record.envelope.not_before();
            self.schedule(task_id, not_before);
        }
    }

    /// Lease the earliest due envelope, if any.
    fn try_lease(&mut self, now: DateTime<Utc>) -> Option<(TaskEnvelope, u64)> {
        self.purge_expired(now);
        self.reclaim_expired(now);

        while let Some(entry) = self.scheduled.peek() {
            if entry.not_before > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            let Some(record) = self.records.get(&entry.task_id) else {
                continue;
            };
            if record.seq != entry.seq
                || record.envelope.state().is_terminal()
                || self.in_flight.contains_key(&entry.task_id)
            {
                continue;
            }

            let envelope = record.envelope.clone();
            let token = self.next_token;
            self.next_token += 1;
            self.in_flight.insert(
                entry.task_id,
                LeaseSlot {
                    token,
                    visible_at: now
                        .checked_add_signed(self.visibility_timeout)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                },
            );
            return Some((envelope, token));
        }
        None
    }

    /// Earliest instant at which `try_lease` could succeed.
    fn next_wake(&self) -> Option<DateTime<Utc>> {
        let next_due = self.scheduled.peek().map(|entry| entry.not_before);
        let next_reclaim = self.in_flight.values().map(|slot| slot.visible_at).min();
        match (next_due, next_reclaim) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Check that `token` still owns `task_id`.
    fn verify(&self, task_id: TaskId, token: u64) -> Result<(), TransportError> {
        match self.in_flight.get(&task_id) {
            Some(slot) if slot.token == token => Ok(()),
            _ => Err(TransportError::LeaseLost(task_id)),
        }
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts {
            succeeded: self.terminal.succeeded,
            failed: self.terminal.failed,
            ..QueueCounts::default()
        };
        for record in self.records.values() {
            let state = record.envelope.state();
            if !state.is_terminal() {
                counts.record(state);
            }
        }
        counts
    }
}

/// Broker and result store kept in process memory.
///
/// Envelopes survive worker crashes (visibility timeout) but not process
/// restarts. Terminal records are kept forever unless a result TTL is set
/// with [`InMemoryBroker::with_retention`]; succeeded/failed counts are
/// lifetime totals either way.
pub struct InMemoryBroker {
    state: Arc<Mutex<InMemoryState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self::with_clock(Arc::new(SystemClock), visibility_timeout)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self::build(clock, visibility_timeout, None)
    }

    /// Like [`with_clock`](Self::with_clock), but terminal records are dropped
    /// `result_ttl` after completion.
    pub fn with_retention(
        clock: Arc<dyn Clock>,
        visibility_timeout: Duration,
        result_ttl: Duration,
    ) -> Self {
        Self::build(clock, visibility_timeout, Some(result_ttl))
    }

    fn build(
        clock: Arc<dyn Clock>,
        visibility_timeout: Duration,
        result_ttl: Option<Duration>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::new(
                visibility_timeout,
                result_ttl,
            ))),
            notify: Arc::new(Notify::new()),
            clock,
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().await;
            let task_id = envelope.task_id();
            let not_before = envelope.not_before();
            state.records.insert(
                task_id,
                TaskRecord {
                    envelope,
                    result: None,
                    seq: 0,
                },
            );
            state.schedule(task_id, not_before);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Box<dyn TaskLease>>, TransportError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let next_wake = {
                let mut state = self.state.lock().await;
                if let Some((envelope, token)) = state.try_lease(self.clock.now()) {
                    return Ok(Some(Box::new(InMemoryLease {
                        task_id: envelope.task_id(),
                        envelope,
                        token,
                        state: Arc::clone(&self.state),
                        notify: Arc::clone(&self.notify),
                    })));
                }
                state.next_wake()
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut sleep_for = deadline - now;
            if let Some(at) = next_wake {
                let until_due = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                sleep_for = sleep_for.min(until_due.max(Duration::from_millis(1)));
            }

            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep(sleep_for) => {},
            }
        }
    }

    async fn counts(&self) -> Result<QueueCounts, TransportError> {
        let state = self.state.lock().await;
        Ok(state.counts())
    }
}

#[async_trait]
impl ResultBackend for InMemoryBroker {
    async fn get_result(&self, task_id: TaskId) -> Result<Option<ResultRecord>, TransportError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .get(&task_id)
            .and_then(|record| record.result.clone()))
    }

    async fn status(&self, task_id: TaskId) -> Result<Option<TaskStatus>, TransportError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .get(&task_id)
            .map(|record| TaskStatus::from_envelope(&record.envelope, record.result.clone())))
    }
}

struct InMemoryLease {
    task_id: TaskId,
    envelope: TaskEnvelope,
    token: u64,
    state: Arc<Mutex<InMemoryState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl TaskLease for InMemoryLease {
    fn envelope(&self) -> &TaskEnvelope {
        &self.envelope
    }

    async fn mark_started(&mut self, envelope: &TaskEnvelope) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.verify(self.task_id, self.token)?;
        if let Some(record) = state.records.get_mut(&self.task_id) {
            record.envelope = envelope.clone();
        }
        self.envelope = envelope.clone();
        Ok(())
    }

    async fn retry(self: Box<Self>, envelope: TaskEnvelope) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().await;
            state.verify(self.task_id, self.token)?;
            state.in_flight.remove(&self.task_id);
            let not_before = envelope.not_before();
            match state.records.get_mut(&self.task_id) {
                Some(record) => record.envelope = envelope,
                None => return Err(TransportError::NotFound(self.task_id)),
            }
            state.schedule(self.task_id, not_before);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn complete(
        self: Box<Self>,
        envelope: TaskEnvelope,
        result: ResultRecord,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.verify(self.task_id, self.token)?;
        state.in_flight.remove(&self.task_id);
        state.finish(self.task_id, envelope, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureReason, TaskName};
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn broker(clock: &FixedClock) -> InMemoryBroker {
        InMemoryBroker::with_clock(Arc::new(clock.clone()), Duration::from_secs(3600))
    }

    fn envelope(now: DateTime<Utc>) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            TaskName::new("test.echo"),
            serde_json::json!({"message": "hi"}),
            3,
            now,
        )
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_returns_same_envelope() {
        let clock = FixedClock::new(t0());
        let broker = broker(&clock);
        let env = envelope(t0());

        broker.enqueue(env.clone()).await.unwrap();
        let lease = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(lease.envelope().task_id(), env.task_id());
        assert_eq!(lease.envelope().payload(), env.payload());
    }

    #[tokio::test]
    async fn leased_envelope_is_hidden_from_other_workers() {
        let clock = FixedClock::new(t0());
        let broker = broker(&clock);
        broker.enqueue(envelope(t0())).await.unwrap();

        let _lease = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert!(broker.dequeue(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn future_envelope_waits_for_not_before() {
        let clock = FixedClock::new(t0());
        let broker = broker(&clock);
        let env = envelope(t0()).scheduled_at(t0() + chrono::Duration::seconds(60));
        broker.enqueue(env).await.unwrap();

        assert!(broker.dequeue(Duration::ZERO).await.unwrap().is_none());

        clock.advance(Duration::from_secs(60));
        assert!(broker.dequeue(Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn due_envelopes_come_out_in_enqueue_order() {
        let clock = FixedClock::new(t0());
        let broker = broker(&clock);
        let first = envelope(t0());
        let second = envelope(t0());
        broker.enqueue(first.clone()).await.unwrap();
        broker.enqueue(second.clone()).await.unwrap();

        let a = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let b = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(a.envelope().task_id(), first.task_id());
        assert_eq!(b.envelope().task_id(), second.task_id());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_old_lease_is_lost() {
        let clock = FixedClock::new(t0());
        let broker = InMemoryBroker::with_clock(Arc::new(clock.clone()), Duration::from_secs(30));
        broker.enqueue(envelope(t0())).await.unwrap();

        let mut stale = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let mut started = stale.envelope().clone();
        started.start().unwrap();
        stale.mark_started(&started).await.unwrap();

        clock.advance(Duration::from_secs(31));
        let fresh = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(fresh.envelope().task_id(), started.task_id());
        assert_eq!(fresh.envelope().state(), TaskState::Queued);

        started.succeed().unwrap();
        let result = ResultRecord::success(started.task_id(), 0, "ok", serde_json::json!({}), t0());
        let err = stale.complete(started, result).await.unwrap_err();
        assert!(matches!(err, TransportError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn retry_hides_envelope_until_backoff_elapses() {
        let clock = FixedClock::new(t0());
        let broker = broker(&clock);
        broker.enqueue(envelope(t0())).await.unwrap();

        let mut lease = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let mut env = lease.envelope().clone();
        env.start().unwrap();
        lease.mark_started(&env).await.unwrap();
        env.schedule_retry(t0() + chrono::Duration::seconds(60), "flaky")
            .unwrap();
        lease.retry(env.clone()).await.unwrap();

        let status = broker.status(env.task_id()).await.unwrap().unwrap();
        assert_eq!(status.state, TaskState::Retrying);
        assert_eq!(status.attempt, 1);
        assert!(broker.dequeue(Duration::ZERO).await.unwrap().is_none());

        clock.advance(Duration::from_secs(60));
        let again = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.envelope().attempt(), 1);
    }

    #[tokio::test]
    async fn complete_stores_result_and_counts() {
        let clock = FixedClock::new(t0());
        let broker = broker(&clock);
        broker.enqueue(envelope(t0())).await.unwrap();
        broker.enqueue(envelope(t0())).await.unwrap();

        let mut lease = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let mut env = lease.envelope().clone();
        env.start().unwrap();
        lease.mark_started(&env).await.unwrap();
        env.fail("empty").unwrap();
        let result = ResultRecord::failure(
            env.task_id(),
            0,
            FailureReason::Validation,
            "empty",
            t0(),
        );
        lease.complete(env.clone(), result.clone()).await.unwrap();

        assert_eq!(broker.get_result(env.task_id()).await.unwrap(), Some(result));
        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.pending(), 1);
    }

    #[tokio::test]
    async fn terminal_records_expire_after_result_ttl() {
        let clock = FixedClock::new(t0());
        let broker = InMemoryBroker::with_retention(
            Arc::new(clock.clone()),
            Duration::from_secs(3600),
            Duration::from_secs(600),
        );
        broker.enqueue(envelope(t0())).await.unwrap();

        let mut lease = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let mut env = lease.envelope().clone();
        env.start().unwrap();
        lease.mark_started(&env).await.unwrap();
        env.succeed().unwrap();
        let id = env.task_id();
        let result = ResultRecord::success(id, 0, "ok", serde_json::json!({}), t0());
        lease.complete(env, result).await.unwrap();

        clock.advance(Duration::from_secs(599));
        assert!(broker.dequeue(Duration::ZERO).await.unwrap().is_none());
        assert!(broker.get_result(id).await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(broker.dequeue(Duration::ZERO).await.unwrap().is_none());
        assert!(broker.status(id).await.unwrap().is_none());
        // totals survive the purge
        assert_eq!(broker.counts().await.unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn unknown_task_has_no_status() {
        let clock = FixedClock::new(t0());
        let broker = broker(&clock);
        let id = TaskId::from_ulid(Ulid::new());

        assert!(broker.status(id).await.unwrap().is_none());
        assert!(broker.get_result(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn waiting_dequeue_wakes_on_enqueue() {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(3600)));

        let waiter = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move {
                broker
                    .dequeue(Duration::from_secs(5))
                    .await
                    .unwrap()
                    .map(|lease| lease.envelope().task_id())
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let env = envelope(Utc::now());
        broker.enqueue(env.clone()).await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some(env.task_id()));
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let broker = InMemoryBroker::new(Duration::from_secs(3600));
        let started = tokio::time::Instant::now();

        let lease = broker.dequeue(Duration::from_millis(100)).await.unwrap();

        assert!(lease.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
