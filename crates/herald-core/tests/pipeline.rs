//! End-to-end: producer -> in-memory broker -> worker -> result store.
//!
//! Time is a `FixedClock` moved by hand, so retry spacing is checked exactly
//! without sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use herald_core::app::{App, AppBuilder, TimeLimits};
use herald_core::domain::{FailureReason, ResultStatus, RetryPolicy, TaskState};
use herald_core::notification::{NotificationHandler, SendNotification};
use herald_core::ports::{Broker, Delivery, DeliveryError, FixedClock, ResultBackend};
use herald_core::queue::InMemoryBroker;
use herald_core::typed::Task;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// Fails transiently `failures` times, then succeeds.
struct Scripted {
    failures: u32,
    calls: AtomicU32,
}

impl Scripted {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Delivery for Scripted {
    async fn deliver(&self, _message: &str) -> Result<(), DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(DeliveryError::Transient("smtp relay unreachable".to_string()));
        }
        Ok(())
    }
}

/// Refuses every message outright.
struct Refusing {
    calls: AtomicU32,
}

#[async_trait]
impl Delivery for Refusing {
    async fn deliver(&self, _message: &str) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError::Rejected("invalid recipient".to_string()))
    }
}

/// Never finishes within any sane limit.
struct Stuck;

#[async_trait]
impl Delivery for Stuck {
    async fn deliver(&self, _message: &str) -> Result<(), DeliveryError> {
        tokio::time::sleep(Duration::from_secs(7200)).await;
        Ok(())
    }
}

struct Harness {
    clock: FixedClock,
    broker: Arc<InMemoryBroker>,
    app: App,
}

fn harness<D: Delivery + 'static>(delivery: D) -> Harness {
    let clock = FixedClock::new(t0());
    let broker = Arc::new(InMemoryBroker::with_clock(
        Arc::new(clock.clone()),
        Duration::from_secs(3600),
    ));
    let app = AppBuilder::new()
        .register::<SendNotification, _>(NotificationHandler::new(delivery))
        .unwrap()
        .expect_tasks(&[SendNotification::NAME])
        .retry_policy(RetryPolicy::fixed(3, Duration::from_secs(60)))
        .time_limits(TimeLimits::default())
        .clock(Arc::new(clock.clone()))
        .build(Arc::clone(&broker))
        .unwrap();
    Harness { clock, broker, app }
}

impl Harness {
    async fn step(&self) -> Option<TaskState> {
        self.app.worker().run_once(Duration::ZERO).await.unwrap()
    }
}

#[tokio::test]
async fn hello_succeeds_with_length() {
    let h = harness(Scripted::new(0));
    let id = h
        .app
        .producer()
        .enqueue(&SendNotification::new("Hello"))
        .await
        .unwrap();

    assert_eq!(h.step().await, Some(TaskState::Succeeded));

    let result = h.app.results().get_result(id).await.unwrap().unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.detail, "Sent: Hello");
    assert_eq!(result.output.as_ref().unwrap()["message_length"], 5);
    assert_eq!(result.attempt, 0);
}

#[tokio::test]
async fn empty_message_fails_without_retry() {
    let delivery = Scripted::new(0);
    let h = harness(Arc::clone(&delivery));
    let id = h
        .app
        .producer()
        .enqueue(&SendNotification::new(""))
        .await
        .unwrap();

    assert_eq!(h.step().await, Some(TaskState::Failed));

    let status = h.app.results().status(id).await.unwrap().unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.attempt, 0);
    let result = status.result.unwrap();
    assert_eq!(result.reason, Some(FailureReason::Validation));
    assert!(result.detail.contains("empty"));
    assert_eq!(delivery.calls(), 0);

    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.step().await, None);
}

#[tokio::test]
async fn always_transient_retries_three_times_sixty_seconds_apart() {
    let delivery = Scripted::new(u32::MAX);
    let h = harness(Arc::clone(&delivery));
    let id = h
        .app
        .producer()
        .enqueue(&SendNotification::new("ping"))
        .await
        .unwrap();

    let mut expected_not_before = t0();
    for retry in 1..=3 {
        assert_eq!(h.step().await, Some(TaskState::Retrying));

        expected_not_before += chrono::Duration::seconds(60);
        let status = h.app.results().status(id).await.unwrap().unwrap();
        assert_eq!(status.attempt, retry);
        assert_eq!(status.not_before, expected_not_before);

        // nothing is due before the backoff elapses
        h.clock.advance(Duration::from_secs(59));
        assert_eq!(h.step().await, None);
        h.clock.advance(Duration::from_secs(1));
    }

    assert_eq!(h.step().await, Some(TaskState::Failed));
    assert_eq!(delivery.calls(), 4);

    let result = h.app.results().get_result(id).await.unwrap().unwrap();
    assert_eq!(result.status, ResultStatus::Failed);
    assert_eq!(result.reason, Some(FailureReason::RetriesExhausted));
    assert!(result.detail.contains("retries exhausted (3/3)"));
    assert!(result.detail.contains("smtp relay unreachable"));
}

#[tokio::test]
async fn rejected_delivery_fails_without_retry() {
    let delivery = Arc::new(Refusing {
        calls: AtomicU32::new(0),
    });
    let h = harness(Arc::clone(&delivery));
    let id = h
        .app
        .producer()
        .enqueue(&SendNotification::new("to nowhere"))
        .await
        .unwrap();

    assert_eq!(h.step().await, Some(TaskState::Failed));

    let status = h.app.results().status(id).await.unwrap().unwrap();
    assert_eq!(status.attempt, 0);
    let result = status.result.unwrap();
    assert_eq!(result.reason, Some(FailureReason::Validation));
    assert_eq!(result.detail, "delivery rejected: invalid recipient");

    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.step().await, None);
    assert_eq!(delivery.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn success_on_a_later_attempt() {
    let delivery = Scripted::new(2);
    let h = harness(Arc::clone(&delivery));
    let id = h
        .app
        .producer()
        .enqueue(&SendNotification::new("third time lucky"))
        .await
        .unwrap();

    assert_eq!(h.step().await, Some(TaskState::Retrying));
    h.clock.advance(Duration::from_secs(60));
    assert_eq!(h.step().await, Some(TaskState::Retrying));
    h.clock.advance(Duration::from_secs(60));
    assert_eq!(h.step().await, Some(TaskState::Succeeded));

    let result = h.app.results().get_result(id).await.unwrap().unwrap();
    assert!(result.is_success());
    assert_eq!(result.attempt, 2);
    assert_eq!(delivery.calls(), 3);
}

#[tokio::test]
async fn enqueue_then_dequeue_round_trips() {
    let h = harness(Scripted::new(0));
    let id = h
        .app
        .producer()
        .enqueue(&SendNotification::new("round trip"))
        .await
        .unwrap();

    let lease = h.broker.dequeue(Duration::ZERO).await.unwrap().unwrap();

    assert_eq!(lease.envelope().task_id(), id);
    assert_eq!(
        lease.envelope().payload(),
        &serde_json::json!({"message": "round trip"})
    );
    assert_eq!(lease.envelope().task_name().as_str(), SendNotification::NAME);
}

#[tokio::test]
async fn ten_thousand_enqueues_get_unique_ids() {
    let h = harness(Scripted::new(0));
    let mut ids = std::collections::HashSet::new();

    for i in 0..10_000 {
        let id = h
            .app
            .producer()
            .enqueue(&SendNotification::new(format!("n{i}")))
            .await
            .unwrap();
        ids.insert(id);
    }

    assert_eq!(ids.len(), 10_000);
    assert_eq!(h.broker.counts().await.unwrap().queued, 10_000);
}

#[tokio::test]
async fn unknown_task_name_fails_validation() {
    let h = harness(Scripted::new(0));
    let id = h
        .app
        .producer()
        .enqueue_raw("notification_tasks.nope", serde_json::json!({}), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(h.step().await, Some(TaskState::Failed));
    let result = h.app.results().get_result(id).await.unwrap().unwrap();
    assert_eq!(result.reason, Some(FailureReason::Validation));
    assert!(result.detail.contains("unknown task"));
}

#[tokio::test]
async fn malformed_payload_fails_validation() {
    let h = harness(Scripted::new(0));
    let id = h
        .app
        .producer()
        .enqueue_raw(SendNotification::NAME, serde_json::json!({"message": 42}), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(h.step().await, Some(TaskState::Failed));
    let result = h.app.results().get_result(id).await.unwrap().unwrap();
    assert_eq!(result.reason, Some(FailureReason::Validation));
}

#[tokio::test]
async fn scheduled_enqueue_waits_for_its_time() {
    let h = harness(Scripted::new(0));
    h.app
        .producer()
        .enqueue_in(&SendNotification::new("later"), Duration::from_secs(300))
        .await
        .unwrap();

    assert_eq!(h.step().await, None);
    h.clock.advance(Duration::from_secs(300));
    assert_eq!(h.step().await, Some(TaskState::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn hard_time_limit_fails_with_timeout() {
    let h = harness(Stuck);
    let id = h
        .app
        .producer()
        .enqueue(&SendNotification::new("slow"))
        .await
        .unwrap();

    assert_eq!(h.step().await, Some(TaskState::Failed));

    let result = h.app.results().get_result(id).await.unwrap().unwrap();
    assert_eq!(result.reason, Some(FailureReason::Timeout));
    assert_eq!(result.attempt, 0);
    assert!(result.detail.contains("1800s"));

    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.step().await, None);
}

#[tokio::test]
async fn abandoned_lease_is_redelivered_after_visibility_timeout() {
    let h = harness(Scripted::new(0));
    let id = h
        .app
        .producer()
        .enqueue(&SendNotification::new("crash me"))
        .await
        .unwrap();

    // a worker leases the envelope, marks it started, then dies
    let mut lease = h.broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
    let mut started = lease.envelope().clone();
    started.start().unwrap();
    lease.mark_started(&started).await.unwrap();
    drop(lease);

    assert_eq!(h.step().await, None);
    let status = h.app.results().status(id).await.unwrap().unwrap();
    assert_eq!(status.state, TaskState::Started);

    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.step().await, Some(TaskState::Succeeded));
}

#[tokio::test]
async fn worker_group_processes_everything_then_stops() {
    let h = harness(Scripted::new(0));
    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(
            h.app
                .producer()
                .enqueue(&SendNotification::new(format!("batch {i}")))
                .await
                .unwrap(),
        );
    }

    let group = h.app.spawn_workers(4, Duration::from_millis(10));
    for _ in 0..500 {
        if h.broker.counts().await.unwrap().succeeded == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    group.shutdown_and_join().await;

    let counts = h.broker.counts().await.unwrap();
    assert_eq!(counts.succeeded, 20);
    assert_eq!(counts.pending(), 0);
}
