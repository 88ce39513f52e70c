//! Redis-backed broker.
//!
//! # Layout (all keys share a prefix, `herald` by default)
//! - `{p}:envelopes`   hash, task id -> envelope JSON, for non-terminal envelopes
//! - `{p}:scheduled`   zset, task id scored by `not_before` (ms)
//! - `{p}:inflight`    zset, task id scored by lease visibility deadline (ms)
//! - `{p}:leases`      hash, task id -> lease token
//! - `{p}:totals`      hash, terminal state -> lifetime count
//! - `{p}:done:{id}`   terminal envelope JSON, expires after the result TTL
//! - `{p}:result:{id}` result record JSON, expires after the result TTL
//!
//! Every multi-key transition runs as a Lua script so two workers can never
//! lease the same envelope or finish each other's lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::Script;
use redis::aio::ConnectionManager;

use super::codec;
use crate::domain::{ResultRecord, TaskEnvelope, TaskId, TaskState};
use crate::error::TransportError;
use crate::observability::{QueueCounts, TaskStatus};
use crate::ports::{Broker, Clock, ResultBackend, SystemClock, TaskLease};

/// Reclaim expired leases, then lease the earliest due envelope.
///
/// Returns `{id, body}` on success, `{id}` when the id had no body, or nil.
const LEASE_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[4], id)
  redis.call('ZADD', KEYS[1], ARGV[1], id)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
  return false
end
local id = due[1]
redis.call('ZREM', KEYS[1], id)
local body = redis.call('HGET', KEYS[3], id)
if not body then
  return {id}
end
redis.call('ZADD', KEYS[2], ARGV[2], id)
redis.call('HSET', KEYS[4], id, ARGV[3])
return {id, body}
"#;

/// Overwrite a leased envelope if the lease token still matches.
const MARK_STARTED_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
return 1
"#;

/// Release a lease and reschedule the envelope at `ARGV[4]` (ms).
const RETRY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[1], ARGV[4], ARGV[1])
return 1
"#;

/// Release a lease, move the envelope out of the live hash and store the
/// result with a TTL.
const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('SET', KEYS[4], ARGV[3], 'EX', ARGV[5])
redis.call('SET', KEYS[5], ARGV[4], 'EX', ARGV[5])
redis.call('HINCRBY', KEYS[6], ARGV[6], 1)
return 1
"#;

#[derive(Debug, Clone)]
pub struct RedisBrokerOptions {
    pub key_prefix: String,
    pub visibility_timeout: Duration,
    pub result_ttl: Duration,
    /// How often a waiting `dequeue` polls for due envelopes.
    pub poll_interval: Duration,
}

impl Default for RedisBrokerOptions {
    fn default() -> Self {
        Self {
            key_prefix: "herald".to_string(),
            visibility_timeout: Duration::from_secs(3600),
            result_ttl: Duration::from_secs(86_400),
            poll_interval: Duration::from_secs(1),
        }
    }
}

struct Keys {
    prefix: String,
    envelopes: String,
    scheduled: String,
    inflight: String,
    leases: String,
    totals: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            envelopes: format!("{prefix}:envelopes"),
            scheduled: format!("{prefix}:scheduled"),
            inflight: format!("{prefix}:inflight"),
            leases: format!("{prefix}:leases"),
            totals: format!("{prefix}:totals"),
        }
    }

    fn done(&self, task_id: TaskId) -> String {
        format!("{}:done:{}", self.prefix, task_id.as_ulid())
    }

    fn result(&self, task_id: TaskId) -> String {
        format!("{}:result:{}", self.prefix, task_id.as_ulid())
    }
}

struct Scripts {
    lease: Script,
    mark_started: Script,
    retry: Script,
    complete: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            lease: Script::new(LEASE_SCRIPT),
            mark_started: Script::new(MARK_STARTED_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
        }
    }
}

/// State shared by the broker and every lease it hands out.
struct Shared {
    conn: ConnectionManager,
    keys: Keys,
    scripts: Scripts,
    options: RedisBrokerOptions,
}

/// Broker and result store in Redis, shared by producer and worker processes.
#[derive(Clone)]
pub struct RedisBroker {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
}

impl RedisBroker {
    pub async fn connect(url: &str, options: RedisBrokerOptions) -> Result<Self, TransportError> {
        Self::connect_with_clock(url, options, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        url: &str,
        options: RedisBrokerOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(prefix = %options.key_prefix, "connected to redis broker");
        Ok(Self {
            shared: Arc::new(Shared {
                conn,
                keys: Keys::new(&options.key_prefix),
                scripts: Scripts::new(),
                options,
            }),
            clock,
        })
    }

    /// `PING`, for readiness checks.
    pub async fn ping(&self) -> Result<(), TransportError> {
        let mut conn = self.shared.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn try_lease(&self) -> Result<Option<Box<dyn TaskLease>>, TransportError> {
        let shared = &self.shared;
        loop {
            let now = self.clock.now();
            let visible_at = now
                .checked_add_signed(to_chrono(shared.options.visibility_timeout))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let token = rand::random::<u64>().to_string();

            let mut conn = shared.conn.clone();
            let leased: Option<Vec<String>> = shared
                .scripts
                .lease
                .key(&shared.keys.scheduled)
                .key(&shared.keys.inflight)
                .key(&shared.keys.envelopes)
                .key(&shared.keys.leases)
                .arg(millis(now))
                .arg(millis(visible_at))
                .arg(&token)
                .invoke_async(&mut conn)
                .await?;

            let Some(leased) = leased else {
                return Ok(None);
            };
            let [id, body] = leased.as_slice() else {
                tracing::warn!(task_id = ?leased.first(), "scheduled id without envelope; dropped");
                continue;
            };

            let mut envelope: TaskEnvelope = match codec::decode(body) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::error!(task_id = %id, error = %err, "undecodable envelope; dropped");
                    self.forget(id).await?;
                    continue;
                }
            };

            if envelope.state().is_terminal() {
                tracing::warn!(task_id = %envelope.task_id(), state = %envelope.state(), "terminal envelope on queue; dropped");
                self.forget(id).await?;
                continue;
            }
            if envelope.state() == TaskState::Started {
                // state is Started here, so reclaim cannot fail
                let _ = envelope.reclaim();
                tracing::warn!(
                    task_id = %envelope.task_id(),
                    attempt = envelope.attempt(),
                    "visibility timeout expired; redelivering"
                );
            }

            return Ok(Some(Box::new(RedisLease {
                task_id: envelope.task_id(),
                envelope,
                token,
                shared: Arc::clone(shared),
            })));
        }
    }

    async fn forget(&self, id: &str) -> Result<(), TransportError> {
        let mut conn = self.shared.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hdel(&self.shared.keys.envelopes, id)
            .ignore()
            .hdel(&self.shared.keys.leases, id)
            .ignore()
            .zrem(&self.shared.keys.inflight, id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_envelope(&self, task_id: TaskId) -> Result<Option<TaskEnvelope>, TransportError> {
        let mut conn = self.shared.conn.clone();
        let id = task_id.as_ulid().to_string();
        let live: Option<String> = conn.hget(&self.shared.keys.envelopes, &id).await?;
        let raw: Option<String> = match live {
            Some(raw) => Some(raw),
            None => conn.get(self.shared.keys.done(task_id)).await?,
        };
        raw.as_deref().map(codec::decode).transpose()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<(), TransportError> {
        let body = codec::encode(&envelope)?;
        let id = envelope.task_id().as_ulid().to_string();
        let mut conn = self.shared.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(&self.shared.keys.envelopes, &id, body)
            .ignore()
            .zadd(&self.shared.keys.scheduled, &id, millis(envelope.not_before()))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Box<dyn TaskLease>>, TransportError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_lease().await? {
                return Ok(Some(lease));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.shared.options.poll_interval.min(deadline - now)).await;
        }
    }

    async fn counts(&self) -> Result<QueueCounts, TransportError> {
        let mut conn = self.shared.conn.clone();
        let bodies: Vec<String> = conn.hvals(&self.shared.keys.envelopes).await?;
        let mut counts = QueueCounts::default();
        for body in &bodies {
            let envelope: TaskEnvelope = codec::decode(body)?;
            counts.record(envelope.state());
        }

        let (succeeded, failed): (Option<usize>, Option<usize>) = redis::cmd("HMGET")
            .arg(&self.shared.keys.totals)
            .arg(TaskState::Succeeded.as_str())
            .arg(TaskState::Failed.as_str())
            .query_async(&mut conn)
            .await?;
        counts.succeeded = succeeded.unwrap_or(0);
        counts.failed = failed.unwrap_or(0);
        Ok(counts)
    }
}

#[async_trait]
impl ResultBackend for RedisBroker {
    async fn get_result(&self, task_id: TaskId) -> Result<Option<ResultRecord>, TransportError> {
        let mut conn = self.shared.conn.clone();
        let raw: Option<String> = conn.get(self.shared.keys.result(task_id)).await?;
        raw.as_deref().map(codec::decode).transpose()
    }

    async fn status(&self, task_id: TaskId) -> Result<Option<TaskStatus>, TransportError> {
        let Some(envelope) = self.load_envelope(task_id).await? else {
            return Ok(None);
        };
        let result = if envelope.state().is_terminal() {
            self.get_result(task_id).await?
        } else {
            None
        };
        Ok(Some(TaskStatus::from_envelope(&envelope, result)))
    }
}

struct RedisLease {
    task_id: TaskId,
    envelope: TaskEnvelope,
    token: String,
    shared: Arc<Shared>,
}

impl RedisLease {
    fn id(&self) -> String {
        self.task_id.as_ulid().to_string()
    }

    fn check(&self, applied: i64) -> Result<(), TransportError> {
        if applied == 1 {
            Ok(())
        } else {
            Err(TransportError::LeaseLost(self.task_id))
        }
    }
}

#[async_trait]
impl TaskLease for RedisLease {
    fn envelope(&self) -> &TaskEnvelope {
        &self.envelope
    }

    async fn mark_started(&mut self, envelope: &TaskEnvelope) -> Result<(), TransportError> {
        let body = codec::encode(envelope)?;
        let mut conn = self.shared.conn.clone();
        let applied: i64 = self
            .shared
            .scripts
            .mark_started
            .key(&self.shared.keys.envelopes)
            .key(&self.shared.keys.leases)
            .arg(self.id())
            .arg(&self.token)
            .arg(body)
            .invoke_async(&mut conn)
            .await?;
        self.check(applied)?;
        self.envelope = envelope.clone();
        Ok(())
    }

    async fn retry(self: Box<Self>, envelope: TaskEnvelope) -> Result<(), TransportError> {
        let body = codec::encode(&envelope)?;
        let mut conn = self.shared.conn.clone();
        let applied: i64 = self
            .shared
            .scripts
            .retry
            .key(&self.shared.keys.scheduled)
            .key(&self.shared.keys.inflight)
            .key(&self.shared.keys.envelopes)
            .key(&self.shared.keys.leases)
            .arg(self.id())
            .arg(&self.token)
            .arg(body)
            .arg(millis(envelope.not_before()))
            .invoke_async(&mut conn)
            .await?;
        self.check(applied)
    }

    async fn complete(
        self: Box<Self>,
        envelope: TaskEnvelope,
        result: ResultRecord,
    ) -> Result<(), TransportError> {
        let body = codec::encode(&envelope)?;
        let result_body = codec::encode(&result)?;
        let ttl = self.shared.options.result_ttl.as_secs().max(1);
        let mut conn = self.shared.conn.clone();
        let applied: i64 = self
            .shared
            .scripts
            .complete
            .key(&self.shared.keys.inflight)
            .key(&self.shared.keys.envelopes)
            .key(&self.shared.keys.leases)
            .key(self.shared.keys.done(self.task_id))
            .key(self.shared.keys.result(self.task_id))
            .key(&self.shared.keys.totals)
            .arg(self.id())
            .arg(&self.token)
            .arg(body)
            .arg(result_body)
            .arg(ttl)
            .arg(envelope.state().as_str())
            .invoke_async(&mut conn)
            .await?;
        self.check(applied)
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
