use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tokio::time::Instant;

use crate::error::{LockError, QueueError};
use crate::lock::LockStore;
use crate::queue::{Job, Queue, QueueName};

// KEYS: pending, inflight, jobs. ARGV: now_ms, visibility_ms.
const CLAIM_SCRIPT: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('ZADD', KEYS[1], ARGV[1], id)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
  return false
end
local id = due[1]
redis.call('ZREM', KEYS[1], id)
local payload = redis.call('HGET', KEYS[3], id)
if not payload then
  return false
end
redis.call('ZADD', KEYS[2], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
return payload
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Redis-backed [`Queue`].
///
/// Delayed jobs sit in a sorted set scored by due time. A reserved job
/// moves to an in-flight set and returns to the pending set if it is not
/// acked within the visibility timeout.
pub struct RedisQueue {
    conn: MultiplexedConnection,
    prefix: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    claim: Script,
}

impl RedisQueue {
    pub async fn connect(
        client: &redis::Client,
        prefix: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(queue_backend)?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(250),
            claim: Script::new(CLAIM_SCRIPT),
        })
    }

    /// How long a reserved job may stay un-acked before it is redelivered.
    /// Must exceed the longest dispatch deadline.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn key(&self, queue: QueueName, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue.as_str(), suffix)
    }

    async fn try_claim(&self, queue: QueueName) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let payload: Option<String> = self
            .claim
            .key(self.key(queue, "pending"))
            .key(self.key(queue, "inflight"))
            .key(self.key(queue, "jobs"))
            .arg(now_ms)
            .arg(millis(self.visibility_timeout))
            .invoke_async(&mut conn)
            .await
            .map_err(queue_backend)?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn enqueue(&self, queue: QueueName, job: Job, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let due_ms = chrono::Utc::now()
            .timestamp_millis()
            .saturating_add(millis(delay));
        let payload = serde_json::to_string(&job)?;

        let _: () = redis::pipe()
            .atomic()
            .hset(self.key(queue, "jobs"), &job.id, payload)
            .ignore()
            .zadd(self.key(queue, "pending"), &job.id, due_ms)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(queue_backend)?;
        Ok(())
    }

    async fn reserve(&self, queue: QueueName, wait: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.try_claim(queue).await? {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, queue: QueueName, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.key(queue, "inflight"), &job.id)
            .ignore()
            .hdel(self.key(queue, "jobs"), &job.id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(queue_backend)?;
        Ok(())
    }
}

/// TTL locks via `SET NX PX`. Only the holder can release.
pub struct RedisLockStore {
    conn: MultiplexedConnection,
    prefix: String,
    owner: String,
    release: Script,
}

impl RedisLockStore {
    pub async fn connect(
        client: &redis::Client,
        prefix: impl Into<String>,
    ) -> Result<Self, LockError> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(lock_backend)?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            owner: uuid::Uuid::new_v4().to_string(),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(&self.owner)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl).max(1))
            .query_async(&mut conn)
            .await
            .map_err(lock_backend)?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release
            .key(self.key(key))
            .arg(&self.owner)
            .invoke_async(&mut conn)
            .await
            .map_err(lock_backend)?;
        Ok(())
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn queue_backend(err: redis::RedisError) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn lock_backend(err: redis::RedisError) -> LockError {
    LockError::Backend(err.to_string())
}
