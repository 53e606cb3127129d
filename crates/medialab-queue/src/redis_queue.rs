//! Redis-backed job queue
//!
//! Uses a Redis `ConnectionManager` for multiplexed access. Every state change
//! that spans more than one key runs as a Lua script.

use crate::keys::QueueKeys;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use medialab_core::{
    models::{Delivery, JobDescriptor, NackOutcome, QueueDepth, RetryPolicy},
    traits::JobQueue,
    AppError, AppResult,
};
use redis::{aio::ConnectionManager, Client, RedisError, Script};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Promote due delayed jobs, put expired leases back at the head of the ready
/// list, then lease the next job.
///
/// KEYS: ready, delayed, leases, jobs, attempts, tokens
/// ARGV: now_ms, lease_ms, token
const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])

local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('LPUSH', KEYS[1], id)
end

local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[3], id)
    redis.call('HDEL', KEYS[6], id)
    redis.call('RPUSH', KEYS[1], id)
end

while true do
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        return false
    end
    local payload = redis.call('HGET', KEYS[4], id)
    if payload then
        local attempt = redis.call('HINCRBY', KEYS[5], id, 1)
        local leased_until = now + tonumber(ARGV[2])
        redis.call('ZADD', KEYS[3], leased_until, id)
        redis.call('HSET', KEYS[6], id, ARGV[3])
        return {payload, attempt, leased_until}
    end
end
"#;

/// KEYS: leases, jobs, attempts, tokens
/// ARGV: job_id, token
const ACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

/// Returns `{-1}` when the lease is lost, `{0}` when attempts are exhausted
/// (job stays leased) and `{1, delay_ms}` when rescheduled.
///
/// KEYS: delayed, leases, attempts, tokens
/// ARGV: job_id, token, now_ms, max_attempts, delay_ms for attempt 1..max
const NACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[2] then
    return {-1}
end
local attempt = tonumber(redis.call('HGET', KEYS[3], ARGV[1]) or '0')
local max_attempts = tonumber(ARGV[4])
if attempt >= max_attempts then
    return {0}
end
local delay = tonumber(ARGV[4 + math.max(attempt, 1)])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('ZADD', KEYS[1], tonumber(ARGV[3]) + delay, ARGV[1])
return {1, delay}
"#;

/// KEYS: leases, tokens
/// ARGV: job_id, token, leased_until_ms
const EXTEND_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZADD', KEYS[1], 'XX', tonumber(ARGV[3]), ARGV[1])
return 1
"#;

/// Redis job queue with lease-based redelivery
#[derive(Clone)]
pub struct RedisJobQueue {
    manager: ConnectionManager,
    keys: QueueKeys,
    claim: Script,
    ack: Script,
    nack: Script,
    extend: Script,
}

impl RedisJobQueue {
    /// Connect to Redis and bind to the queue `name` under `prefix`
    pub async fn new(url: &str, prefix: &str, name: &str) -> AppResult<Self> {
        debug!("Connecting to Redis at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::QueueConnection(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            AppError::QueueConnection(format!("Connection failed: {}", e))
        })?;

        info!("Job queue {} connected", name);
        Ok(Self::with_manager(manager, prefix, name))
    }

    /// Build on an existing connection manager
    pub fn with_manager(manager: ConnectionManager, prefix: &str, name: &str) -> Self {
        Self {
            manager,
            keys: QueueKeys::new(prefix, name),
            claim: Script::new(CLAIM_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            nack: Script::new(NACK_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Ping the Redis server to check connectivity
    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    /// Convert RedisError to AppError
    fn map_redis_error(err: RedisError) -> AppError {
        match err.kind() {
            redis::ErrorKind::IoError => {
                error!("Redis I/O error: {}", err);
                AppError::QueueConnection(format!("I/O error: {}", err))
            }
            redis::ErrorKind::TypeError => {
                warn!("Redis type error: {}", err);
                AppError::Queue(format!("Type mismatch: {}", err))
            }
            _ => {
                error!("Redis error: {}", err);
                AppError::Queue(err.to_string())
            }
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job), fields(job_id = %job.job_id, operation_id = %job.operation_id))]
    async fn enqueue(&self, job: &JobDescriptor) -> AppResult<()> {
        let payload = serde_json::to_string(job)?;
        let id = job.job_id.to_string();
        let mut conn = self.manager.clone();

        redis::pipe()
            .atomic()
            .hset(&self.keys.jobs, &id, payload)
            .ignore()
            .hdel(&self.keys.attempts, &id)
            .ignore()
            .lpush(&self.keys.ready, &id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;

        debug!("Enqueued job");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn dequeue(&self, lease: Duration) -> AppResult<Option<Delivery>> {
        let token = Uuid::new_v4();
        let mut conn = self.manager.clone();

        let claimed: Option<(String, u32, i64)> = self
            .claim
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.leases)
            .key(&self.keys.jobs)
            .key(&self.keys.attempts)
            .key(&self.keys.tokens)
            .arg(Self::now_ms())
            .arg(lease.as_millis() as i64)
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;

        let Some((payload, attempt, leased_until_ms)) = claimed else {
            return Ok(None);
        };

        let descriptor: JobDescriptor = serde_json::from_str(&payload)?;
        let leased_until = Utc
            .timestamp_millis_opt(leased_until_ms)
            .single()
            .unwrap_or_else(Utc::now);

        debug!(
            "Leased job {} (attempt {}) until {}",
            descriptor.job_id, attempt, leased_until
        );

        Ok(Some(Delivery {
            descriptor,
            attempt,
            lease_token: token,
            leased_until,
        }))
    }

    #[instrument(skip(self))]
    async fn ack(&self, job_id: Uuid, lease_token: Uuid) -> AppResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .ack
            .key(&self.keys.leases)
            .key(&self.keys.jobs)
            .key(&self.keys.attempts)
            .key(&self.keys.tokens)
            .arg(job_id.to_string())
            .arg(lease_token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;

        if removed == 0 {
            warn!("Ack rejected for job {}: lease no longer held", job_id);
        }
        Ok(removed == 1)
    }

    #[instrument(skip(self, policy))]
    async fn nack(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        policy: &RetryPolicy,
    ) -> AppResult<NackOutcome> {
        let mut conn = self.manager.clone();

        let mut invocation = self.nack.prepare_invoke();
        invocation
            .key(&self.keys.delayed)
            .key(&self.keys.leases)
            .key(&self.keys.attempts)
            .key(&self.keys.tokens)
            .arg(job_id.to_string())
            .arg(lease_token.to_string())
            .arg(Self::now_ms())
            .arg(policy.max_attempts);
        for attempt in 1..=policy.max_attempts.max(1) {
            invocation.arg(policy.delay_for(attempt).as_millis() as i64);
        }

        let reply: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;

        let outcome = match reply.as_slice() {
            [1, delay_ms, ..] => NackOutcome::Requeued {
                delay: Duration::from_millis((*delay_ms).max(0) as u64),
            },
            [0, ..] => NackOutcome::Exhausted,
            _ => NackOutcome::LeaseLost,
        };

        debug!("Nack for job {}: {:?}", job_id, outcome);
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn extend_lease(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        lease: Duration,
    ) -> AppResult<bool> {
        let mut conn = self.manager.clone();
        let extended: i64 = self
            .extend
            .key(&self.keys.leases)
            .key(&self.keys.tokens)
            .arg(job_id.to_string())
            .arg(lease_token.to_string())
            .arg(Self::now_ms() + lease.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;

        Ok(extended == 1)
    }

    async fn depth(&self) -> AppResult<QueueDepth> {
        let mut conn = self.manager.clone();
        let (ready, delayed, in_flight): (u64, u64, u64) = redis::pipe()
            .llen(&self.keys.ready)
            .zcard(&self.keys.delayed)
            .zcard(&self.keys.leases)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;

        Ok(QueueDepth {
            ready,
            delayed,
            in_flight,
        })
    }
}
