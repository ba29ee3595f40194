//! Redis store backend.
//!
//! The whole consume transition runs as a single Lua script so that
//! concurrent callers in different processes cannot spend the same budget
//! twice. The script reads the clock from the Redis server, which keeps every
//! process on one timeline.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::StoreBackend;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{ConsumptionResult, Quota};

/// Record layout: hash with fields `remaining`, `expires_at`, `blocked_until`
/// (unix milliseconds). Returns `{allowed, remaining, ms_before_next, reset_at}`.
const CONSUME_SCRIPT: &str = r#"
redis.replicate_commands()

local key = KEYS[1]
local points = tonumber(ARGV[1])
local duration_ms = tonumber(ARGV[2])
local block_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local rec = redis.call('HMGET', key, 'remaining', 'expires_at', 'blocked_until')
local remaining = tonumber(rec[1])
local expires_at = tonumber(rec[2])
local blocked_until = tonumber(rec[3])

if blocked_until and now < blocked_until then
  return {0, 0, blocked_until - now, blocked_until}
end

if (not remaining) or (not expires_at) or now >= expires_at then
  remaining = points
  expires_at = now + duration_ms
  redis.call('HDEL', key, 'blocked_until')
end

if remaining >= cost then
  remaining = remaining - cost
  redis.call('HSET', key, 'remaining', remaining, 'expires_at', expires_at)
  redis.call('PEXPIREAT', key, expires_at)
  return {1, remaining, expires_at - now, expires_at}
end

local reset_at = expires_at
if block_ms > 0 then
  reset_at = now + block_ms
  redis.call('HSET', key, 'blocked_until', reset_at)
end
redis.call('HSET', key, 'remaining', remaining, 'expires_at', expires_at)
redis.call('PEXPIREAT', key, math.max(expires_at, reset_at))
return {0, remaining, reset_at - now, reset_at}
"#;

/// Store backend shared across processes through Redis.
///
/// The connection is established lazily on first use and every round trip is
/// bounded by `timeout`; exceeding it is reported as
/// [`TollgateError::StoreUnavailable`].
pub struct RedisStore {
    client: redis::Client,
    script: redis::Script,
    connection: Mutex<Option<ConnectionManager>>,
    timeout: Duration,
}

impl RedisStore {
    /// Create a new Redis store for the given URL. No connection is made yet.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| TollgateError::Config(format!("invalid redis url '{}': {}", url, e)))?;

        Ok(Self {
            client,
            script: redis::Script::new(CONSUME_SCRIPT),
            connection: Mutex::new(None),
            timeout,
        })
    }

    /// Get the shared connection, connecting if needed.
    async fn connection(&self) -> Result<ConnectionManager> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self
            .bounded(ConnectionManager::new(self.client.clone()))
            .await?;
        info!(timeout_ms = self.timeout.as_millis() as u64, "Connected to Redis");

        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    /// Run a Redis future under the store timeout.
    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    // Force a reconnect on the next call
                    self.connection.lock().take();
                }
                TollgateError::from(e)
            }),
            Err(_) => Err(TollgateError::StoreUnavailable(format!(
                "redis round trip exceeded {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl StoreBackend for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn consume(&self, key: &str, cost: u32, quota: &Quota) -> Result<ConsumptionResult> {
        let mut conn = self.connection().await?;

        let mut invocation = self.script.key(key);
        invocation
            .arg(quota.points)
            .arg(quota.duration_ms)
            .arg(quota.block_ms)
            .arg(cost);

        let reply: Vec<i64> = self.bounded(invocation.invoke_async(&mut conn)).await?;
        let [allowed, remaining, ms_before_next, reset_at_ms] = reply[..] else {
            return Err(TollgateError::StoreUnavailable(format!(
                "unexpected reply from consume script: {:?}",
                reply
            )));
        };

        debug!(key = %key, allowed = allowed == 1, remaining = remaining, "Redis consume");

        Ok(ConsumptionResult {
            allowed: allowed == 1,
            remaining_points: remaining.max(0) as u32,
            ms_before_next,
            limit: quota.points,
            reset_at_ms,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn shutdown(&self) {
        if self.connection.lock().take().is_some() {
            info!("Closed Redis connection");
        }
    }
}
