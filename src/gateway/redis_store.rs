use std::time::Duration;

use redis::AsyncCommands;
use thiserror::Error;

use super::limits::RateLimitDecision;

const SCRIPT_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

const EXACT_CACHE_PREFIX: &str = "llm:cache:exact:";
const SEMANTIC_PREFIX: &str = "llm:semantic:";
const SEMANTIC_INDEX_KEY: &str = "llm:semantic:index";
const SEMANTIC_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// Sliding-window rate limit in a single round-trip.
// KEYS[1]: rate limit key
// ARGV: now_ms, window_ms, max_requests
// Returns {allowed (0/1), remaining, reset_at_ms}
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max_requests = tonumber(ARGV[3])

local window_start = now - window
redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)

local current_count = redis.call('ZCARD', key)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local reset_at = now + window
if #oldest > 0 then
    reset_at = tonumber(oldest[2]) + window
end

if current_count < max_requests then
    redis.call('ZADD', key, now, now .. ':' .. math.random(1000000))
    redis.call('PEXPIRE', key, window + 1000)
    return {1, max_requests - current_count - 1, reset_at}
else
    return {0, 0, reset_at}
end
"#;

// Token bucket for non-windowed limits.
// KEYS[1]: bucket key
// ARGV: now_s, capacity, refill_rate, tokens_requested
// Returns {allowed (0/1), remaining_tokens, next_refill_at}
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'last_update')
local tokens = tonumber(bucket[1])
local last_update = tonumber(bucket[2])

if tokens == nil then
    tokens = capacity
    last_update = now
end

local elapsed = now - last_update
local refill = elapsed * refill_rate
tokens = math.min(capacity, tokens + refill)

if tokens >= requested then
    tokens = tokens - requested
    redis.call('HMSET', key, 'tokens', tokens, 'last_update', now)
    redis.call('EXPIRE', key, math.ceil(capacity / refill_rate) + 10)
    return {1, math.floor(tokens), now + math.ceil(requested / refill_rate)}
else
    redis.call('HMSET', key, 'tokens', tokens, 'last_update', now)
    redis.call('EXPIRE', key, math.ceil(capacity / refill_rate) + 10)
    local wait_time = math.ceil((requested - tokens) / refill_rate)
    return {0, math.floor(tokens), now + wait_time}
end
"#;

// Atomic quota decrement with a floor.
// KEYS[1]: quota key
// ARGV: amount, min_value
// Returns {new_value, was_updated (0/1)}
const DECREMENT_QUOTA_SCRIPT: &str = r#"
local key = KEYS[1]
local decrement = tonumber(ARGV[1])
local min_value = tonumber(ARGV[2])

local current = tonumber(redis.call('GET', key))
if current == nil then
    return {-1, 0}
end

local new_value = current - decrement
if new_value < min_value then
    return {current, 0}
end

redis.call('DECRBY', key, decrement)
return {new_value, 1}
"#;

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected script reply: {0}")]
    ScriptReply(String),
}

/// Remote KV store with Lua scripting: distributed rate limits, atomic
/// quota movements, and cache persistence.
///
/// `redis::Script` caches each script's SHA1 and transparently falls back
/// to EVAL when the server replies NOSCRIPT, which is exactly the loader
/// contract the limiter needs.
pub struct RedisStore {
    client: redis::Client,
    sliding_window: redis::Script,
    token_bucket: redis::Script,
    decrement_quota: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish()
    }
}

impl RedisStore {
    pub fn connect(url: &str) -> Result<Self, RedisStoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            sliding_window: redis::Script::new(SLIDING_WINDOW_SCRIPT),
            token_bucket: redis::Script::new(TOKEN_BUCKET_SCRIPT),
            decrement_quota: redis::Script::new(DECREMENT_QUOTA_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get("__dispatch_ping__").await?;
        Ok(())
    }

    /// Pre-loads every script so the hot path starts with warm SHAs.
    pub async fn load_scripts(&self) -> Result<(), RedisStoreError> {
        let load = async {
            let mut conn = self.connection().await?;
            for script in [
                SLIDING_WINDOW_SCRIPT,
                TOKEN_BUCKET_SCRIPT,
                DECREMENT_QUOTA_SCRIPT,
            ] {
                let _: String = redis::cmd("SCRIPT")
                    .arg("LOAD")
                    .arg(script)
                    .query_async(&mut conn)
                    .await?;
            }
            Ok::<(), redis::RedisError>(())
        };
        match tokio::time::timeout(SCRIPT_LOAD_TIMEOUT, load).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RedisStoreError::ScriptReply(
                "script load timed out".to_string(),
            )),
        }
    }

    pub async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
        now: u64,
    ) -> Result<RateLimitDecision, RedisStoreError> {
        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .sliding_window
            .key(format!("ratelimit:{key}"))
            .arg(now.saturating_mul(1000))
            .arg(window_seconds.saturating_mul(1000))
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        if reply.len() < 3 {
            return Err(RedisStoreError::ScriptReply(format!(
                "sliding window returned {} values",
                reply.len()
            )));
        }

        Ok(RateLimitDecision {
            allowed: reply[0] == 1,
            remaining: reply[1].max(0) as u64,
            reset_at: (reply[2].max(0) as u64) / 1000,
        })
    }

    pub async fn token_bucket(
        &self,
        key: &str,
        capacity: u64,
        refill_rate: f64,
        tokens_requested: u64,
        now: u64,
    ) -> Result<RateLimitDecision, RedisStoreError> {
        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .token_bucket
            .key(format!("tokenbucket:{key}"))
            .arg(now)
            .arg(capacity)
            .arg(refill_rate)
            .arg(tokens_requested)
            .invoke_async(&mut conn)
            .await?;

        if reply.len() < 3 {
            return Err(RedisStoreError::ScriptReply(format!(
                "token bucket returned {} values",
                reply.len()
            )));
        }

        Ok(RateLimitDecision {
            allowed: reply[0] == 1,
            remaining: reply[1].max(0) as u64,
            reset_at: reply[2].max(0) as u64,
        })
    }

    /// Atomically decrements a quota counter, refusing to cross `min_value`.
    /// Returns `(new_value, was_updated)`.
    pub async fn decrement_quota(
        &self,
        key: &str,
        amount: i64,
        min_value: i64,
    ) -> Result<(i64, bool), RedisStoreError> {
        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .decrement_quota
            .key(key)
            .arg(amount)
            .arg(min_value)
            .invoke_async(&mut conn)
            .await?;

        if reply.len() < 2 {
            return Err(RedisStoreError::ScriptReply(format!(
                "quota decrement returned {} values",
                reply.len()
            )));
        }
        Ok((reply[0], reply[1] == 1))
    }

    pub async fn exact_cache_get(&self, fingerprint: &str) -> Result<Option<String>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(format!("{EXACT_CACHE_PREFIX}{fingerprint}")).await?;
        Ok(value)
    }

    pub async fn exact_cache_set(
        &self,
        fingerprint: &str,
        payload: &str,
        ttl: Duration,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .set_ex(
                format!("{EXACT_CACHE_PREFIX}{fingerprint}"),
                payload,
                ttl.as_secs().max(1),
            )
            .await?;
        Ok(())
    }

    pub async fn exact_cache_delete(&self, fingerprint: &str) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(format!("{EXACT_CACHE_PREFIX}{fingerprint}")).await?;
        Ok(())
    }

    /// Best-effort SCAN-based clear of the exact cache; entries written
    /// concurrently may survive.
    pub async fn exact_cache_clear(&self) -> Result<u64, RedisStoreError> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{EXACT_CACHE_PREFIX}*"))
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let deleted: u64 = conn.del(keys).await?;
                removed = removed.saturating_add(deleted);
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }

    pub async fn semantic_store(
        &self,
        key: &str,
        payload: &str,
        index: &[String],
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let ttl = SEMANTIC_TTL.as_secs();
        let _: () = conn
            .set_ex(format!("{SEMANTIC_PREFIX}{key}"), payload, ttl)
            .await?;
        let index_json = serde_json::to_string(index)?;
        let _: () = conn.set_ex(SEMANTIC_INDEX_KEY, index_json, ttl).await?;
        Ok(())
    }

    pub async fn semantic_load_index(&self) -> Result<Vec<String>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(SEMANTIC_INDEX_KEY).await?;
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn semantic_load_entry(&self, key: &str) -> Result<Option<String>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(format!("{SEMANTIC_PREFIX}{key}")).await?;
        Ok(value)
    }
}
