use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::utils::fnv1a32;
use crate::utils::task::TaskGuard;

use super::redis_store::RedisStore;

/// 256 shards cut lock contention to roughly 1/256 of requests.
pub const SHARD_COUNT: usize = 256;
const SWEEPER_COUNT: usize = 16;
const SHARDS_PER_SWEEPER: usize = SHARD_COUNT / SWEEPER_COUNT;

/// Outcome of a rate-limit check, also used for response headers.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: u64,
}

#[derive(Debug)]
struct RateLimitEntry {
    timestamps: Vec<u64>,
    last_access: u64,
}

#[derive(Debug, Default)]
struct Shard {
    store: Mutex<HashMap<String, RateLimitEntry>>,
}

/// In-process sliding-window limiter sharded by FNV-1a of the key.
#[derive(Debug)]
pub struct ShardedRateLimiter {
    shards: Vec<Shard>,
    expiration: Duration,
}

impl ShardedRateLimiter {
    pub fn new(expiration: Duration) -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Shard::default());
        }
        Self { shards, expiration }
    }

    fn shard(&self, key: &str) -> &Shard {
        let idx = fnv1a32(key.as_bytes()) as usize % SHARD_COUNT;
        &self.shards[idx]
    }

    /// Checks and consumes one slot under `(limit, window_seconds)`.
    pub fn check(&self, key: &str, limit: u64, window_seconds: u64, now: u64) -> RateLimitDecision {
        let shard = self.shard(key);
        let mut store = match shard.store.lock() {
            Ok(store) => store,
            Err(poisoned) => poisoned.into_inner(),
        };

        let entry = store
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry {
                timestamps: Vec::with_capacity(limit as usize),
                last_access: now,
            });
        entry.last_access = now;

        let window_start = now.saturating_sub(window_seconds);
        entry.timestamps.retain(|ts| *ts > window_start);

        let reset_at = entry
            .timestamps
            .iter()
            .min()
            .map(|oldest| oldest + window_seconds)
            .unwrap_or(now + window_seconds);

        if (entry.timestamps.len() as u64) < limit {
            entry.timestamps.push(now);
            RateLimitDecision {
                allowed: true,
                remaining: limit - entry.timestamps.len() as u64,
                reset_at,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            }
        }
    }

    fn sweep_range(&self, start: usize, end: usize, now: u64) {
        let expiration_seconds = self.expiration.as_secs();
        for shard in &self.shards[start..end] {
            let mut store = match shard.store.lock() {
                Ok(store) => store,
                Err(poisoned) => poisoned.into_inner(),
            };
            store.retain(|_, entry| {
                now.saturating_sub(entry.last_access) <= expiration_seconds
                    && !entry.timestamps.is_empty()
            });
        }
    }

    /// Spawns the 16 background sweepers, each owning 16 shards. The
    /// returned guards abort the tasks on drop.
    pub(crate) fn start_sweepers(self: &Arc<Self>) -> Vec<TaskGuard> {
        let mut guards = Vec::with_capacity(SWEEPER_COUNT);
        for worker in 0..SWEEPER_COUNT {
            let limiter = self.clone();
            let handle = tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(limiter.expiration.max(Duration::from_secs(1)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let start = worker * SHARDS_PER_SWEEPER;
                    let end = start + SHARDS_PER_SWEEPER;
                    limiter.sweep_range(start, end, crate::utils::now_epoch_seconds());
                }
            });
            guards.push(TaskGuard::new(handle.abort_handle()));
        }
        guards
    }

    pub fn total_keys(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| match shard.store.lock() {
                Ok(store) => store.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .sum()
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut store = match shard.store.lock() {
                Ok(store) => store,
                Err(poisoned) => poisoned.into_inner(),
            };
            store.clear();
        }
    }
}

/// Ingress limiter: local sharded windows, or the Redis scripted windows
/// when a remote store is configured. Backend errors always fail open;
/// rate limiting is advisory, never load-shedding.
pub enum RateLimiter {
    Local(Arc<ShardedRateLimiter>),
    Remote(Arc<RedisStore>),
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimiter::Local(_) => f.write_str("RateLimiter::Local"),
            RateLimiter::Remote(_) => f.write_str("RateLimiter::Remote"),
        }
    }
}

impl RateLimiter {
    pub async fn check(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
        now: u64,
    ) -> RateLimitDecision {
        match self {
            RateLimiter::Local(limiter) => limiter.check(key, limit, window_seconds, now),
            RateLimiter::Remote(store) => {
                match store.sliding_window(key, limit, window_seconds, now).await {
                    Ok(decision) => decision,
                    Err(err) => {
                        tracing::warn!(error = %err, "rate limit backend error, failing open");
                        RateLimitDecision {
                            allowed: true,
                            remaining: limit.saturating_sub(1),
                            reset_at: now + window_seconds,
                        }
                    }
                }
            }
        }
    }
}
