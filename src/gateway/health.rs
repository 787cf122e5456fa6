use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

/// Mutable per-channel counters. Updated under the channel's own lock;
/// `successes + failures == total` holds at every observation boundary.
#[derive(Debug, Default)]
struct ChannelHealth {
    total: u64,
    successes: u64,
    failures: u64,
    total_latency_ms: u64,
    last_latency_ms: u64,
    consecutive_failures: u32,
    last_success_ms: u64,
    last_error_ms: u64,
}

/// Immutable snapshot of one channel's health, with derived scores.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct HealthView {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub last_latency_ms: u64,
    pub consecutive_failures: u32,
    pub last_success_ms: u64,
    pub last_error_ms: u64,
}

impl HealthView {
    /// No data means "assume healthy until proven otherwise".
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.successes as f64 / self.total as f64
    }

    fn fail_penalty(&self) -> f64 {
        if self.consecutive_failures == 0 {
            return 1.0;
        }
        1.0 / f64::from(1 + self.consecutive_failures)
    }

    /// Health score; higher is better.
    pub fn score(&self, weight: f64) -> f64 {
        let weight = if weight <= 0.0 { 1.0 } else { weight };
        let avg_latency_ms = self.avg_latency_ms.max(1.0);
        (self.success_rate() * weight * self.fail_penalty() * 1000.0) / avg_latency_ms
    }

    /// Strategy-weighted score combining success rate, latency, and cost.
    pub fn score_with_strategy(
        &self,
        weight: f64,
        strategy: &SelectionStrategy,
        cost_ratio: f64,
    ) -> f64 {
        let weight = if weight <= 0.0 { 1.0 } else { weight };
        let cost_ratio = if cost_ratio <= 0.0 { 1.0 } else { cost_ratio };

        let health_score = self.success_rate();

        let avg_latency_ms = self.avg_latency_ms.max(1.0);
        // 100ms = 1.0, 500ms = 0.2, 1000ms = 0.1
        let speed_score = (100.0 / avg_latency_ms).min(1.0);

        let cost_score = 1.0 / (1.0 + cost_ratio);

        let total = health_score * strategy.quality
            + speed_score * strategy.speed
            + cost_score * strategy.cost;

        total * weight * self.fail_penalty() * 1000.0
    }
}

impl ChannelHealth {
    fn view(&self) -> HealthView {
        let avg_latency_ms = if self.total == 0 {
            100.0
        } else {
            self.total_latency_ms as f64 / self.total as f64
        };
        HealthView {
            total: self.total,
            successes: self.successes,
            failures: self.failures,
            avg_latency_ms,
            last_latency_ms: self.last_latency_ms,
            consecutive_failures: self.consecutive_failures,
            last_success_ms: self.last_success_ms,
            last_error_ms: self.last_error_ms,
        }
    }
}

/// Tracks success/latency/failure statistics for every channel.
///
/// Observations never fail; a channel with no data yields a neutral view.
#[derive(Debug, Default)]
pub struct HealthTracker {
    channels: RwLock<HashMap<i64, Arc<Mutex<ChannelHealth>>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, channel_id: i64) -> Arc<Mutex<ChannelHealth>> {
        if let Some(health) = self
            .channels
            .read()
            .ok()
            .and_then(|channels| channels.get(&channel_id).cloned())
        {
            return health;
        }

        let mut channels = match self.channels.write() {
            Ok(channels) => channels,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(channel_id)
            .or_insert_with(|| Arc::new(Mutex::new(ChannelHealth::default())))
            .clone()
    }

    pub fn observe(&self, channel_id: i64, latency_ms: u64, success: bool, now_ms: u64) {
        let health = self.get_or_create(channel_id);
        let mut health = match health.lock() {
            Ok(health) => health,
            Err(poisoned) => poisoned.into_inner(),
        };

        health.total = health.total.saturating_add(1);
        health.total_latency_ms = health.total_latency_ms.saturating_add(latency_ms);
        health.last_latency_ms = latency_ms;
        if success {
            health.successes = health.successes.saturating_add(1);
            health.last_success_ms = now_ms;
            health.consecutive_failures = 0;
        } else {
            health.failures = health.failures.saturating_add(1);
            health.last_error_ms = now_ms;
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        }
    }

    pub fn snapshot(&self, channel_id: i64) -> Option<HealthView> {
        let health = self.channels.read().ok()?.get(&channel_id).cloned()?;
        let health = match health.lock() {
            Ok(health) => health,
            Err(poisoned) => poisoned.into_inner(),
        };
        Some(health.view())
    }

    /// Per-channel stats map for the diagnostics surface.
    pub fn stats(&self) -> HashMap<i64, HealthView> {
        let channels = match self.channels.read() {
            Ok(channels) => channels,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .iter()
            .map(|(id, health)| {
                let health = match health.lock() {
                    Ok(health) => health,
                    Err(poisoned) => poisoned.into_inner(),
                };
                (*id, health.view())
            })
            .collect()
    }
}

/// Weights used to rank candidate channels; the three components sum to 1.0.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct SelectionStrategy {
    pub name: &'static str,
    pub quality: f64,
    pub speed: f64,
    pub cost: f64,
}

pub const STRATEGY_BALANCED: SelectionStrategy = SelectionStrategy {
    name: "balanced",
    quality: 0.4,
    speed: 0.3,
    cost: 0.3,
};

pub const STRATEGY_PERFORMANCE: SelectionStrategy = SelectionStrategy {
    name: "performance",
    quality: 0.3,
    speed: 0.5,
    cost: 0.2,
};

pub const STRATEGY_COST: SelectionStrategy = SelectionStrategy {
    name: "cost",
    quality: 0.2,
    speed: 0.2,
    cost: 0.6,
};

pub const STRATEGY_RESILIENT: SelectionStrategy = SelectionStrategy {
    name: "resilient",
    quality: 0.6,
    speed: 0.2,
    cost: 0.2,
};

/// Named preset lookup; unknown names fall back to balanced.
pub fn strategy_for(name: &str) -> SelectionStrategy {
    match name {
        "balanced" => STRATEGY_BALANCED,
        "performance" => STRATEGY_PERFORMANCE,
        "cost" => STRATEGY_COST,
        "resilient" => STRATEGY_RESILIENT,
        _ => STRATEGY_BALANCED,
    }
}
