use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }

    fn from_i32(raw: i32) -> BreakerState {
        match raw {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    fn as_i32(&self) -> i32 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_max_failures() -> u32 {
    5
}

fn default_failure_ratio() -> f64 {
    0.5
}

fn default_min_samples() -> u64 {
    10
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_requests() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            failure_ratio: default_failure_ratio(),
            min_samples: default_min_samples(),
            timeout_ms: default_timeout_ms(),
            half_open_max_requests: default_half_open_max_requests(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl BreakerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct BreakerCounts {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

/// Outcome of [`CircuitBreaker::allow`]. The caller must follow an `Allowed`
/// decision with exactly one `record_success` or `record_failure`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerDecision {
    Allowed,
    CircuitOpen,
    TooManyRequests,
}

pub type StateChangeListener = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

#[derive(Debug, Default)]
struct BreakerInner {
    counts: BreakerCounts,
    last_transition_ms: u64,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    state: AtomicI32,
    half_open_permits: AtomicI32,
    inner: Mutex<BreakerInner>,
    listener: Option<StateChangeListener>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings, now_ms: u64) -> Self {
        Self::with_listener(name, settings, now_ms, None)
    }

    pub fn with_listener(
        name: impl Into<String>,
        settings: BreakerSettings,
        now_ms: u64,
        listener: Option<StateChangeListener>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            state: AtomicI32::new(BreakerState::Closed.as_i32()),
            half_open_permits: AtomicI32::new(0),
            inner: Mutex::new(BreakerInner {
                counts: BreakerCounts::default(),
                last_transition_ms: now_ms,
            }),
            listener,
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_i32(self.state.load(Ordering::Acquire))
    }

    pub fn counts(&self) -> BreakerCounts {
        self.lock_inner().counts
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn allow(&self, now_ms: u64) -> BreakerDecision {
        match self.state() {
            BreakerState::Closed => BreakerDecision::Allowed,
            BreakerState::Open => {
                let last_transition_ms = self.lock_inner().last_transition_ms;
                if now_ms.saturating_sub(last_transition_ms) >= self.settings.timeout_ms {
                    self.transition(BreakerState::HalfOpen, now_ms);
                    self.allow_half_open()
                } else {
                    BreakerDecision::CircuitOpen
                }
            }
            BreakerState::HalfOpen => self.allow_half_open(),
        }
    }

    fn allow_half_open(&self) -> BreakerDecision {
        let count = self.half_open_permits.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.settings.half_open_max_requests as i32 {
            self.half_open_permits.fetch_sub(1, Ordering::AcqRel);
            return BreakerDecision::TooManyRequests;
        }
        BreakerDecision::Allowed
    }

    pub fn record_success(&self, now_ms: u64) {
        let mut transition = None;
        {
            let mut inner = self.lock_inner();
            inner.counts.requests = inner.counts.requests.saturating_add(1);
            inner.counts.successes = inner.counts.successes.saturating_add(1);
            inner.counts.consecutive_successes =
                inner.counts.consecutive_successes.saturating_add(1);
            inner.counts.consecutive_failures = 0;

            if self.state() == BreakerState::HalfOpen {
                self.half_open_permits.fetch_sub(1, Ordering::AcqRel);
                if inner.counts.consecutive_successes >= self.settings.success_threshold {
                    transition = self.transition_locked(&mut inner, BreakerState::Closed, now_ms);
                }
            }
        }
        self.notify(transition);
    }

    pub fn record_failure(&self, now_ms: u64) {
        let mut transition = None;
        {
            let mut inner = self.lock_inner();
            inner.counts.requests = inner.counts.requests.saturating_add(1);
            inner.counts.failures = inner.counts.failures.saturating_add(1);
            inner.counts.consecutive_failures = inner.counts.consecutive_failures.saturating_add(1);
            inner.counts.consecutive_successes = 0;

            match self.state() {
                BreakerState::Closed => {
                    if self.should_open(&inner.counts) {
                        transition = self.transition_locked(&mut inner, BreakerState::Open, now_ms);
                    }
                }
                BreakerState::HalfOpen => {
                    self.half_open_permits.fetch_sub(1, Ordering::AcqRel);
                    // Any failure while probing reopens the circuit.
                    transition = self.transition_locked(&mut inner, BreakerState::Open, now_ms);
                }
                BreakerState::Open => {}
            }
        }
        self.notify(transition);
    }

    fn should_open(&self, counts: &BreakerCounts) -> bool {
        if counts.consecutive_failures >= self.settings.max_failures {
            return true;
        }
        if self.settings.failure_ratio > 0.0 && counts.requests >= self.settings.min_samples {
            let ratio = counts.failures as f64 / counts.requests.max(1) as f64;
            if ratio >= self.settings.failure_ratio {
                return true;
            }
        }
        false
    }

    fn transition(&self, to: BreakerState, now_ms: u64) {
        let transition = {
            let mut inner = self.lock_inner();
            self.transition_locked(&mut inner, to, now_ms)
        };
        self.notify(transition);
    }

    fn transition_locked(
        &self,
        inner: &mut BreakerInner,
        to: BreakerState,
        now_ms: u64,
    ) -> Option<(BreakerState, BreakerState)> {
        let from = self.state();
        if from == to {
            return None;
        }

        self.state.store(to.as_i32(), Ordering::Release);
        inner.last_transition_ms = now_ms;

        if to == BreakerState::HalfOpen {
            self.half_open_permits.store(0, Ordering::Release);
        }
        if to == BreakerState::Closed {
            inner.counts = BreakerCounts::default();
        }

        Some((from, to))
    }

    // The listener runs after the breaker lock is released.
    fn notify(&self, transition: Option<(BreakerState, BreakerState)>) {
        if let (Some(listener), Some((from, to))) = (self.listener.as_ref(), transition) {
            listener(&self.name, from, to);
        }
    }

    pub fn reset(&self, now_ms: u64) {
        let mut inner = self.lock_inner();
        self.state
            .store(BreakerState::Closed.as_i32(), Ordering::Release);
        inner.counts = BreakerCounts::default();
        inner.last_transition_ms = now_ms;
        self.half_open_permits.store(0, Ordering::Release);
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BreakerStats {
    pub state: &'static str,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

/// One breaker per channel, created lazily with shared settings.
pub struct BreakerManager {
    breakers: RwLock<HashMap<i64, Arc<CircuitBreaker>>>,
    settings: BreakerSettings,
    listener: Option<StateChangeListener>,
}

impl std::fmt::Debug for BreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerManager")
            .field("settings", &self.settings)
            .finish()
    }
}

impl BreakerManager {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            settings,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: StateChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn get(&self, channel_id: i64, now_ms: u64) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .ok()
            .and_then(|breakers| breakers.get(&channel_id).cloned())
        {
            return breaker;
        }

        let mut breakers = match self.breakers.write() {
            Ok(breakers) => breakers,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .entry(channel_id)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_listener(
                    format!("channel-{channel_id}"),
                    self.settings.clone(),
                    now_ms,
                    self.listener.clone(),
                ))
            })
            .clone()
    }

    pub fn stats(&self) -> HashMap<i64, BreakerStats> {
        let breakers = match self.breakers.read() {
            Ok(breakers) => breakers,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .iter()
            .map(|(id, breaker)| {
                let counts = breaker.counts();
                (
                    *id,
                    BreakerStats {
                        state: breaker.state().as_str(),
                        requests: counts.requests,
                        successes: counts.successes,
                        failures: counts.failures,
                        consecutive_successes: counts.consecutive_successes,
                        consecutive_failures: counts.consecutive_failures,
                    },
                )
            })
            .collect()
    }

    pub fn reset(&self, channel_id: i64, now_ms: u64) {
        if let Some(breaker) = self
            .breakers
            .read()
            .ok()
            .and_then(|breakers| breakers.get(&channel_id).cloned())
        {
            breaker.reset(now_ms);
        }
    }

    pub fn reset_all(&self, now_ms: u64) {
        let breakers = match self.breakers.read() {
            Ok(breakers) => breakers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for breaker in breakers.values() {
            breaker.reset(now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_failures: u32, timeout_ms: u64) -> BreakerSettings {
        BreakerSettings {
            max_failures,
            failure_ratio: 0.0,
            min_samples: 0,
            timeout_ms,
            half_open_max_requests: 3,
            success_threshold: 2,
        }
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", settings(3, 30_000), 0);
        for _ in 0..3 {
            assert_eq!(breaker.allow(0), BreakerDecision::Allowed);
            breaker.record_failure(0);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.allow(1), BreakerDecision::CircuitOpen);
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_success_threshold() {
        let breaker = CircuitBreaker::new("test", settings(3, 100), 0);
        for _ in 0..3 {
            breaker.record_failure(0);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        assert_eq!(breaker.allow(100), BreakerDecision::Allowed);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // One success is not enough when success_threshold = 2.
        breaker.record_success(100);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert_eq!(breaker.allow(100), BreakerDecision::Allowed);
        breaker.record_success(100);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.counts().requests, 0);
    }

    #[test]
    fn failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new("test", settings(1, 100), 0);
        breaker.record_failure(0);
        assert_eq!(breaker.state(), BreakerState::Open);

        assert_eq!(breaker.allow(150), BreakerDecision::Allowed);
        breaker.record_failure(150);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let breaker = CircuitBreaker::new("test", settings(1, 100), 0);
        breaker.record_failure(0);

        assert_eq!(breaker.allow(100), BreakerDecision::Allowed);
        assert_eq!(breaker.allow(100), BreakerDecision::Allowed);
        assert_eq!(breaker.allow(100), BreakerDecision::Allowed);
        assert_eq!(breaker.allow(100), BreakerDecision::TooManyRequests);

        // Finishing one probe frees a permit.
        breaker.record_success(100);
        assert_eq!(breaker.allow(100), BreakerDecision::Allowed);
    }

    #[test]
    fn opens_on_failure_ratio_with_min_samples() {
        let breaker = CircuitBreaker::new(
            "test",
            BreakerSettings {
                max_failures: 100,
                failure_ratio: 0.5,
                min_samples: 10,
                timeout_ms: 30_000,
                half_open_max_requests: 3,
                success_threshold: 2,
            },
            0,
        );

        for i in 0..10 {
            if i % 2 == 0 {
                breaker.record_success(0);
            } else {
                breaker.record_failure(0);
            }
        }
        // 5 failures / 10 requests hits the 0.5 ratio.
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn listener_sees_transitions_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let listener: StateChangeListener = Arc::new(move |name, from, to| {
            seen_clone
                .lock()
                .unwrap()
                .push(format!("{name}:{}->{}", from.as_str(), to.as_str()));
        });

        let breaker = CircuitBreaker::with_listener("ch-1", settings(1, 100), 0, Some(listener));
        breaker.record_failure(0);
        breaker.allow(100);
        breaker.record_success(100);
        breaker.allow(100);
        breaker.record_success(100);

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[
                "ch-1:CLOSED->OPEN",
                "ch-1:OPEN->HALF_OPEN",
                "ch-1:HALF_OPEN->CLOSED"
            ]
        );
    }

    #[test]
    fn manager_creates_one_breaker_per_channel() {
        let manager = BreakerManager::new(BreakerSettings::default());
        let a = manager.get(1, 0);
        let b = manager.get(1, 0);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.stats().len(), 1);
    }
}
