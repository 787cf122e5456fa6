use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Multiplicative jitter: 0.3 means +/-30%.
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.3
}

fn default_max_retries() -> u32 {
    3
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_ms(),
            max_interval_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter(),
            max_retries: default_max_retries(),
        }
    }
}

/// Backoff for the given 0-indexed attempt:
/// `initial * multiplier^attempt`, capped, with multiplicative jitter.
pub fn backoff_for_attempt(attempt: u32, config: &BackoffConfig) -> Duration {
    let base = config.initial_interval_ms as f64 * config.multiplier.powi(attempt as i32);
    let mut interval = base.min(config.max_interval_ms as f64);

    if config.jitter_factor > 0.0 {
        let jitter =
            interval * config.jitter_factor * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
        interval += jitter;
    }

    if interval < 0.0 {
        interval = config.initial_interval_ms as f64;
    }
    Duration::from_millis(interval as u64)
}
