use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

use super::backoff::BackoffConfig;
use super::breaker::BreakerSettings;
use super::cache::ResponseCacheConfig;
use super::channel::Channel;
use super::semantic_cache::SemanticCacheConfig;

/// A caller-facing API token. Tokens belong to a group (the access-control
/// partition channels are matched against) and bill to a user.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub group: String,
    pub user_id: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("key", &"<redacted>")
            .field("group", &self.group)
            .field("user_id", &self.user_id)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: i64,
    pub name: String,
    /// Prepaid quota in abstract units; absent means unlimited.
    #[serde(default)]
    pub quota: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per window per client IP; 0 disables the ingress limiter.
    #[serde(default)]
    pub global_api_limit: u64,
    #[serde(default = "default_window_seconds")]
    pub global_api_window_seconds: u64,
    #[serde(default = "default_key_expiration_seconds")]
    pub key_expiration_seconds: u64,
}

fn default_window_seconds() -> u64 {
    60
}

fn default_key_expiration_seconds() -> u64 {
    120
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_api_limit: 0,
            global_api_window_seconds: default_window_seconds(),
            key_expiration_seconds: default_key_expiration_seconds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_retry_times() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_times: default_retry_times(),
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AutoModelConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub auto_model: AutoModelConfig,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub response_cache: ResponseCacheConfig,
    #[serde(default)]
    pub semantic_cache: SemanticCacheConfig,
    /// Named selection preset (balanced, performance, cost, resilient)
    /// applied to health-based selection; unset means raw health scoring.
    #[serde(default)]
    pub selection_strategy: Option<String>,
    /// Billing multiplier per group; unlisted groups bill at 1.0.
    #[serde(default)]
    pub group_ratios: BTreeMap<String, f64>,
    #[serde(default = "default_sync_interval_seconds")]
    pub channel_sync_interval_seconds: u64,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default)]
    pub egress_proxy: Option<String>,
    /// Consumed by the admin plane; accepted here so one config file
    /// serves both planes.
    #[serde(default)]
    pub session_secret: Option<String>,
}

fn default_sync_interval_seconds() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id) {
                return Err(DispatchError::Config(format!(
                    "duplicate channel id {}",
                    channel.id
                )));
            }
            if channel.base_url.trim().is_empty() {
                return Err(DispatchError::Config(format!(
                    "channel {} has an empty base_url",
                    channel.id
                )));
            }
        }
        let mut keys = std::collections::HashSet::new();
        for token in &self.tokens {
            if !keys.insert(token.key.as_str()) {
                return Err(DispatchError::Config(format!(
                    "duplicate token key for token {}",
                    token.id
                )));
            }
        }
        Ok(())
    }

    /// Overlays the feature-flag environment variables onto the file
    /// configuration.
    pub fn apply_env(&mut self) {
        if let Some(enabled) = bool_env("AUTO_MODEL_ENABLED") {
            self.auto_model.enabled = enabled;
        }
        if let Some(enabled) = bool_env("RESPONSE_CACHE_ENABLED") {
            self.response_cache.enabled = enabled;
        }
        if let Some(enabled) = bool_env("SEMANTIC_CACHE_ENABLED") {
            self.semantic_cache.enabled = enabled;
        }
        if let Some(enabled) = bool_env("MEMORY_CACHE_ENABLED") {
            self.response_cache.memory_fallback = enabled;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.trim().is_empty() {
                self.redis_url = Some(url);
            }
        }
        if let Ok(dsn) = std::env::var("LOG_DSN") {
            if !dsn.trim().is_empty() {
                self.sqlite_path = Some(dsn);
            }
        }
        if let Ok(secret) = std::env::var("SESSION_SECRET") {
            if !secret.trim().is_empty() {
                self.session_secret = Some(secret);
            }
        }
    }

    pub fn token(&self, key: &str) -> Option<&TokenConfig> {
        self.tokens.iter().find(|token| token.key == key)
    }

    pub fn user(&self, user_id: i64) -> Option<&UserConfig> {
        self.users.iter().find(|user| user.id == user_id)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratios.get(group).copied().unwrap_or(1.0)
    }
}

fn bool_env(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::channel::test_channel;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").expect("parse");
        assert!(config.channels.is_empty());
        assert_eq!(config.retry.retry_times, 3);
        assert_eq!(config.rate_limit.global_api_window_seconds, 60);
        assert_eq!(config.channel_sync_interval_seconds, 60);
    }

    #[test]
    fn partial_retry_object_keeps_field_defaults() {
        let config: GatewayConfig = serde_json::from_str(r#"{"retry": {}}"#).expect("parse");
        assert_eq!(config.retry.retry_times, 3);
        assert_eq!(config.retry.backoff.max_retries, 3);
    }

    #[test]
    fn duplicate_channel_ids_are_rejected() {
        let config = GatewayConfig {
            channels: vec![
                test_channel(1, "gpt-4o", "default"),
                test_channel(1, "gpt-4o-mini", "default"),
            ],
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn token_lookup_matches_the_key() {
        let config = GatewayConfig {
            tokens: vec![TokenConfig {
                id: 1,
                name: "ci".to_string(),
                key: "sk-token".to_string(),
                group: "default".to_string(),
                user_id: 7,
                enabled: true,
            }],
            ..GatewayConfig::default()
        };
        assert!(config.token("sk-token").is_some());
        assert!(config.token("sk-other").is_none());
        assert!((config.group_ratio("default") - 1.0).abs() < f64::EPSILON);
    }
}
