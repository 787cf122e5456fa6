//! The request-dispatch dataplane: channel selection, virtual models,
//! health tracking, rate limiting, response caching, and async billing.

pub mod automodel;
pub mod backoff;
pub mod breaker;
pub mod cache;
pub mod channel;
pub mod config;
pub mod health;
pub mod http;
pub mod limits;
pub mod log_batcher;
pub mod metrics;
pub mod quota;
pub mod redis_store;
pub mod selector;
pub mod semantic_cache;
pub mod sqlite_store;
pub mod streaming;
pub mod token_count;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::{adaptor_for, ClientPool, RelayMeta, UpstreamError};
use crate::utils::task::TaskGuard;

use automodel::AutoModelResolver;
use breaker::BreakerManager;
use cache::{CacheStats, ResponseCache};
use channel::{ChannelRegistry, ChannelStore, StaticChannelStore};
use config::{GatewayConfig, TokenConfig};
use health::HealthTracker;
use limits::{RateLimiter, ShardedRateLimiter};
use log_batcher::{LogBatcher, LogStore, RequestLog};
use metrics::{GatewayMetrics, MetricsConfig};
use quota::QuotaTracker;
use redis_store::RedisStore;
use selector::ChannelSelector;
use semantic_cache::SemanticCache;

/// Wall clock seam; manual implementations drive the time-dependent units
/// in tests.
pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;

    fn now_epoch_seconds(&self) -> u64 {
        self.now_epoch_millis() / 1000
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        crate::utils::now_epoch_millis()
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("invalid or missing token")]
    Unauthorized,
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },
    #[error("no available channel for group {group} and model {model}")]
    NoAvailableChannel { group: String, model: String },
    #[error("rate limit exceeded")]
    RateLimited { retry_after: u64 },
    #[error("upstream timeout: {message}")]
    UpstreamTimeout { message: String },
    #[error("upstream error ({status}): {message}")]
    UpstreamError { status: u16, message: String },
    #[error("quota exhausted for user {user_id}")]
    QuotaExhausted { user_id: i64 },
    #[error("channel {channel_id} circuit is open")]
    CircuitOpen { channel_id: i64 },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest { .. } => 400,
            GatewayError::Unauthorized => 401,
            GatewayError::QuotaExhausted { .. } => 402,
            GatewayError::Forbidden { .. } => 403,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Internal { .. } => 500,
            GatewayError::UpstreamError { .. } => 502,
            GatewayError::NoAvailableChannel { .. } | GatewayError::CircuitOpen { .. } => 503,
            GatewayError::UpstreamTimeout { .. } => 504,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. } => "invalid_request_error",
            GatewayError::Unauthorized => "authentication_error",
            GatewayError::QuotaExhausted { .. } => "insufficient_quota",
            GatewayError::Forbidden { .. } => "permission_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::Internal { .. } => "internal_error",
            GatewayError::UpstreamError { .. } => "upstream_error",
            GatewayError::NoAvailableChannel { .. } => "no_available_channel",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
        }
    }
}

/// OpenAI-style message content: a plain string, multimodal parts, or
/// absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Empty,
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Empty
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    Other(serde_json::Value),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Per-in-flight-request context: created by the distributor, mutated by
/// dispatch and billing, read by the logger.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: i64,
    pub group: String,
    pub token_id: i64,
    pub token_name: String,
    pub requested_model: String,
    pub actual_model: String,
    pub channel_id: i64,
    pub selection_reason: String,
    pub selection_score: f64,
    pub available_channels: usize,
    pub channel_health_score: Option<f64>,
    pub prompt_tokens: u64,
    pub is_stream: bool,
    pub started_at_ms: u64,
}

/// The dispatch seam: the production implementation sends through the
/// pooled per-provider HTTP clients; tests substitute scripted upstreams.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        meta: &RelayMeta,
        path: &str,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError>;
}

#[derive(Debug)]
pub struct HttpDispatcher {
    pool: ClientPool,
}

impl HttpDispatcher {
    pub fn new(pool: ClientPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        meta: &RelayMeta,
        path: &str,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        let adaptor = adaptor_for(meta.channel_type);
        let url = adaptor.request_url(meta, path);
        let client = self.pool.client(meta.channel_type);

        let mut request = client.post(&url);
        for (name, value) in adaptor.headers(meta) {
            request = request.header(name, value);
        }

        request
            .body(body)
            .send()
            .await
            .map_err(|err| UpstreamError::network(err.to_string(), err.is_timeout()))
    }
}

/// Sink that discards rows; deployments without a relational store still
/// run the full billing path.
#[derive(Debug, Default)]
pub struct NullLogStore;

#[async_trait]
impl LogStore for NullLogStore {
    async fn insert_batch(&self, rows: &[RequestLog]) -> Result<(), GatewayError> {
        tracing::debug!(rows = rows.len(), "log store disabled, dropping batch");
        Ok(())
    }
}

/// Composition root owning every dataplane subsystem. No hidden globals:
/// the HTTP layer reaches everything through this handle.
pub struct Gateway {
    pub config: GatewayConfig,
    pub registry: ChannelRegistry,
    pub health: Arc<HealthTracker>,
    pub breakers: BreakerManager,
    pub selector: ChannelSelector,
    pub resolver: AutoModelResolver,
    pub limiter: RateLimiter,
    pub redis: Option<Arc<RedisStore>>,
    pub response_cache: ResponseCache,
    pub semantic_cache: SemanticCache,
    pub cache_stats: CacheStats,
    pub quota: QuotaTracker,
    pub logs: LogBatcher,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub clock: Arc<dyn Clock>,
    metrics: Mutex<GatewayMetrics>,
    request_seq: AtomicU64,
    background_tasks: Mutex<Vec<TaskGuard>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("channels", &self.registry.channel_count())
            .finish()
    }
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            redis: None,
            log_store: None,
            dispatcher: None,
            clock: None,
            channel_store: None,
        }
    }

    pub fn metrics_lock(&self) -> std::sync::MutexGuard<'_, GatewayMetrics> {
        match self.metrics.lock() {
            Ok(metrics) => metrics,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn next_request_id(&self) -> String {
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed);
        format!("req-{seq:08x}")
    }

    pub fn token(&self, key: &str) -> Option<&TokenConfig> {
        self.config.token(key)
    }

    /// Graceful shutdown: stop the batcher (draining once more) and abort
    /// background tickers.
    pub async fn shutdown(&self) {
        self.logs.stop().await;
        let mut tasks = match self.background_tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.clear();
    }
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    redis: Option<Arc<RedisStore>>,
    log_store: Option<Arc<dyn LogStore>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    clock: Option<Arc<dyn Clock>>,
    channel_store: Option<Arc<dyn ChannelStore>>,
}

impl GatewayBuilder {
    pub fn with_redis(mut self, store: Arc<RedisStore>) -> Self {
        self.redis = Some(store);
        self
    }

    pub fn with_log_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.log_store = Some(store);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_channel_store(mut self, store: Arc<dyn ChannelStore>) -> Self {
        self.channel_store = Some(store);
        self
    }

    /// Wires the subsystems together and spawns the background tickers.
    /// Must run inside a tokio runtime.
    pub fn build(self) -> Arc<Gateway> {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let health = Arc::new(HealthTracker::new());
        let registry = ChannelRegistry::new();
        registry.rebuild(config.channels.clone());

        let quota = QuotaTracker::new();
        for user in &config.users {
            if let Some(amount) = user.quota {
                quota.set_balance(user.id, amount);
            }
        }

        let mut background_tasks = Vec::new();
        let limiter = match self.redis.clone() {
            Some(store) => RateLimiter::Remote(store),
            None => {
                let sharded = Arc::new(ShardedRateLimiter::new(Duration::from_secs(
                    config.rate_limit.key_expiration_seconds.max(1),
                )));
                background_tasks.extend(sharded.start_sweepers());
                RateLimiter::Local(sharded)
            }
        };

        let response_cache = ResponseCache::new(config.response_cache.clone(), self.redis.clone());
        let semantic_cache = SemanticCache::new(config.semantic_cache.clone(), self.redis.clone());

        let dispatcher = self.dispatcher.unwrap_or_else(|| {
            Arc::new(HttpDispatcher::new(ClientPool::new(
                config.egress_proxy.clone(),
            )))
        });

        let log_store = self
            .log_store
            .unwrap_or_else(|| Arc::new(NullLogStore) as Arc<dyn LogStore>);
        let logs = LogBatcher::start(log_store);

        let breakers = BreakerManager::new(config.breaker.clone()).with_listener(Arc::new(
            |name, from, to| {
                tracing::info!(
                    breaker = name,
                    from = from.as_str(),
                    to = to.as_str(),
                    "circuit breaker state change"
                );
            },
        ));

        let gateway = Arc::new(Gateway {
            selector: ChannelSelector::new(health.clone()),
            resolver: AutoModelResolver::new(health.clone()),
            breakers,
            registry,
            health,
            limiter,
            redis: self.redis,
            response_cache,
            semantic_cache,
            cache_stats: CacheStats::default(),
            quota,
            logs,
            dispatcher,
            clock,
            metrics: Mutex::new(GatewayMetrics::new(MetricsConfig::default())),
            request_seq: AtomicU64::new(1),
            background_tasks: Mutex::new(background_tasks),
            config,
        });

        let channel_store = self.channel_store.unwrap_or_else(|| {
            Arc::new(StaticChannelStore::new(gateway.config.channels.clone()))
                as Arc<dyn ChannelStore>
        });
        spawn_channel_sync(&gateway, channel_store);

        gateway
    }
}

/// Periodically refreshes the channel snapshot from the store.
fn spawn_channel_sync(gateway: &Arc<Gateway>, store: Arc<dyn ChannelStore>) {
    let interval_seconds = gateway.config.channel_sync_interval_seconds;
    if interval_seconds == 0 {
        return;
    }

    let weak = Arc::downgrade(gateway);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(gateway) = weak.upgrade() else {
                return;
            };
            match store.load_channels().await {
                Ok(channels) => {
                    let mut metrics = gateway.metrics_lock();
                    for channel in &channels {
                        metrics.record_channel_status(channel.id, channel.enabled());
                    }
                    drop(metrics);
                    gateway.registry.rebuild(channels);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "channel sync failed, keeping snapshot");
                }
            }
        }
    });

    let mut tasks = match gateway.background_tasks.lock() {
        Ok(tasks) => tasks,
        Err(poisoned) => poisoned.into_inner(),
    };
    tasks.push(TaskGuard::new(handle.abort_handle()));
}
