use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::Value;

use crate::providers::{adaptor_for, classify_status, RelayMeta, UpstreamErrorKind};

use super::automodel::{self, FALLBACK_MODEL};
use super::backoff::backoff_for_attempt;
use super::breaker::BreakerDecision;
use super::cache::{fingerprint, CachedResponse};
use super::channel::Channel;
use super::limits::RateLimitDecision;
use super::log_batcher::RequestLog;
use super::streaming::{
    approximate_tokens, extract_assistant_content, extract_usage_total_tokens, replay_frames,
    synthesize_completion, synthesize_sse_blob, CaptureStream, StreamEnd, StreamOutcome,
};
use super::token_count;
use super::{ChatMessage, Gateway, GatewayError, MessageContent, RequestContext};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/channels", get(health_channels))
        .route("/health/cache", get(health_cache))
        .route("/metrics", get(metrics))
        .route("/v1/chat/completions", post(relay_chat_completions))
        .route("/v1/completions", post(relay_completions))
        .route("/v1/embeddings", post(relay_embeddings))
        .route("/v1/images/generations", post(relay_images))
        .route("/v1/audio/transcriptions", post(relay_audio_transcriptions))
        .route("/v1/audio/translations", post(relay_audio_translations))
        .route("/v1/audio/speech", post(relay_audio_speech))
        .route("/v1/moderations", post(relay_moderations))
        .with_state(AppState { gateway })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Images,
    AudioTranscription,
    AudioTranslation,
    AudioSpeech,
    Moderations,
}

impl RelayMode {
    fn path(&self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "/v1/chat/completions",
            RelayMode::Completions => "/v1/completions",
            RelayMode::Embeddings => "/v1/embeddings",
            RelayMode::Images => "/v1/images/generations",
            RelayMode::AudioTranscription => "/v1/audio/transcriptions",
            RelayMode::AudioTranslation => "/v1/audio/translations",
            RelayMode::AudioSpeech => "/v1/audio/speech",
            RelayMode::Moderations => "/v1/moderations",
        }
    }

    /// Routing model for multipart bodies the JSON parser cannot see.
    fn default_model(&self) -> &'static str {
        match self {
            RelayMode::AudioTranscription | RelayMode::AudioTranslation => "whisper-1",
            RelayMode::AudioSpeech => "tts-1",
            RelayMode::Images => "dall-e-3",
            RelayMode::Moderations => "omni-moderation-latest",
            _ => FALLBACK_MODEL,
        }
    }

    fn supports_cache(&self) -> bool {
        matches!(self, RelayMode::ChatCompletions)
    }
}

async fn relay_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state.gateway, RelayMode::ChatCompletions, headers, body).await
}

async fn relay_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state.gateway, RelayMode::Completions, headers, body).await
}

async fn relay_embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state.gateway, RelayMode::Embeddings, headers, body).await
}

async fn relay_images(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    relay(state.gateway, RelayMode::Images, headers, body).await
}

async fn relay_audio_transcriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state.gateway, RelayMode::AudioTranscription, headers, body).await
}

async fn relay_audio_translations(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state.gateway, RelayMode::AudioTranslation, headers, body).await
}

async fn relay_audio_speech(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state.gateway, RelayMode::AudioSpeech, headers, body).await
}

async fn relay_moderations(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state.gateway, RelayMode::Moderations, headers, body).await
}

async fn health(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "status": "ok",
        "channels": state.gateway.registry.channel_count(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn health_channels(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "health": state.gateway.health.stats(),
        "breakers": state.gateway.breakers.stats(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn health_cache(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "stats": state.gateway.cache_stats.snapshot(),
        "exact_enabled": state.gateway.response_cache.enabled(),
        "semantic": state.gateway.semantic_cache.stats(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    let rendered = state.gateway.metrics_lock().render();
    let mut response = (StatusCode::OK, rendered).into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

struct InFlightGuard {
    gateway: Arc<Gateway>,
}

impl InFlightGuard {
    fn new(gateway: Arc<Gateway>) -> Self {
        gateway.metrics_lock().record_in_flight_inc();
        Self { gateway }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gateway.metrics_lock().record_in_flight_dec();
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return real_ip.to_string();
    }
    "local".to_string()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = header_str(headers, "authorization")?;
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(str::trim)
}

fn error_response(err: &GatewayError, extra: &[(HeaderName, HeaderValue)]) -> Response {
    let envelope = serde_json::json!({
        "error": {
            "message": err.to_string(),
            "type": err.error_type(),
            "code": err.status(),
        }
    });
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(envelope)).into_response();
    for (name, value) in extra {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    if let GatewayError::RateLimited { retry_after } = err {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(*retry_after));
    }
    response
}

fn rate_limit_headers(limit: u64, decision: &RateLimitDecision) -> Vec<(HeaderName, HeaderValue)> {
    vec![
        (
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderValue::from(limit),
        ),
        (
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from(decision.remaining),
        ),
        (
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from(decision.reset_at),
        ),
    ]
}

fn apply_headers(response: &mut Response, headers: &[(HeaderName, HeaderValue)]) {
    for (name, value) in headers {
        response.headers_mut().insert(name.clone(), value.clone());
    }
}

/// Outcome of the distributor: the channel, the concrete model, and the
/// transparency headers.
struct Distribution {
    channel: Arc<Channel>,
    model: String,
    reason: String,
    score: f64,
    available: usize,
    health_score: Option<f64>,
    auto_headers: Vec<(HeaderName, HeaderValue)>,
}

fn distribute(
    gateway: &Gateway,
    headers: &HeaderMap,
    requested_model: &str,
    group: &str,
    messages: &[ChatMessage],
) -> Result<Distribution, GatewayError> {
    // Explicit channel override wins over everything.
    if let Some(raw) = header_str(headers, "specific-channel-id") {
        let channel_id: i64 = raw.parse().map_err(|_| GatewayError::InvalidRequest {
            reason: format!("invalid channel id: {raw}"),
        })?;
        let channel = gateway
            .registry
            .get(channel_id)
            .ok_or_else(|| GatewayError::InvalidRequest {
                reason: format!("unknown channel id: {channel_id}"),
            })?;
        if !channel.enabled() {
            return Err(GatewayError::Forbidden {
                reason: format!("channel {channel_id} is disabled"),
            });
        }
        if !channel.serves_group(group) {
            return Err(GatewayError::Forbidden {
                reason: format!("channel {channel_id} does not serve group {group}"),
            });
        }
        let health_score = gateway
            .health
            .snapshot(channel.id)
            .map(|view| view.success_rate() * 100.0);
        return Ok(Distribution {
            channel,
            model: requested_model.to_string(),
            reason: "Direct channel selection".to_string(),
            score: 1.0,
            available: 1,
            health_score,
            auto_headers: Vec::new(),
        });
    }

    let mut concrete_model = requested_model.to_string();

    if gateway.config.auto_model.enabled && automodel::is_virtual_model(requested_model) {
        match gateway
            .resolver
            .resolve(&gateway.registry, requested_model, group, messages)
        {
            Ok(selection) => {
                let auto_headers = auto_headers_for(&selection);
                if let Some(channel) = gateway.registry.get(selection.channel_id) {
                    return Ok(Distribution {
                        channel,
                        model: selection.selected_model,
                        reason: selection.reason.to_string(),
                        score: selection.score,
                        available: 1,
                        health_score: None,
                        auto_headers,
                    });
                }
                // Channel vanished between resolution and lookup; fall back
                // to health-based selection of the resolved model.
                concrete_model = selection.selected_model;
            }
            Err(err) => {
                tracing::warn!(
                    model = requested_model,
                    error = %err,
                    "virtual model resolution failed, using fallback model"
                );
                concrete_model = FALLBACK_MODEL.to_string();
            }
        }
    }

    let strategy = gateway
        .config
        .selection_strategy
        .as_deref()
        .map(super::health::strategy_for);
    let info = gateway.selector.select(
        &gateway.registry,
        group,
        &concrete_model,
        strategy.as_ref(),
        false,
        &HashSet::new(),
    )?;

    let (reason, health_score) = match gateway.health.snapshot(info.channel.id) {
        Some(view) => (
            format!(
                "Health-based selection (success rate: {:.1}%, avg latency: {}ms, score: {:.0}, {} channels available)",
                view.success_rate() * 100.0,
                view.avg_latency_ms as u64,
                info.score,
                info.available_count
            ),
            Some(view.success_rate() * 100.0),
        ),
        None => (
            format!(
                "Health-based selection ({} channels available)",
                info.available_count
            ),
            None,
        ),
    };

    Ok(Distribution {
        channel: info.channel,
        model: concrete_model,
        reason,
        score: info.score,
        available: info.available_count,
        health_score,
        auto_headers: Vec::new(),
    })
}

fn auto_headers_for(selection: &automodel::AutoSelection) -> Vec<(HeaderName, HeaderValue)> {
    let mut out = Vec::new();
    let pairs = [
        ("x-auto-requested-model", selection.requested_model.clone()),
        ("x-auto-selected-model", selection.selected_model.clone()),
        ("x-auto-selection-score", format!("{:.2}", selection.score)),
        ("x-auto-selection-reason", selection.reason.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            out.push((HeaderName::from_static(name), value));
        }
    }
    out
}

fn last_user_text(messages: &[ChatMessage]) -> Option<String> {
    for message in messages.iter().rev() {
        if message.role != "user" {
            continue;
        }
        let text = match &message.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => {
                let mut out = Vec::new();
                for part in parts {
                    if let super::ContentPart::Text { text } = part {
                        out.push(text.as_str());
                    }
                }
                out.join(" ")
            }
            MessageContent::Empty => continue,
        };
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

fn estimate_prompt_tokens(
    mode: RelayMode,
    model: &str,
    payload: &Value,
    messages: &[ChatMessage],
) -> u64 {
    match mode {
        RelayMode::ChatCompletions => token_count::count_chat_tokens(model, messages),
        RelayMode::Completions => text_field_tokens(model, payload.get("prompt")),
        RelayMode::Embeddings | RelayMode::Moderations => {
            text_field_tokens(model, payload.get("input"))
        }
        RelayMode::AudioSpeech => text_field_tokens(model, payload.get("input")),
        _ => 0,
    }
}

fn text_field_tokens(model: &str, field: Option<&Value>) -> u64 {
    match field {
        Some(Value::String(text)) => token_count::count_text_tokens(model, text),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|text| token_count::count_text_tokens(model, text))
            .sum(),
        _ => 0,
    }
}

/// Billing inputs carried into the deferred settlement.
struct BillingState {
    gateway: Arc<Gateway>,
    ctx: RequestContext,
    mode_path: &'static str,
    pre_consumed: i64,
    ratio: f64,
    cache_fingerprint: Option<String>,
    semantic_query: Option<String>,
    started: Instant,
}

impl BillingState {
    /// Post-consume, metrics, cache stores, and the log row. Runs after
    /// the last byte reaches the client.
    async fn settle_success(self, total_tokens: u64, blob: Option<String>) {
        let gateway = self.gateway;
        let ctx = self.ctx;
        let now = gateway.clock.now_epoch_seconds();

        let actual_quota = (total_tokens as f64 * self.ratio).ceil() as i64;
        gateway
            .quota
            .post_consume(ctx.user_id, self.pre_consumed, actual_quota);

        {
            let mut metrics = gateway.metrics_lock();
            metrics.record_tokens_used(&ctx.actual_model, total_tokens);
            metrics.record_quota_used(ctx.user_id, actual_quota.max(0) as u64);
            metrics.observe_request_duration(self.mode_path, self.started.elapsed());
        }

        if let Some(blob) = blob {
            if gateway.response_cache.enabled() {
                if let Some(fp) = self.cache_fingerprint.as_deref() {
                    gateway
                        .response_cache
                        .store(
                            fp,
                            CachedResponse {
                                content: blob.clone(),
                                model: ctx.requested_model.clone(),
                                created_at: now,
                                tokens_used: total_tokens,
                            },
                            now,
                        )
                        .await;
                }
            }
            if gateway.semantic_cache.enabled() {
                if let Some(query) = self.semantic_query.as_deref() {
                    let content = extract_assistant_content(&blob);
                    if !content.is_empty() {
                        if let Some((key, payload)) = gateway.semantic_cache.store(
                            &ctx.requested_model,
                            query,
                            &content,
                            total_tokens,
                            now,
                        ) {
                            gateway.semantic_cache.persist(key, payload);
                        }
                    }
                }
            }
        }

        let completion_tokens = total_tokens.saturating_sub(ctx.prompt_tokens);
        gateway.logs.add(RequestLog {
            request_id: ctx.request_id,
            user_id: ctx.user_id,
            token_name: ctx.token_name,
            model_name: ctx.actual_model,
            channel_id: ctx.channel_id,
            prompt_tokens: ctx.prompt_tokens,
            completion_tokens,
            quota: actual_quota,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            is_stream: ctx.is_stream,
            cached: false,
            selection_reason: ctx.selection_reason,
            created_at: now,
        });
    }

    /// Refund the reservation after a failed or aborted delivery.
    fn settle_failure(self, end: StreamEnd) {
        let gateway = self.gateway;
        let ctx = self.ctx;
        gateway.quota.refund(ctx.user_id, self.pre_consumed);
        tracing::info!(
            request_id = %ctx.request_id,
            channel_id = ctx.channel_id,
            outcome = ?end,
            "request not billed"
        );
        gateway.logs.add(RequestLog {
            request_id: ctx.request_id,
            user_id: ctx.user_id,
            token_name: ctx.token_name,
            model_name: ctx.actual_model,
            channel_id: ctx.channel_id,
            prompt_tokens: ctx.prompt_tokens,
            completion_tokens: 0,
            quota: 0,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            is_stream: ctx.is_stream,
            cached: false,
            selection_reason: ctx.selection_reason,
            created_at: gateway.clock.now_epoch_seconds(),
        });
    }
}

async fn finalize_stream(billing: BillingState, outcome: StreamOutcome) {
    billing.gateway.metrics_lock().record_connection_close();
    match outcome.end {
        StreamEnd::Completed => {
            let prompt_tokens = billing.ctx.prompt_tokens;
            let total_tokens = outcome
                .captured
                .as_deref()
                .and_then(extract_usage_total_tokens)
                .or_else(|| {
                    outcome
                        .captured
                        .as_deref()
                        .map(|blob| prompt_tokens.saturating_add(approximate_tokens(blob)))
                })
                .unwrap_or(prompt_tokens);
            billing.settle_success(total_tokens, outcome.captured).await;
        }
        end @ (StreamEnd::Error | StreamEnd::Aborted) => {
            billing.settle_failure(end);
        }
    }
}

struct DispatchSuccess {
    channel: Arc<Channel>,
    response: reqwest::Response,
    actual_model: String,
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_with_retries(
    gateway: &Arc<Gateway>,
    mode: RelayMode,
    dist: &Distribution,
    group: &str,
    payload: &Value,
    raw_body: &Bytes,
    is_multipart: bool,
    is_stream: bool,
) -> Result<DispatchSuccess, GatewayError> {
    let retry = &gateway.config.retry;
    let mut tried: HashSet<i64> = HashSet::new();
    let mut channel = dist.channel.clone();
    let mut attempt: u32 = 0;
    let mut last_err = GatewayError::NoAvailableChannel {
        group: group.to_string(),
        model: dist.model.clone(),
    };

    loop {
        let now_ms = gateway.clock.now_epoch_millis();
        let breaker = gateway.breakers.get(channel.id, now_ms);
        let mut dispatched = false;

        match breaker.allow(now_ms) {
            BreakerDecision::Allowed => {
                dispatched = true;
                let actual_model = channel.mapped_model(&dist.model).to_string();
                let meta = RelayMeta::for_channel(&channel, &actual_model, is_stream);
                let adaptor = adaptor_for(channel.channel_type);

                let send_body = if is_multipart {
                    raw_body.clone()
                } else {
                    let mut value = payload.clone();
                    adaptor.convert_request(&meta, &mut value);
                    match serde_json::to_vec(&value) {
                        Ok(encoded) => Bytes::from(encoded),
                        Err(err) => {
                            // Not a channel fault; settle the allow() permit.
                            breaker.record_success(now_ms);
                            return Err(GatewayError::Internal {
                                message: format!("request encoding failed: {err}"),
                            });
                        }
                    }
                };

                gateway.metrics_lock().record_channel_request(channel.id);

                let dispatch_started = Instant::now();
                let result = gateway
                    .dispatcher
                    .dispatch(&meta, mode.path(), send_body)
                    .await;
                let latency = dispatch_started.elapsed();
                let latency_ms = latency.as_millis() as u64;
                let observed_ms = gateway.clock.now_epoch_millis();

                match result {
                    Ok(response) if response.status().is_success() => {
                        gateway.health.observe(channel.id, latency_ms, true, observed_ms);
                        breaker.record_success(observed_ms);
                        gateway
                            .metrics_lock()
                            .observe_channel_latency(channel.id, latency);
                        return Ok(DispatchSuccess {
                            channel,
                            response,
                            actual_model,
                        });
                    }
                    Ok(response) => {
                        let status = response.status().as_u16();
                        let error_body = response.bytes().await.unwrap_or_default();
                        let parsed = serde_json::from_slice::<Value>(&error_body).ok();
                        let kind = classify_status(status, parsed.as_ref());

                        gateway
                            .health
                            .observe(channel.id, latency_ms, false, observed_ms);
                        breaker.record_failure(observed_ms);
                        {
                            let mut metrics = gateway.metrics_lock();
                            metrics.record_channel_error(channel.id);
                            metrics.observe_channel_latency(channel.id, latency);
                        }

                        let message = upstream_message(parsed.as_ref(), status);
                        last_err = GatewayError::UpstreamError { status, message };

                        if !kind.retryable() {
                            if kind == UpstreamErrorKind::InvalidRequest {
                                return Err(GatewayError::InvalidRequest {
                                    reason: format!("upstream rejected request ({status})"),
                                });
                            }
                            return Err(last_err);
                        }
                    }
                    Err(err) => {
                        gateway
                            .health
                            .observe(channel.id, latency_ms, false, observed_ms);
                        breaker.record_failure(observed_ms);
                        gateway.metrics_lock().record_channel_error(channel.id);

                        last_err = if err.timeout {
                            GatewayError::UpstreamTimeout {
                                message: err.message,
                            }
                        } else {
                            GatewayError::UpstreamError {
                                status: 502,
                                message: err.message,
                            }
                        };
                    }
                }
            }
            BreakerDecision::CircuitOpen | BreakerDecision::TooManyRequests => {
                last_err = GatewayError::CircuitOpen {
                    channel_id: channel.id,
                };
            }
        }

        tried.insert(channel.id);
        if attempt >= retry.retry_times {
            return Err(last_err);
        }

        // Re-enter selection, preferring lower-priority tiers and skipping
        // everything already tried.
        let next = gateway
            .selector
            .select(&gateway.registry, group, &dist.model, None, true, &tried)
            .or_else(|_| {
                gateway
                    .selector
                    .select(&gateway.registry, group, &dist.model, None, false, &tried)
            });
        let Ok(info) = next else {
            return Err(last_err);
        };

        if dispatched {
            tokio::time::sleep(backoff_for_attempt(attempt, &retry.backoff)).await;
        }
        channel = info.channel;
        attempt += 1;
    }
}

fn upstream_message(parsed: Option<&Value>, status: u16) -> String {
    parsed
        .and_then(|value| value.get("error"))
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(|message| truncate_message(message, 200))
        .unwrap_or_else(|| format!("upstream returned status {status}"))
}

fn truncate_message(message: &str, max_len: usize) -> String {
    if message.len() <= max_len {
        return message.to_string();
    }
    let mut end = max_len;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

fn cached_hit_response(
    gateway: &Arc<Gateway>,
    ctx: &RequestContext,
    cached: CachedResponse,
    is_stream: bool,
    extra_headers: &[(HeaderName, HeaderValue)],
) -> Response {
    let now = gateway.clock.now_epoch_seconds();
    gateway.logs.add(RequestLog {
        request_id: ctx.request_id.clone(),
        user_id: ctx.user_id,
        token_name: ctx.token_name.clone(),
        model_name: ctx.actual_model.clone(),
        channel_id: ctx.channel_id,
        prompt_tokens: ctx.prompt_tokens,
        completion_tokens: cached.tokens_used,
        quota: 0,
        elapsed_ms: 0,
        is_stream,
        cached: true,
        selection_reason: ctx.selection_reason.clone(),
        created_at: now,
    });

    let mut response = if is_stream {
        let frames = replay_frames(&cached.content);
        let stream = futures_util::stream::iter(
            frames.into_iter().map(Ok::<Bytes, std::io::Error>),
        );
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header("cache-control", "no-cache")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        response.headers_mut().insert(
            HeaderName::from_static("x-cache-hit"),
            HeaderValue::from_static("true"),
        );
        response
    } else {
        let content = extract_assistant_content(&cached.content);
        let body = synthesize_completion(&cached.model, &content, cached.created_at);
        let mut response = (StatusCode::OK, Json(body)).into_response();
        response.headers_mut().insert(
            HeaderName::from_static("x-cache-hit"),
            HeaderValue::from_static("true"),
        );
        response
    };

    apply_headers(&mut response, extra_headers);
    response
}

async fn relay(
    gateway: Arc<Gateway>,
    mode: RelayMode,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let now = gateway.clock.now_epoch_seconds();
    gateway.metrics_lock().record_request(mode.path());
    let _in_flight = InFlightGuard::new(gateway.clone());

    // Authentication.
    let token = match bearer_token(&headers).and_then(|key| gateway.token(key)) {
        Some(token) if token.enabled => token.clone(),
        _ => return error_response(&GatewayError::Unauthorized, &[]),
    };

    // Ingress rate limit, keyed by client IP.
    let mut extra_headers: Vec<(HeaderName, HeaderValue)> = Vec::new();
    let rate_config = &gateway.config.rate_limit;
    if rate_config.global_api_limit > 0 {
        let key = format!("GA{}", client_ip(&headers));
        let decision = gateway
            .limiter
            .check(
                &key,
                rate_config.global_api_limit,
                rate_config.global_api_window_seconds,
                now,
            )
            .await;
        extra_headers = rate_limit_headers(rate_config.global_api_limit, &decision);
        if !decision.allowed {
            let retry_after = decision.reset_at.saturating_sub(now).max(1);
            let err = GatewayError::RateLimited { retry_after };
            return error_response(&err, &extra_headers);
        }
    }

    // Body parse. Multipart payloads pass through opaque.
    let is_multipart = header_str(&headers, "content-type")
        .map(|value| value.starts_with("multipart/"))
        .unwrap_or(false);

    let payload: Value = if is_multipart {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => {
                let gateway_err = GatewayError::InvalidRequest {
                    reason: format!("body is not valid JSON: {err}"),
                };
                return error_response(&gateway_err, &extra_headers);
            }
        }
    };

    let requested_model = payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(mode.default_model())
        .to_string();
    let is_stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let messages: Vec<ChatMessage> = if mode == RelayMode::ChatCompletions {
        match payload.get("messages") {
            Some(raw) => match serde_json::from_value(raw.clone()) {
                Ok(messages) => messages,
                Err(err) => {
                    let gateway_err = GatewayError::InvalidRequest {
                        reason: format!("invalid messages: {err}"),
                    };
                    return error_response(&gateway_err, &extra_headers);
                }
            },
            None => Vec::new(),
        }
    } else {
        Vec::new()
    };

    // Distribution: channel override, virtual resolution, or health-based
    // selection.
    let dist = match distribute(&gateway, &headers, &requested_model, &token.group, &messages) {
        Ok(dist) => dist,
        Err(err) => return error_response(&err, &extra_headers),
    };
    extra_headers.extend(dist.auto_headers.iter().cloned());

    let prompt_tokens = estimate_prompt_tokens(mode, &dist.model, &payload, &messages);

    let mut ctx = RequestContext {
        request_id: gateway.next_request_id(),
        user_id: token.user_id,
        group: token.group.clone(),
        token_id: token.id,
        token_name: token.name.clone(),
        requested_model: requested_model.clone(),
        actual_model: dist.model.clone(),
        channel_id: dist.channel.id,
        selection_reason: dist.reason.clone(),
        selection_score: dist.score,
        available_channels: dist.available,
        channel_health_score: dist.health_score,
        prompt_tokens,
        is_stream,
        started_at_ms: gateway.clock.now_epoch_millis(),
    };

    tracing::debug!(
        request_id = %ctx.request_id,
        group = %ctx.group,
        model = %requested_model,
        channel_id = ctx.channel_id,
        reason = %ctx.selection_reason,
        "request distributed"
    );

    // Cache check, after distribution and before quota.
    let mut cache_fp = None;
    let mut semantic_query = None;
    if mode.supports_cache() && !is_multipart {
        if gateway.response_cache.enabled() {
            let fp = fingerprint(&requested_model, &messages);
            if let Some(cached) = gateway.response_cache.lookup(&fp, now).await {
                gateway.cache_stats.record_hit();
                gateway.cache_stats.add_tokens_saved(cached.tokens_used);
                return cached_hit_response(&gateway, &ctx, cached, is_stream, &extra_headers);
            }
            gateway.cache_stats.record_miss();
            cache_fp = Some(fp);
        }
        if gateway.semantic_cache.enabled() {
            semantic_query = last_user_text(&messages);
            if let Some(query) = semantic_query.as_deref() {
                if let Some(hit) = gateway.semantic_cache.lookup(&requested_model, query) {
                    gateway.cache_stats.record_hit();
                    gateway.cache_stats.add_tokens_saved(hit.tokens);
                    tracing::debug!(
                        similarity = hit.similarity,
                        "semantic cache hit"
                    );
                    let cached = CachedResponse {
                        content: synthesize_sse_blob(&requested_model, &hit.response, hit.tokens),
                        model: requested_model.clone(),
                        created_at: now,
                        tokens_used: hit.tokens,
                    };
                    return cached_hit_response(&gateway, &ctx, cached, is_stream, &extra_headers);
                }
            }
        }
    }

    // Quota pre-consume: an upper bound, reconciled after the response.
    let max_tokens = payload
        .get("max_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(1000);
    let ratio = automodel::cost_ratio(&dist.model) * gateway.config.group_ratio(&token.group);
    let upper_bound = ((prompt_tokens.saturating_add(max_tokens)) as f64 * ratio).ceil() as i64;
    let pre_consumed = match gateway.quota.pre_consume(token.user_id, upper_bound) {
        Ok(reserved) => reserved,
        Err(err) => return error_response(&err, &extra_headers),
    };

    // Dispatch, retrying across channels on retryable failures.
    let success = match dispatch_with_retries(
        &gateway,
        mode,
        &dist,
        &token.group,
        &payload,
        &body,
        is_multipart,
        is_stream,
    )
    .await
    {
        Ok(success) => success,
        Err(err) => {
            gateway.quota.refund(token.user_id, pre_consumed);
            return error_response(&err, &extra_headers);
        }
    };

    ctx.channel_id = success.channel.id;
    ctx.actual_model = success.actual_model.clone();

    let billing = BillingState {
        gateway: gateway.clone(),
        ctx: ctx.clone(),
        mode_path: mode.path(),
        pre_consumed,
        ratio,
        cache_fingerprint: cache_fp,
        semantic_query,
        started,
    };

    if is_stream {
        gateway.metrics_lock().record_connection_open();
        let upstream_status = success.response.status();
        let upstream = success.response.bytes_stream().boxed();
        let capture = CaptureStream::new(upstream, move |outcome| {
            tokio::spawn(finalize_stream(billing, outcome));
        });

        let mut response = Response::builder()
            .status(StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::OK))
            .header(CONTENT_TYPE, "text/event-stream")
            .header("cache-control", "no-cache")
            .body(Body::from_stream(capture))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        apply_headers(&mut response, &extra_headers);
        return response;
    }

    // Non-streaming: read the full body, bill inline, cache async.
    let upstream_status = success.response.status().as_u16();
    let content_type = success
        .response
        .headers()
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    let response_bytes = match success.response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            gateway.quota.refund(token.user_id, pre_consumed);
            let gateway_err = GatewayError::UpstreamError {
                status: 502,
                message: format!("failed reading upstream body: {err}"),
            };
            return error_response(&gateway_err, &extra_headers);
        }
    };

    let parsed = serde_json::from_slice::<Value>(&response_bytes).ok();
    let adaptor = adaptor_for(success.channel.channel_type);
    let usage = parsed.as_ref().and_then(|value| adaptor.parse_usage(value));
    let content = parsed
        .as_ref()
        .and_then(|value| value.get("choices"))
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let total_tokens = usage.map(|(_, _, total)| total).unwrap_or_else(|| {
        prompt_tokens.saturating_add(
            content
                .as_deref()
                .map(|content| approximate_tokens(content))
                .unwrap_or(0),
        )
    });

    let blob = if mode.supports_cache() {
        content
            .as_deref()
            .map(|content| synthesize_sse_blob(&requested_model, content, total_tokens))
    } else {
        None
    };
    tokio::spawn(billing.settle_success(total_tokens, blob));

    let mut response = Response::builder()
        .status(StatusCode::from_u16(upstream_status).unwrap_or(StatusCode::OK))
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(response_bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    apply_headers(&mut response, &extra_headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_tokens_are_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer sk-abc123"),
        );
        assert_eq!(bearer_token(&headers), Some("sk-abc123"));

        headers.insert("authorization", HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.1.2.3, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("10.9.9.9"));
        assert_eq!(client_ip(&headers), "10.1.2.3");

        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers), "10.9.9.9");

        headers.remove("x-real-ip");
        assert_eq!(client_ip(&headers), "local");
    }

    #[test]
    fn rate_limit_headers_reflect_the_decision() {
        let decision = RateLimitDecision {
            allowed: true,
            remaining: 2,
            reset_at: 1700000060,
        };
        let headers = rate_limit_headers(3, &decision);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].1, HeaderValue::from(3u64));
        assert_eq!(headers[1].1, HeaderValue::from(2u64));
        assert_eq!(headers[2].1, HeaderValue::from(1700000060u64));
    }

    #[test]
    fn error_responses_carry_the_openai_envelope() {
        let response = error_response(&GatewayError::Unauthorized, &[]);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = error_response(&GatewayError::RateLimited { retry_after: 59 }, &[]);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER),
            Some(&HeaderValue::from(59u64))
        );
    }

    #[test]
    fn relay_modes_expose_their_paths() {
        assert_eq!(RelayMode::ChatCompletions.path(), "/v1/chat/completions");
        assert!(RelayMode::ChatCompletions.supports_cache());
        assert!(!RelayMode::Embeddings.supports_cache());
        assert_eq!(RelayMode::AudioTranscription.default_model(), "whisper-1");
    }

    #[test]
    fn last_user_text_walks_backwards() {
        let messages = vec![
            ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Text("first".to_string()),
                name: None,
            },
            ChatMessage {
                role: "assistant".to_string(),
                content: MessageContent::Text("answer".to_string()),
                name: None,
            },
            ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Text("second".to_string()),
                name: None,
            },
        ];
        assert_eq!(last_user_text(&messages).as_deref(), Some("second"));
        assert!(last_user_text(&[]).is_none());
    }
}
