pub mod anthropic;
pub mod azure;
pub mod compatible;
pub mod gemini;
pub mod openai;
pub mod pool;

use serde_json::Value;
use thiserror::Error;

use crate::gateway::channel::{Channel, ChannelType};

pub use pool::ClientPool;

/// Everything an adaptor needs to know about the selected channel and
/// request, assembled by the distributor.
#[derive(Clone, Debug)]
pub struct RelayMeta {
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub base_url: String,
    pub key: String,
    pub api_version: Option<String>,
    pub deployment_id: Option<String>,
    pub actual_model: String,
    pub is_stream: bool,
    pub system_prompt: Option<String>,
}

impl RelayMeta {
    pub fn for_channel(channel: &Channel, actual_model: &str, is_stream: bool) -> Self {
        Self {
            channel_id: channel.id,
            channel_type: channel.channel_type,
            base_url: channel.base_url.trim_end_matches('/').to_string(),
            key: channel.key.clone(),
            api_version: channel.api_version.clone(),
            deployment_id: channel.deployment_id.clone(),
            actual_model: actual_model.to_string(),
            is_stream,
            system_prompt: channel.system_prompt.clone(),
        }
    }
}

/// Upstream failure classes; retryability drives the relay loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    InvalidRequest,
    RateLimited,
    ServerError,
    NetworkError,
    QuotaExceeded,
}

impl UpstreamErrorKind {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            UpstreamErrorKind::RateLimited
                | UpstreamErrorKind::ServerError
                | UpstreamErrorKind::NetworkError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamErrorKind::InvalidRequest => "invalid_request",
            UpstreamErrorKind::RateLimited => "rate_limited",
            UpstreamErrorKind::ServerError => "server_error",
            UpstreamErrorKind::NetworkError => "network_error",
            UpstreamErrorKind::QuotaExceeded => "quota_exceeded",
        }
    }
}

#[derive(Debug, Error)]
#[error("upstream {kind:?}: {message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub timeout: bool,
}

impl UpstreamError {
    pub fn network(message: impl Into<String>, timeout: bool) -> Self {
        Self {
            kind: UpstreamErrorKind::NetworkError,
            status: None,
            message: message.into(),
            timeout,
        }
    }
}

/// Classifies an upstream HTTP status plus (best-effort) JSON error body.
pub fn classify_status(status: u16, body: Option<&Value>) -> UpstreamErrorKind {
    if status == 429 {
        return UpstreamErrorKind::RateLimited;
    }
    if status == 402 {
        return UpstreamErrorKind::QuotaExceeded;
    }
    if status >= 500 {
        return UpstreamErrorKind::ServerError;
    }

    if let Some(kind) = body
        .and_then(|body| body.get("error"))
        .and_then(|error| error.get("type"))
        .and_then(Value::as_str)
    {
        if kind.contains("insufficient_quota") || kind.contains("billing") {
            return UpstreamErrorKind::QuotaExceeded;
        }
        if kind.contains("rate_limit") || kind.contains("overloaded") {
            return UpstreamErrorKind::RateLimited;
        }
    }

    UpstreamErrorKind::InvalidRequest
}

/// Per-provider request rewrite. The gateway passes upstream bodies
/// through; adaptors adjust only what the wire protocol demands: URL
/// shape, auth headers, model rename, forced system prompt, and (for
/// Gemini) the JSON layout.
pub trait Adaptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Full upstream URL for an inbound `/v1/...` path.
    fn request_url(&self, meta: &RelayMeta, path: &str) -> String;

    /// Auth and protocol headers. Header values carry secrets; errors mean
    /// a misconfigured channel key.
    fn headers(&self, meta: &RelayMeta) -> Vec<(&'static str, String)>;

    /// In-place body rewrite. The default renames the model and injects
    /// the channel's forced system prompt when the request has none.
    fn convert_request(&self, meta: &RelayMeta, body: &mut Value) {
        rename_model(meta, body);
        inject_system_prompt(meta, body);
    }

    /// Extracts `(prompt_tokens, completion_tokens, total_tokens)` from a
    /// non-streaming response body.
    fn parse_usage(&self, body: &Value) -> Option<(u64, u64, u64)> {
        parse_openai_usage(body)
    }
}

pub(crate) fn rename_model(meta: &RelayMeta, body: &mut Value) {
    if let Some(object) = body.as_object_mut() {
        if object.contains_key("model") {
            object.insert("model".to_string(), Value::String(meta.actual_model.clone()));
        }
    }
}

pub(crate) fn inject_system_prompt(meta: &RelayMeta, body: &mut Value) {
    let Some(prompt) = meta.system_prompt.as_deref() else {
        return;
    };
    if prompt.is_empty() {
        return;
    }
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    let has_system = messages
        .iter()
        .any(|message| message.get("role").and_then(Value::as_str) == Some("system"));
    if has_system {
        return;
    }
    messages.insert(
        0,
        serde_json::json!({"role": "system", "content": prompt}),
    );
}

pub(crate) fn parse_openai_usage(body: &Value) -> Option<(u64, u64, u64)> {
    let usage = body.get("usage")?;
    let prompt = usage
        .get("prompt_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt + completion);
    Some((prompt, completion, total))
}

/// Dispatch-time adaptor lookup.
pub fn adaptor_for(channel_type: ChannelType) -> &'static dyn Adaptor {
    match channel_type {
        ChannelType::Openai => &openai::OpenAiAdaptor,
        ChannelType::Azure => &azure::AzureAdaptor,
        ChannelType::Anthropic => &anthropic::AnthropicAdaptor,
        ChannelType::Gemini => &gemini::GeminiAdaptor,
        ChannelType::OpenaiCompatible => &compatible::CompatibleAdaptor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::channel::ChannelType;

    pub(crate) fn test_meta(channel_type: ChannelType, base_url: &str) -> RelayMeta {
        RelayMeta {
            channel_id: 1,
            channel_type,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: "sk-upstream".to_string(),
            api_version: Some("2024-02-01".to_string()),
            deployment_id: Some("gpt-4o-mini-deploy".to_string()),
            actual_model: "gpt-4o-mini".to_string(),
            is_stream: false,
            system_prompt: None,
        }
    }

    #[test]
    fn classifies_statuses() {
        assert_eq!(classify_status(429, None), UpstreamErrorKind::RateLimited);
        assert_eq!(classify_status(402, None), UpstreamErrorKind::QuotaExceeded);
        assert_eq!(classify_status(500, None), UpstreamErrorKind::ServerError);
        assert_eq!(classify_status(503, None), UpstreamErrorKind::ServerError);
        assert_eq!(classify_status(400, None), UpstreamErrorKind::InvalidRequest);

        let body = serde_json::json!({"error": {"type": "insufficient_quota"}});
        assert_eq!(
            classify_status(403, Some(&body)),
            UpstreamErrorKind::QuotaExceeded
        );
        let body = serde_json::json!({"error": {"type": "rate_limit_error"}});
        assert_eq!(
            classify_status(400, Some(&body)),
            UpstreamErrorKind::RateLimited
        );
    }

    #[test]
    fn retryability_matches_the_relay_contract() {
        assert!(UpstreamErrorKind::RateLimited.retryable());
        assert!(UpstreamErrorKind::ServerError.retryable());
        assert!(UpstreamErrorKind::NetworkError.retryable());
        assert!(!UpstreamErrorKind::InvalidRequest.retryable());
        assert!(!UpstreamErrorKind::QuotaExceeded.retryable());
    }

    #[test]
    fn model_rename_and_system_prompt_injection() {
        let mut meta = test_meta(ChannelType::Openai, "https://api.openai.com");
        meta.system_prompt = Some("be terse".to_string());
        let mut body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
        });

        rename_model(&meta, &mut body);
        inject_system_prompt(&meta, &mut body);

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be terse");

        // A request that already has a system message keeps it.
        let mut body = serde_json::json!({
            "messages": [{"role": "system", "content": "original"}],
        });
        inject_system_prompt(&meta, &mut body);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn usage_parsing_fills_total_when_missing() {
        let body = serde_json::json!({"usage": {"prompt_tokens": 3, "completion_tokens": 4}});
        assert_eq!(parse_openai_usage(&body), Some((3, 4, 7)));
        assert_eq!(parse_openai_usage(&serde_json::json!({})), None);
    }
}
