// Not every integration test file exercises every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, Response as HttpResponse};
use bytes::Bytes;
use serde_json::Value;

use dispatch_llm::gateway::channel::{Channel, ChannelStatus, ChannelType};
use dispatch_llm::gateway::config::{GatewayConfig, TokenConfig, UserConfig};
use dispatch_llm::providers::{RelayMeta, UpstreamError};
use dispatch_llm::{Clock, Dispatcher};

/// Millisecond clock the tests can advance by hand.
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Scripted per-channel upstream behavior.
#[derive(Clone)]
pub enum Behavior {
    Json(Value),
    Error(u16, Value),
    Sse(String),
}

pub struct ScriptedDispatcher {
    behaviors: Mutex<HashMap<i64, Behavior>>,
    calls: Mutex<Vec<i64>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, channel_id: i64, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(channel_id, behavior);
    }

    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        meta: &RelayMeta,
        _path: &str,
        _body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        self.calls.lock().unwrap().push(meta.channel_id);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&meta.channel_id)
            .cloned()
            .unwrap_or_else(|| panic!("no behavior scripted for channel {}", meta.channel_id));

        let response = match behavior {
            Behavior::Json(value) => HttpResponse::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(value.to_string())
                .expect("response"),
            Behavior::Error(status, value) => HttpResponse::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(value.to_string())
                .expect("response"),
            Behavior::Sse(blob) => HttpResponse::builder()
                .status(200)
                .header("content-type", "text/event-stream")
                .body(blob)
                .expect("response"),
        };
        Ok(reqwest::Response::from(response))
    }
}

pub fn make_channel(id: i64, channel_type: ChannelType, models: &str, groups: &str) -> Channel {
    Channel {
        id,
        name: format!("channel-{id}"),
        channel_type,
        base_url: "https://upstream.example".to_string(),
        key: "sk-upstream".to_string(),
        models: models.to_string(),
        groups: groups.to_string(),
        model_mapping: Default::default(),
        priority: 0,
        weight: None,
        status: ChannelStatus::Enabled,
        system_prompt: None,
        api_version: None,
        deployment_id: None,
    }
}

pub const TEST_TOKEN: &str = "sk-dispatch-test";

pub fn base_config(channels: Vec<Channel>) -> GatewayConfig {
    GatewayConfig {
        channels,
        tokens: vec![TokenConfig {
            id: 1,
            name: "ci-token".to_string(),
            key: TEST_TOKEN.to_string(),
            group: "default".to_string(),
            user_id: 1,
            enabled: true,
        }],
        users: vec![UserConfig {
            id: 1,
            name: "ci-user".to_string(),
            quota: None,
        }],
        // Background sync is noise in tests.
        channel_sync_interval_seconds: 0,
        ..GatewayConfig::default()
    }
}

pub fn chat_body(model: &str, content: &str) -> String {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
    })
    .to_string()
}

pub fn chat_request(model: &str, content: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {TEST_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(chat_body(model, content)))
        .expect("request")
}

pub fn completion_json(content: &str, total_tokens: u64) -> Value {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": total_tokens / 2,
            "completion_tokens": total_tokens - total_tokens / 2,
            "total_tokens": total_tokens,
        },
    })
}

pub async fn body_string(body: Body) -> String {
    let bytes = to_bytes(body, usize::MAX).await.expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

/// Small pause for work the relay defers to spawned tasks (billing, cache
/// stores).
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
