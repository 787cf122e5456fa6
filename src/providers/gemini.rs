use serde_json::Value;

use super::{Adaptor, RelayMeta};

const DEFAULT_API_VERSION: &str = "v1beta";

/// Google Gemini: key embedded in the URL, request body rewritten from the
/// OpenAI chat shape into `contents`/`generationConfig`.
pub struct GeminiAdaptor;

impl Adaptor for GeminiAdaptor {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn request_url(&self, meta: &RelayMeta, _path: &str) -> String {
        let api_version = meta.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION);
        let operation = if meta.is_stream {
            "streamGenerateContent?alt=sse&key="
        } else {
            "generateContent?key="
        };
        format!(
            "{}/{}/models/{}:{}{}",
            meta.base_url, api_version, meta.actual_model, operation, meta.key
        )
    }

    fn headers(&self, _meta: &RelayMeta) -> Vec<(&'static str, String)> {
        vec![("content-type", "application/json".to_string())]
    }

    fn convert_request(&self, meta: &RelayMeta, body: &mut Value) {
        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut system_parts: Vec<Value> = Vec::new();
        if let Some(prompt) = meta.system_prompt.as_deref() {
            if !prompt.is_empty() {
                system_parts.push(serde_json::json!({"text": prompt}));
            }
        }

        let mut contents = Vec::new();
        for message in &messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            let parts = content_to_parts(message.get("content"));
            if parts.is_empty() {
                continue;
            }
            match role {
                "system" => system_parts.extend(parts),
                "assistant" => contents.push(serde_json::json!({"role": "model", "parts": parts})),
                _ => contents.push(serde_json::json!({"role": "user", "parts": parts})),
            }
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = body.get("max_tokens").and_then(Value::as_u64) {
            generation_config.insert("maxOutputTokens".to_string(), max_tokens.into());
        }
        if let Some(temperature) = body.get("temperature").cloned() {
            generation_config.insert("temperature".to_string(), temperature);
        }
        if let Some(top_p) = body.get("top_p").cloned() {
            generation_config.insert("topP".to_string(), top_p);
        }

        let mut rewritten = serde_json::Map::new();
        rewritten.insert("contents".to_string(), Value::Array(contents));
        if !system_parts.is_empty() {
            rewritten.insert(
                "systemInstruction".to_string(),
                serde_json::json!({"parts": system_parts}),
            );
        }
        if !generation_config.is_empty() {
            rewritten.insert(
                "generationConfig".to_string(),
                Value::Object(generation_config),
            );
        }

        *body = Value::Object(rewritten);
    }

    fn parse_usage(&self, body: &Value) -> Option<(u64, u64, u64)> {
        let usage = body.get("usageMetadata")?;
        let prompt = usage
            .get("promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let completion = usage
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let total = usage
            .get("totalTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(prompt + completion);
        Some((prompt, completion, total))
    }
}

fn content_to_parts(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::String(text)) if !text.is_empty() => {
            vec![serde_json::json!({"text": text})]
        }
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                let text = part.get("text").and_then(Value::as_str)?;
                Some(serde_json::json!({"text": text}))
            })
            .collect(),
        _ => Vec::new(),
    }
}
