use serde_json::Value;

use super::{inject_system_prompt, rename_model, Adaptor, RelayMeta};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Anthropic messages API: `x-api-key` + `anthropic-version` headers,
/// `/v1/chat/completions` mapped to `/v1/messages`.
pub struct AnthropicAdaptor;

impl Adaptor for AnthropicAdaptor {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn request_url(&self, meta: &RelayMeta, path: &str) -> String {
        let path = if path == "/v1/chat/completions" {
            "/v1/messages"
        } else {
            path
        };
        format!("{}{}", meta.base_url, path)
    }

    fn headers(&self, meta: &RelayMeta) -> Vec<(&'static str, String)> {
        let version = meta
            .api_version
            .clone()
            .unwrap_or_else(|| ANTHROPIC_VERSION.to_string());
        vec![
            ("x-api-key", meta.key.clone()),
            ("anthropic-version", version),
            ("content-type", "application/json".to_string()),
        ]
    }

    fn convert_request(&self, meta: &RelayMeta, body: &mut Value) {
        rename_model(meta, body);
        inject_system_prompt(meta, body);

        let Some(object) = body.as_object_mut() else {
            return;
        };

        // The messages API wants system as a top-level field and requires
        // max_tokens.
        if let Some(messages) = object.get_mut("messages").and_then(Value::as_array_mut) {
            let mut system = None;
            messages.retain(|message| {
                if message.get("role").and_then(Value::as_str) == Some("system") {
                    system = message.get("content").cloned();
                    false
                } else {
                    true
                }
            });
            if let Some(system) = system {
                object.insert("system".to_string(), system);
            }
        }

        if !object.contains_key("max_tokens") {
            object.insert(
                "max_tokens".to_string(),
                Value::Number(DEFAULT_MAX_TOKENS.into()),
            );
        }
    }

    fn parse_usage(&self, body: &Value) -> Option<(u64, u64, u64)> {
        let usage = body.get("usage")?;
        let input = usage.get("input_tokens").and_then(Value::as_u64)?;
        let output = usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Some((input, output, input + output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::channel::ChannelType;
    use crate::providers::tests::test_meta;

    #[test]
    fn chat_completions_maps_to_messages() {
        let meta = test_meta(ChannelType::Anthropic, "https://api.anthropic.com");
        assert_eq!(
            AnthropicAdaptor.request_url(&meta, "/v1/chat/completions"),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[test]
    fn headers_carry_key_and_version() {
        let mut meta = test_meta(ChannelType::Anthropic, "https://api.anthropic.com");
        meta.api_version = None;
        let headers = AnthropicAdaptor.headers(&meta);
        assert!(headers
            .iter()
            .any(|(name, value)| *name == "x-api-key" && value == "sk-upstream"));
        assert!(headers
            .iter()
            .any(|(name, value)| *name == "anthropic-version" && value == ANTHROPIC_VERSION));
    }

    #[test]
    fn system_message_is_hoisted_and_max_tokens_defaulted() {
        let meta = test_meta(ChannelType::Anthropic, "https://api.anthropic.com");
        let mut body = serde_json::json!({
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
            ],
        });
        AnthropicAdaptor.convert_request(&meta, &mut body);

        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn usage_uses_input_output_names() {
        let body = serde_json::json!({"usage": {"input_tokens": 10, "output_tokens": 5}});
        assert_eq!(AnthropicAdaptor.parse_usage(&body), Some((10, 5, 15)));
    }
}
