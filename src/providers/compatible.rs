use super::{Adaptor, RelayMeta};

/// Generic OpenAI-compatible pass-through (DeepSeek, Groq, OpenRouter,
/// self-hosted). These providers already carry `/v1` in their base URL, so
/// the inbound prefix is stripped to avoid `/v1/v1`.
pub struct CompatibleAdaptor;

impl Adaptor for CompatibleAdaptor {
    fn name(&self) -> &'static str {
        "openai_compatible"
    }

    fn request_url(&self, meta: &RelayMeta, path: &str) -> String {
        let suffix = if meta.base_url.ends_with("/v1") {
            path.strip_prefix("/v1").unwrap_or(path)
        } else {
            path
        };
        format!("{}{}", meta.base_url, suffix)
    }

    fn headers(&self, meta: &RelayMeta) -> Vec<(&'static str, String)> {
        vec![
            ("authorization", format!("Bearer {}", meta.key)),
            ("content-type", "application/json".to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::channel::ChannelType;
    use crate::providers::tests::test_meta;

    #[test]
    fn strips_duplicate_v1_prefix() {
        let meta = test_meta(ChannelType::OpenaiCompatible, "https://api.deepseek.com/v1");
        assert_eq!(
            CompatibleAdaptor.request_url(&meta, "/v1/chat/completions"),
            "https://api.deepseek.com/v1/chat/completions"
        );
    }

    #[test]
    fn leaves_bare_base_urls_alone() {
        let meta = test_meta(ChannelType::OpenaiCompatible, "http://localhost:8000");
        assert_eq!(
            CompatibleAdaptor.request_url(&meta, "/v1/chat/completions"),
            "http://localhost:8000/v1/chat/completions"
        );
    }
}
