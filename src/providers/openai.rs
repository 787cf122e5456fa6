use super::{Adaptor, RelayMeta};

/// OpenAI-native wire protocol: bearer auth, paths passed through.
pub struct OpenAiAdaptor;

impl Adaptor for OpenAiAdaptor {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn request_url(&self, meta: &RelayMeta, path: &str) -> String {
        format!("{}{}", meta.base_url, path)
    }

    fn headers(&self, meta: &RelayMeta) -> Vec<(&'static str, String)> {
        vec![
            ("authorization", format!("Bearer {}", meta.key)),
            ("content-type", "application/json".to_string()),
        ]
    }
}
