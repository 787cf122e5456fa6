use super::{Adaptor, RelayMeta};

const DEFAULT_API_VERSION: &str = "2024-02-01";

/// Azure OpenAI: deployment-scoped URL, `api-key` header, `api-version`
/// query parameter.
pub struct AzureAdaptor;

impl Adaptor for AzureAdaptor {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn request_url(&self, meta: &RelayMeta, path: &str) -> String {
        let deployment = meta
            .deployment_id
            .as_deref()
            .unwrap_or(meta.actual_model.as_str());
        let api_version = meta.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION);
        let operation = path.strip_prefix("/v1/").unwrap_or(path);
        format!(
            "{}/openai/deployments/{deployment}/{operation}?api-version={api_version}",
            meta.base_url
        )
    }

    fn headers(&self, meta: &RelayMeta) -> Vec<(&'static str, String)> {
        vec![
            ("api-key", meta.key.clone()),
            ("content-type", "application/json".to_string()),
        ]
    }
}
