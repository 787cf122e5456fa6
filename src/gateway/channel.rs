use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::GatewayError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

/// Provider family served by a channel. The wire details live in the
/// matching adaptor under `providers/`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Openai,
    Azure,
    Anthropic,
    Gemini,
    OpenaiCompatible,
}

impl ChannelType {
    pub fn provider_name(&self) -> &'static str {
        match self {
            ChannelType::Openai => "openai",
            ChannelType::Azure => "azure",
            ChannelType::Anthropic => "anthropic",
            ChannelType::Gemini => "gemini",
            ChannelType::OpenaiCompatible => "openai_compatible",
        }
    }
}

/// One credentialed route to an upstream provider. Created by the admin
/// plane; the dataplane only ever reads it.
#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub base_url: String,
    pub key: String,
    /// Comma-separated model list, as configured by the admin plane.
    pub models: String,
    /// Comma-separated group list.
    pub groups: String,
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<String>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.channel_type)
            .field("base_url", &self.base_url)
            .field("key", &"<redacted>")
            .field("models", &self.models)
            .field("groups", &self.groups)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .field("status", &self.status)
            .finish()
    }
}

impl Channel {
    pub fn model_list(&self) -> Vec<&str> {
        self.models
            .split(',')
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .collect()
    }

    pub fn group_list(&self) -> Vec<&str> {
        self.groups
            .split(',')
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .collect()
    }

    pub fn serves_group(&self, group: &str) -> bool {
        self.group_list().iter().any(|candidate| *candidate == group)
    }

    pub fn serves_model(&self, model: &str) -> bool {
        self.model_list().iter().any(|candidate| *candidate == model)
    }

    /// Applies the per-channel rename map; unknown models pass through.
    pub fn mapped_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }

    pub fn enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }
}

/// Source of channel records. The production store is the relational
/// database behind the admin plane; tests and the bundled binary load from
/// configuration.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn load_channels(&self) -> Result<Vec<Channel>, GatewayError>;
}

pub struct StaticChannelStore {
    channels: Vec<Channel>,
}

impl StaticChannelStore {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl ChannelStore for StaticChannelStore {
    async fn load_channels(&self) -> Result<Vec<Channel>, GatewayError> {
        Ok(self.channels.clone())
    }
}

/// Read-mostly, indexed snapshot of the channel table.
///
/// `(group, model)` maps to the candidate list sorted by descending
/// priority; writers only run during periodic sync.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<i64, Arc<Channel>>,
    by_group_model: HashMap<(String, String), Vec<Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&self, channels: Vec<Channel>) {
        let mut by_id = HashMap::new();
        let mut by_group_model: HashMap<(String, String), Vec<Arc<Channel>>> = HashMap::new();

        for channel in channels {
            let channel = Arc::new(channel);
            by_id.insert(channel.id, channel.clone());
            if !channel.enabled() {
                continue;
            }
            for group in channel.group_list() {
                for model in channel.model_list() {
                    by_group_model
                        .entry((group.to_string(), model.to_string()))
                        .or_default()
                        .push(channel.clone());
                }
            }
        }

        for candidates in by_group_model.values_mut() {
            // Stable sort: descending priority, channel id breaks ties.
            candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        }

        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.by_id = by_id;
        inner.by_group_model = by_group_model;
    }

    pub fn get(&self, channel_id: i64) -> Option<Arc<Channel>> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.by_id.get(&channel_id).cloned()
    }

    pub fn candidates(&self, group: &str, model: &str) -> Vec<Arc<Channel>> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner
            .by_group_model
            .get(&(group.to_string(), model.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Every enabled channel serving the group, for the virtual-model
    /// resolver's full enumeration.
    pub fn enabled_for_group(&self, group: &str) -> Vec<Arc<Channel>> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<Arc<Channel>> = inner
            .by_id
            .values()
            .filter(|channel| channel.enabled() && channel.serves_group(group))
            .cloned()
            .collect();
        out.sort_by_key(|channel| channel.id);
        out
    }

    pub fn channel_count(&self) -> usize {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.by_id.len()
    }
}

#[cfg(test)]
pub(crate) fn test_channel(id: i64, models: &str, groups: &str) -> Channel {
    Channel {
        id,
        name: format!("channel-{id}"),
        channel_type: ChannelType::Openai,
        base_url: "https://api.openai.com".to_string(),
        key: "sk-test".to_string(),
        models: models.to_string(),
        groups: groups.to_string(),
        model_mapping: BTreeMap::new(),
        priority: 0,
        weight: None,
        status: ChannelStatus::Enabled,
        system_prompt: None,
        api_version: None,
        deployment_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_indexes_by_group_and_model() {
        let registry = ChannelRegistry::new();
        registry.rebuild(vec![
            test_channel(1, "gpt-4o, gpt-4o-mini", "default"),
            test_channel(2, "gpt-4o-mini", "default, vip"),
        ]);

        let candidates = registry.candidates("default", "gpt-4o-mini");
        assert_eq!(candidates.len(), 2);
        assert!(registry.candidates("vip", "gpt-4o").is_empty());
        assert_eq!(registry.candidates("vip", "gpt-4o-mini").len(), 1);
    }

    #[test]
    fn registry_sorts_by_descending_priority() {
        let mut low = test_channel(1, "gpt-4o", "default");
        low.priority = 1;
        let mut high = test_channel(2, "gpt-4o", "default");
        high.priority = 5;

        let registry = ChannelRegistry::new();
        registry.rebuild(vec![low, high]);

        let candidates = registry.candidates("default", "gpt-4o");
        assert_eq!(candidates[0].id, 2);
        assert_eq!(candidates[1].id, 1);
    }

    #[test]
    fn disabled_channels_are_not_indexed_but_still_resolvable_by_id() {
        let mut disabled = test_channel(3, "gpt-4o", "default");
        disabled.status = ChannelStatus::ManuallyDisabled;

        let registry = ChannelRegistry::new();
        registry.rebuild(vec![disabled]);

        assert!(registry.candidates("default", "gpt-4o").is_empty());
        assert!(registry.get(3).is_some());
    }

    #[test]
    fn model_mapping_renames_known_models_only() {
        let mut channel = test_channel(1, "gpt-4o", "default");
        channel
            .model_mapping
            .insert("gpt-4o".to_string(), "gpt-4o-2024-11-20".to_string());

        assert_eq!(channel.mapped_model("gpt-4o"), "gpt-4o-2024-11-20");
        assert_eq!(channel.mapped_model("gpt-4o-mini"), "gpt-4o-mini");
    }

    #[test]
    fn comma_lists_tolerate_whitespace() {
        let channel = test_channel(1, " a , b ,", " default ,vip ");
        assert_eq!(channel.model_list(), vec!["a", "b"]);
        assert!(channel.serves_group("default"));
        assert!(channel.serves_group("vip"));
        assert!(!channel.serves_group("other"));
    }
}
