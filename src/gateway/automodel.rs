use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use super::channel::ChannelRegistry;
use super::health::{HealthTracker, SelectionStrategy};
use super::{ChatMessage, ContentPart, GatewayError, MessageContent};

pub const MODEL_AUTO: &str = "auto";
pub const MODEL_AUTO_FAST: &str = "auto-fast";
pub const MODEL_AUTO_CHEAP: &str = "auto-cheap";
pub const MODEL_AUTO_VI: &str = "auto-vi";
pub const MODEL_AUTO_CODE: &str = "auto-code";
pub const MODEL_AUTO_SMART: &str = "auto-smart";

/// Safe fallback when virtual resolution cannot produce a candidate.
pub const FALLBACK_MODEL: &str = "gpt-4o-mini";

fn virtual_strategy(name: &str) -> Option<SelectionStrategy> {
    let strategy = match name {
        MODEL_AUTO => SelectionStrategy {
            name: "auto",
            quality: 0.4,
            speed: 0.3,
            cost: 0.3,
        },
        MODEL_AUTO_FAST => SelectionStrategy {
            name: "auto-fast",
            quality: 0.2,
            speed: 0.6,
            cost: 0.2,
        },
        MODEL_AUTO_CHEAP => SelectionStrategy {
            name: "auto-cheap",
            quality: 0.2,
            speed: 0.2,
            cost: 0.6,
        },
        MODEL_AUTO_VI => SelectionStrategy {
            name: "auto-vi",
            quality: 0.5,
            speed: 0.2,
            cost: 0.3,
        },
        MODEL_AUTO_CODE => SelectionStrategy {
            name: "auto-code",
            quality: 0.6,
            speed: 0.2,
            cost: 0.2,
        },
        MODEL_AUTO_SMART => SelectionStrategy {
            name: "auto-smart",
            quality: 0.7,
            speed: 0.15,
            cost: 0.15,
        },
        _ => return None,
    };
    Some(strategy)
}

pub fn is_virtual_model(model: &str) -> bool {
    virtual_strategy(&model.to_ascii_lowercase()).is_some()
}

// Model tiers (1 = flagship, 3 = budget).
const MODEL_TIERS: &[(&str, u8)] = &[
    ("gpt-4o", 1),
    ("gpt-4o-2024-11-20", 1),
    ("claude-3-5-sonnet", 1),
    ("claude-3.5-sonnet", 1),
    ("gemini-1.5-pro", 1),
    ("gpt-4-turbo", 1),
    ("claude-3-opus", 1),
    ("gpt-4o-mini", 2),
    ("gpt-4o-mini-2024-07-18", 2),
    ("claude-3-haiku", 2),
    ("gemini-1.5-flash", 2),
    ("deepseek-v3", 2),
    ("deepseek-chat", 2),
    ("qwen-max", 2),
    ("qwen-turbo", 3),
    ("qwen-plus", 3),
    ("deepseek-coder", 3),
    ("llama-3.1-70b", 3),
    ("llama-3.1-8b", 3),
];

const VIETNAMESE_SCORES: &[(&str, f64)] = &[
    ("gpt-4o", 0.95),
    ("gpt-4o-2024-11-20", 0.95),
    ("claude-3-5-sonnet", 0.95),
    ("claude-3.5-sonnet", 0.95),
    ("gpt-4o-mini", 0.91),
    ("gpt-4o-mini-2024-07-18", 0.91),
    ("deepseek-v3", 0.90),
    ("deepseek-chat", 0.88),
    ("gemini-1.5-pro", 0.87),
    ("gemini-1.5-flash", 0.85),
    ("claude-3-haiku", 0.82),
    ("qwen-max", 0.78),
    ("qwen-turbo", 0.70),
];

const CODE_SCORES: &[(&str, f64)] = &[
    ("claude-3-5-sonnet", 0.95),
    ("claude-3.5-sonnet", 0.95),
    ("gpt-4o", 0.93),
    ("gpt-4o-2024-11-20", 0.93),
    ("deepseek-coder", 0.92),
    ("deepseek-v3", 0.90),
    ("gemini-1.5-pro", 0.88),
    ("gpt-4o-mini", 0.85),
    ("claude-3-haiku", 0.80),
];

// Cost per 1M tokens, normalized to gpt-4o = 1.0.
const COST_RATIOS: &[(&str, f64)] = &[
    ("gpt-4o", 1.0),
    ("gpt-4o-2024-11-20", 1.0),
    ("claude-3-5-sonnet", 0.6),
    ("claude-3.5-sonnet", 0.6),
    ("claude-3-opus", 3.0),
    ("gpt-4-turbo", 2.0),
    ("gemini-1.5-pro", 0.7),
    ("gpt-4o-mini", 0.1),
    ("gpt-4o-mini-2024-07-18", 0.1),
    ("claude-3-haiku", 0.05),
    ("gemini-1.5-flash", 0.05),
    ("deepseek-v3", 0.03),
    ("deepseek-chat", 0.02),
    ("deepseek-coder", 0.02),
    ("qwen-max", 0.1),
    ("qwen-turbo", 0.02),
    ("qwen-plus", 0.05),
    ("llama-3.1-70b", 0.02),
    ("llama-3.1-8b", 0.01),
];

/// Cost ratio for billing; unknown models bill at the gpt-4o baseline.
pub fn cost_ratio(model: &str) -> f64 {
    lookup_f64(COST_RATIOS, model).unwrap_or(1.0)
}

fn lookup_f64(table: &[(&str, f64)], model: &str) -> Option<f64> {
    let lower = model.to_ascii_lowercase();
    if let Some((_, value)) = table.iter().find(|(name, _)| *name == lower) {
        return Some(*value);
    }
    // Partial substring match against the table keys.
    table
        .iter()
        .find(|(name, _)| lower.contains(name))
        .map(|(_, value)| *value)
}

fn lookup_tier(model: &str) -> Option<u8> {
    let lower = model.to_ascii_lowercase();
    if let Some((_, tier)) = MODEL_TIERS.iter().find(|(name, _)| *name == lower) {
        return Some(*tier);
    }
    MODEL_TIERS
        .iter()
        .find(|(name, _)| lower.contains(name))
        .map(|(_, tier)| *tier)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Language {
    English,
    Vietnamese,
    Chinese,
    Japanese,
    Korean,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Vietnamese => "vi",
            Language::Chinese => "zh",
            Language::Japanese => "ja",
            Language::Korean => "ko",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestFeatures {
    pub language: Language,
    pub has_code: bool,
    pub has_vision: bool,
    pub token_estimate: usize,
    pub long_context: bool,
    pub complexity: f64,
}

const VI_DIACRITICS: &str = "ăâđêôơưàáảãạằắẳẵặầấẩẫậèéẻẽẹềếểễệìíỉĩịòóỏõọồốổỗộờớởỡợùúủũụừứửữựỳýỷỹỵ";

fn vi_words_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(của|là|và|có|được|trong|cho|với|này|những|đã|để|người|không|một|các|từ|theo|như|khi|tôi|bạn|anh|chị|em)\b",
        )
        .expect("vietnamese word pattern")
    })
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}'
        | '\u{3040}'..='\u{309f}'
        | '\u{30a0}'..='\u{30ff}'
        | '\u{ac00}'..='\u{d7af}')
}

fn detect_language(text: &str) -> Language {
    if text.chars().any(|c| VI_DIACRITICS.contains(c)) {
        return Language::Vietnamese;
    }
    if vi_words_regex().is_match(&text.to_lowercase()) {
        return Language::Vietnamese;
    }
    if text.chars().any(|c| matches!(c, '\u{4e00}'..='\u{9fff}')) {
        return Language::Chinese;
    }
    if text
        .chars()
        .any(|c| matches!(c, '\u{3040}'..='\u{309f}' | '\u{30a0}'..='\u{30ff}'))
    {
        return Language::Japanese;
    }
    if text.chars().any(|c| matches!(c, '\u{ac00}'..='\u{d7af}')) {
        return Language::Korean;
    }
    Language::English
}

const CODE_MARKERS: &[&str] = &[
    "```", "def ", "func ", "function ", "class ", "import ", "const ", "let ", "var ", "public ",
    "private ", "package ",
];

fn has_code_content(text: &str) -> bool {
    let lower = text.to_lowercase();
    CODE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Rough token estimate: ~4 chars per token, ~2 for mostly-CJK text.
pub fn estimate_tokens(text: &str) -> usize {
    let char_count = text.chars().count();
    let cjk_count = text.chars().filter(|c| is_cjk(*c)).count();
    if cjk_count > char_count / 4 {
        char_count / 2
    } else {
        char_count / 4
    }
}

fn message_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => {
            let mut out = Vec::new();
            for part in parts {
                if let ContentPart::Text { text } = part {
                    out.push(text.as_str());
                }
            }
            out.join(" ")
        }
        MessageContent::Empty => String::new(),
    }
}

fn has_vision_content(content: &MessageContent) -> bool {
    match content {
        MessageContent::Parts(parts) => parts
            .iter()
            .any(|part| matches!(part, ContentPart::ImageUrl { .. })),
        _ => false,
    }
}

/// Extracts features from the user turns of the request.
pub fn analyze_request(messages: &[ChatMessage]) -> RequestFeatures {
    let mut text = String::new();
    let mut has_code = false;
    let mut has_vision = false;

    for message in messages {
        if message.role != "user" {
            continue;
        }
        let content = message_text(&message.content);
        if has_vision_content(&message.content) {
            has_vision = true;
        }
        if !content.is_empty() {
            if has_code_content(&content) {
                has_code = true;
            }
            text.push_str(&content);
            text.push(' ');
        }
    }

    let language = detect_language(&text);
    let token_estimate = estimate_tokens(&text);
    let long_context = token_estimate > 30_000;

    let mut complexity: f64 = 0.5;
    if has_code {
        complexity += 0.2;
    }
    if has_vision {
        complexity += 0.2;
    }
    if long_context {
        complexity += 0.1;
    }
    if token_estimate > 10_000 {
        complexity += 0.1;
    }

    RequestFeatures {
        language,
        has_code,
        has_vision,
        token_estimate,
        long_context,
        complexity: complexity.min(1.0),
    }
}

/// Result of resolving a virtual model alias.
#[derive(Clone, Debug)]
pub struct AutoSelection {
    pub requested_model: String,
    pub selected_model: String,
    pub channel_id: i64,
    pub score: f64,
    pub reason: &'static str,
}

pub struct AutoModelResolver {
    tracker: Arc<HealthTracker>,
}

impl AutoModelResolver {
    pub fn new(tracker: Arc<HealthTracker>) -> Self {
        Self { tracker }
    }

    pub fn resolve(
        &self,
        registry: &ChannelRegistry,
        virtual_model: &str,
        group: &str,
        messages: &[ChatMessage],
    ) -> Result<AutoSelection, GatewayError> {
        let lower = virtual_model.to_ascii_lowercase();
        let mut strategy = virtual_strategy(&lower).ok_or_else(|| GatewayError::InvalidRequest {
            reason: format!("unknown virtual model: {virtual_model}"),
        })?;

        let features = analyze_request(messages);
        if features.language == Language::Vietnamese {
            strategy = virtual_strategy(MODEL_AUTO_VI).unwrap_or(strategy);
        }

        let channels = registry.enabled_for_group(group);
        if channels.is_empty() {
            return Err(GatewayError::NoAvailableChannel {
                group: group.to_string(),
                model: virtual_model.to_string(),
            });
        }

        let mut best: Option<(Arc<super::channel::Channel>, String, f64)> = None;
        for channel in channels {
            for model in channel.model_list() {
                let score = self.calculate_score(&channel, model, &strategy, &features);
                let replace = match &best {
                    Some((_, _, best_score)) => score > *best_score,
                    None => true,
                };
                if replace {
                    best = Some((channel.clone(), model.to_string(), score));
                }
            }
        }

        let (channel, model, score) = best.ok_or_else(|| GatewayError::NoAvailableChannel {
            group: group.to_string(),
            model: virtual_model.to_string(),
        })?;

        tracing::debug!(
            requested = %virtual_model,
            selected = %model,
            channel_id = channel.id,
            score,
            "virtual model resolved"
        );

        Ok(AutoSelection {
            requested_model: virtual_model.to_string(),
            selected_model: model,
            channel_id: channel.id,
            score,
            reason: selection_reason(&lower, &features),
        })
    }

    fn calculate_score(
        &self,
        channel: &super::channel::Channel,
        model: &str,
        strategy: &SelectionStrategy,
        features: &RequestFeatures,
    ) -> f64 {
        let quality = quality_score(model, features);
        let health = self.health_score(channel.id);
        let cost = cost_score(model);

        let mut score = quality * strategy.quality + health * strategy.speed + cost * strategy.cost;

        if let Some(weight) = channel.weight {
            if weight > 0 {
                score *= f64::from(weight);
            }
        }
        if channel.priority > 0 {
            score *= 1.0 + channel.priority as f64 * 0.1;
        }
        score
    }

    fn health_score(&self, channel_id: i64) -> f64 {
        let Some(view) = self.tracker.snapshot(channel_id) else {
            return 0.8;
        };
        let latency_score = 100.0 / (view.avg_latency_ms + 100.0);
        view.success_rate() * 0.6 + latency_score * 0.4
    }
}

fn quality_score(model: &str, features: &RequestFeatures) -> f64 {
    if features.language == Language::Vietnamese {
        if let Some(score) = lookup_f64(VIETNAMESE_SCORES, model) {
            return score;
        }
    }
    if features.has_code {
        if let Some(score) = lookup_f64(CODE_SCORES, model) {
            return score;
        }
    }
    match lookup_tier(model) {
        Some(1) => 0.95,
        Some(2) => 0.75,
        Some(3) => 0.55,
        _ => 0.6,
    }
}

fn cost_score(model: &str) -> f64 {
    match lookup_f64(COST_RATIOS, model) {
        Some(ratio) => 1.0 / (1.0 + ratio),
        None => 0.5,
    }
}

fn selection_reason(virtual_model: &str, features: &RequestFeatures) -> &'static str {
    match virtual_model {
        MODEL_AUTO_FAST => "Selected for lowest latency",
        MODEL_AUTO_CHEAP => "Selected for cost efficiency",
        MODEL_AUTO_VI => "Selected for Vietnamese language support",
        MODEL_AUTO_CODE => "Selected for code generation quality",
        MODEL_AUTO_SMART => "Selected for highest quality",
        _ => {
            if features.language == Language::Vietnamese {
                "Balanced selection with Vietnamese optimization"
            } else {
                "Balanced selection"
            }
        }
    }
}
