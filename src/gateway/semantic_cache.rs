use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::utils::{fnv1a64, hex_encode};

use super::redis_store::RedisStore;

const VECTOR_DIM: usize = 256;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticCacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

fn default_threshold() -> f64 {
    0.85
}

fn default_max_size() -> usize {
    1000
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_threshold(),
            max_size: default_max_size(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorEntry {
    pub vector: Vec<f64>,
    pub response: String,
    pub model: String,
    pub query: String,
    pub tokens: u64,
    pub created: u64,
    pub hit_count: u64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SemanticCacheStats {
    pub enabled: bool,
    pub threshold: f64,
    pub entries: usize,
    pub max_size: usize,
    pub total_hits: u64,
}

#[derive(Clone, Debug)]
pub struct SemanticHit {
    pub response: String,
    pub similarity: f64,
    pub tokens: u64,
}

/// In-process vector-similarity cache over character n-gram embeddings.
/// No external embedding API involved; close-to-exact rephrasings are the
/// target, not deep semantic matches.
pub struct SemanticCache {
    config: SemanticCacheConfig,
    entries: RwLock<HashMap<String, VectorEntry>>,
    store: Option<Arc<RedisStore>>,
}

impl std::fmt::Debug for SemanticCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticCache")
            .field("config", &self.config)
            .finish()
    }
}

impl SemanticCache {
    pub fn new(config: SemanticCacheConfig, store: Option<Arc<RedisStore>>) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Byte n-grams (n in 2..=4, weight 1/n) plus whole words (weight 2),
    /// folded into a unit-normalized 256-dim vector.
    pub fn generate_embedding(text: &str) -> Vec<f64> {
        let text = text.trim().to_lowercase();
        let bytes = text.as_bytes();
        let mut vector = vec![0.0f64; VECTOR_DIM];

        for n in 2..=4usize {
            if bytes.len() < n {
                continue;
            }
            for window in bytes.windows(n) {
                let idx = (fnv1a64(window) % VECTOR_DIM as u64) as usize;
                vector[idx] += 1.0 / n as f64;
            }
        }

        for word in text.split_whitespace() {
            let idx = (fnv1a64(word.as_bytes()) % VECTOR_DIM as u64) as usize;
            vector[idx] += 2.0;
        }

        normalize(&mut vector);
        vector
    }

    fn vector_key(vector: &[f64]) -> String {
        let data = serde_json::to_vec(vector).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let digest = hasher.finalize();
        hex_encode(&digest[..16])
    }

    /// Scans entries of the same model family for the best cosine match.
    pub fn lookup(&self, model: &str, query: &str) -> Option<SemanticHit> {
        if !self.config.enabled || query.is_empty() {
            return None;
        }

        let query_vector = Self::generate_embedding(query);
        let family = model_family(model);

        let best_key = {
            let entries = match self.entries.read() {
                Ok(entries) => entries,
                Err(poisoned) => poisoned.into_inner(),
            };

            let mut best: Option<(String, f64)> = None;
            for (key, entry) in entries.iter() {
                if model_family(&entry.model) != family {
                    continue;
                }
                let score = cosine_similarity(&query_vector, &entry.vector);
                let replace = match &best {
                    Some((_, best_score)) => score > *best_score,
                    None => true,
                };
                if replace {
                    best = Some((key.clone(), score));
                }
            }
            best
        };

        let (key, similarity) = best_key?;
        if similarity < self.config.threshold {
            return None;
        }

        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries.get_mut(&key)?;
        entry.hit_count = entry.hit_count.saturating_add(1);
        Some(SemanticHit {
            response: entry.response.clone(),
            similarity,
            tokens: entry.tokens,
        })
    }

    /// Inserts an entry, evicting the lowest-value 10% when full. Returns
    /// the key and serialized entry for optional remote persistence.
    pub fn store(
        &self,
        model: &str,
        query: &str,
        response: &str,
        tokens: u64,
        now: u64,
    ) -> Option<(String, String)> {
        if !self.config.enabled || query.is_empty() {
            return None;
        }

        let vector = Self::generate_embedding(query);
        let key = Self::vector_key(&vector);
        let entry = VectorEntry {
            vector,
            response: response.to_string(),
            model: model.to_string(),
            query: truncate(query, 200),
            tokens,
            created: now,
            hit_count: 0,
        };

        let payload = serde_json::to_string(&entry).ok();

        {
            let mut entries = match self.entries.write() {
                Ok(entries) => entries,
                Err(poisoned) => poisoned.into_inner(),
            };
            if entries.len() >= self.config.max_size {
                evict_lowest(&mut entries, now);
            }
            entries.insert(key.clone(), entry);
        }

        payload.map(|payload| (key, payload))
    }

    /// Fire-and-forget remote persistence after a local store.
    pub fn persist(&self, key: String, payload: String) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let index: Vec<String> = {
            let entries = match self.entries.read() {
                Ok(entries) => entries,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries.keys().cloned().collect()
        };
        tokio::spawn(async move {
            if let Err(err) = store.semantic_store(&key, &payload, &index).await {
                tracing::warn!(error = %err, "semantic cache persistence failed");
            }
        });
    }

    /// Rebuilds the in-memory store from the remote index on startup.
    pub async fn load_from_store(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let keys = match store.semantic_load_index().await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(error = %err, "semantic index load failed");
                return;
            }
        };

        let mut loaded = 0usize;
        for key in keys {
            let Ok(Some(raw)) = store.semantic_load_entry(&key).await else {
                continue;
            };
            let Ok(entry) = serde_json::from_str::<VectorEntry>(&raw) else {
                continue;
            };
            let mut entries = match self.entries.write() {
                Ok(entries) => entries,
                Err(poisoned) => poisoned.into_inner(),
            };
            if entries.len() >= self.config.max_size {
                break;
            }
            entries.insert(key, entry);
            loaded += 1;
        }
        if loaded > 0 {
            tracing::info!(entries = loaded, "semantic cache restored from store");
        }
    }

    pub fn clear(&self) -> usize {
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn stats(&self) -> SemanticCacheStats {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        SemanticCacheStats {
            enabled: self.config.enabled,
            threshold: self.config.threshold,
            entries: entries.len(),
            max_size: self.config.max_size,
            total_hits: entries.values().map(|entry| entry.hit_count).sum(),
        }
    }
}

/// Evicts the top 10% by `age_hours - 10 * hit_count` (higher means less
/// valuable).
fn evict_lowest(entries: &mut HashMap<String, VectorEntry>, now: u64) {
    if entries.is_empty() {
        return;
    }

    let mut scored: Vec<(String, f64)> = entries
        .iter()
        .map(|(key, entry)| {
            let age_hours = now.saturating_sub(entry.created) as f64 / 3600.0;
            (key.clone(), age_hours - entry.hit_count as f64 * 10.0)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let evict_count = (entries.len() / 10).max(1);
    for (key, _) in scored.into_iter().take(evict_count) {
        entries.remove(&key);
    }
}

/// Coarse family tag so a gpt-4o entry never answers a claude request.
pub fn model_family(model: &str) -> &'static str {
    let lower = model.to_ascii_lowercase();
    if lower.contains("gpt-4") {
        "gpt4"
    } else if lower.contains("gpt-3.5") {
        "gpt35"
    } else if lower.contains("claude") {
        "claude"
    } else if lower.contains("gemini") {
        "gemini"
    } else if lower.contains("llama") {
        "llama"
    } else if lower.contains("mistral") {
        "mistral"
    } else {
        "other"
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut mag_a = 0.0;
    let mut mag_b = 0.0;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        mag_a += a[i] * a[i];
        mag_b += b[i] * b[i];
    }
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a.sqrt() * mag_b.sqrt())
}

fn normalize(vector: &mut [f64]) {
    let mag: f64 = vector.iter().map(|v| v * v).sum();
    if mag == 0.0 {
        return;
    }
    let mag = mag.sqrt();
    for v in vector.iter_mut() {
        *v /= mag;
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_cache(max_size: usize) -> SemanticCache {
        SemanticCache::new(
            SemanticCacheConfig {
                enabled: true,
                threshold: 0.85,
                max_size,
            },
            None,
        )
    }

    #[test]
    fn embeddings_are_unit_normalized() {
        let vector = SemanticCache::generate_embedding("hello world");
        let mag: f64 = vector.iter().map(|v| v * v).sum();
        assert!((mag - 1.0).abs() < 1e-9);
        assert_eq!(vector.len(), VECTOR_DIM);
    }

    #[test]
    fn identical_queries_hit() {
        let cache = enabled_cache(100);
        cache.store("gpt-4o", "what is rust", "a language", 5, 0);

        let hit = cache.lookup("gpt-4o", "what is rust").expect("hit");
        assert_eq!(hit.response, "a language");
        assert!(hit.similarity > 0.999);
        assert_eq!(cache.stats().total_hits, 1);
    }

    #[test]
    fn unrelated_queries_miss() {
        let cache = enabled_cache(100);
        cache.store("gpt-4o", "what is rust", "a language", 5, 0);
        assert!(cache
            .lookup("gpt-4o", "recipe for sourdough bread starter")
            .is_none());
    }

    #[test]
    fn model_families_are_isolated() {
        let cache = enabled_cache(100);
        cache.store("gpt-4o", "what is rust", "a language", 5, 0);

        // Same text, different family: must miss regardless of similarity.
        assert!(cache.lookup("claude-3-5-sonnet", "what is rust").is_none());
        // Same family, different release: allowed to hit.
        assert!(cache.lookup("gpt-4o-mini", "what is rust").is_some());
    }

    #[test]
    fn eviction_removes_the_least_valuable_tenth() {
        let cache = enabled_cache(10);
        for i in 0..10 {
            cache.store("gpt-4o", &format!("query number {i}"), "r", 1, 0);
        }
        // A popular entry should survive the next eviction.
        let popular = "query number 3";
        for _ in 0..5 {
            let _ = cache.lookup("gpt-4o", popular);
        }

        cache.store("gpt-4o", "one more query", "r", 1, 3600 * 24);
        assert!(cache.stats().entries <= 10);
        assert!(cache.lookup("gpt-4o", popular).is_some());
    }

    #[test]
    fn clear_reports_removed_entries() {
        let cache = enabled_cache(10);
        cache.store("gpt-4o", "a", "r", 1, 0);
        cache.store("gpt-4o", "b", "r", 1, 0);
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn family_mapping_collapses_variants() {
        assert_eq!(model_family("gpt-4o-mini"), "gpt4");
        assert_eq!(model_family("GPT-4-turbo"), "gpt4");
        assert_eq!(model_family("claude-3-haiku"), "claude");
        assert_eq!(model_family("deepseek-v3"), "other");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "xin chào các bạn";
        let out = truncate(text, 9);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 12);
    }
}
