use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::utils::hex_encode;

use super::redis_store::RedisStore;
use super::ChatMessage;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseCacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// In-process fallback store for deployments without Redis.
    #[serde(default)]
    pub memory_fallback: bool,
}

fn default_ttl_seconds() -> u64 {
    300
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: default_ttl_seconds(),
            memory_fallback: false,
        }
    }
}

/// A cached completion: the full SSE blob plus accounting metadata. The
/// same record serves stream replay and non-stream synthesis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedResponse {
    pub content: String,
    pub model: String,
    pub created_at: u64,
    pub tokens_used: u64,
}

/// Hit/miss counters shared by the exact and semantic caches.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    tokens_saved: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub tokens_saved: u64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tokens_saved(&self, tokens: u64) {
        self.tokens_saved.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatsSnapshot {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.tokens_saved.store(0, Ordering::Relaxed);
    }
}

/// Fingerprint of the request: sha256 over the canonical JSON of
/// `{model, messages}`.
pub fn fingerprint(model: &str, messages: &[ChatMessage]) -> String {
    let canonical = serde_json::json!({
        "model": model,
        "messages": messages,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex_encode(&hasher.finalize())
}

#[derive(Clone, Debug)]
struct MemoryEntry {
    response: CachedResponse,
    expires_at: u64,
}

/// Exact-match response cache. Persists through the remote KV store when
/// one is configured; optionally keeps an in-process map otherwise.
/// Duplicate concurrent populations are tolerated, last writer wins.
pub struct ResponseCache {
    config: ResponseCacheConfig,
    store: Option<Arc<RedisStore>>,
    memory: RwLock<HashMap<String, MemoryEntry>>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .finish()
    }
}

impl ResponseCache {
    pub fn new(config: ResponseCacheConfig, store: Option<Arc<RedisStore>>) -> Self {
        Self {
            config,
            store,
            memory: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled && (self.store.is_some() || self.config.memory_fallback)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_seconds)
    }

    pub async fn lookup(&self, fingerprint: &str, now: u64) -> Option<CachedResponse> {
        if !self.enabled() {
            return None;
        }

        if let Some(store) = self.store.as_ref() {
            match store.exact_cache_get(fingerprint).await {
                Ok(Some(raw)) => match serde_json::from_str::<CachedResponse>(&raw) {
                    Ok(cached) => return Some(cached),
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping undecodable cache entry");
                        return None;
                    }
                },
                Ok(None) => return None,
                Err(err) => {
                    tracing::warn!(error = %err, "exact cache lookup failed");
                    return None;
                }
            }
        }

        let mut memory = match self.memory.write() {
            Ok(memory) => memory,
            Err(poisoned) => poisoned.into_inner(),
        };
        match memory.get(fingerprint) {
            Some(entry) if now < entry.expires_at => Some(entry.response.clone()),
            Some(_) => {
                memory.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    pub async fn store(&self, fingerprint: &str, response: CachedResponse, now: u64) {
        if !self.enabled() {
            return;
        }

        if let Some(store) = self.store.as_ref() {
            match serde_json::to_string(&response) {
                Ok(payload) => {
                    if let Err(err) = store
                        .exact_cache_set(fingerprint, &payload, self.ttl())
                        .await
                    {
                        tracing::warn!(error = %err, "exact cache store failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "exact cache serialization failed");
                }
            }
            return;
        }

        let mut memory = match self.memory.write() {
            Ok(memory) => memory,
            Err(poisoned) => poisoned.into_inner(),
        };
        memory.insert(
            fingerprint.to_string(),
            MemoryEntry {
                response,
                expires_at: now.saturating_add(self.config.ttl_seconds),
            },
        );
    }

    pub async fn invalidate(&self, fingerprint: &str) {
        if let Some(store) = self.store.as_ref() {
            if let Err(err) = store.exact_cache_delete(fingerprint).await {
                tracing::warn!(error = %err, "exact cache invalidate failed");
            }
            return;
        }
        let mut memory = match self.memory.write() {
            Ok(memory) => memory,
            Err(poisoned) => poisoned.into_inner(),
        };
        memory.remove(fingerprint);
    }

    /// Best-effort clear; remote consistency after this call is undefined.
    pub async fn clear(&self) -> u64 {
        if let Some(store) = self.store.as_ref() {
            return match store.exact_cache_clear().await {
                Ok(removed) => removed,
                Err(err) => {
                    tracing::warn!(error = %err, "exact cache clear failed");
                    0
                }
            };
        }
        let mut memory = match self.memory.write() {
            Ok(memory) => memory,
            Err(poisoned) => poisoned.into_inner(),
        };
        let removed = memory.len() as u64;
        memory.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MessageContent;

    fn messages(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Text(text.to_string()),
            name: None,
        }]
    }

    fn memory_cache(ttl_seconds: u64) -> ResponseCache {
        ResponseCache::new(
            ResponseCacheConfig {
                enabled: true,
                ttl_seconds,
                memory_fallback: true,
            },
            None,
        )
    }

    #[test]
    fn fingerprint_is_deterministic_and_input_sensitive() {
        let a = fingerprint("gpt-4o", &messages("hi"));
        let b = fingerprint("gpt-4o", &messages("hi"));
        let c = fingerprint("gpt-4o", &messages("hello"));
        let d = fingerprint("gpt-4o-mini", &messages("hi"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn round_trip_and_ttl_expiry() {
        let cache = memory_cache(10);
        let fp = fingerprint("gpt-4o", &messages("hi"));
        let response = CachedResponse {
            content: "data: {}\n\n".to_string(),
            model: "gpt-4o".to_string(),
            created_at: 100,
            tokens_used: 7,
        };

        cache.store(&fp, response.clone(), 100).await;
        let hit = cache.lookup(&fp, 105).await.expect("hit");
        assert_eq!(hit.content, response.content);
        assert_eq!(hit.tokens_used, 7);

        // Different fingerprint misses.
        let other = fingerprint("gpt-4o", &messages("other"));
        assert!(cache.lookup(&other, 105).await.is_none());

        // Expired after the TTL.
        assert!(cache.lookup(&fp, 111).await.is_none());
    }

    #[tokio::test]
    async fn disabled_cache_never_stores() {
        let cache = ResponseCache::new(ResponseCacheConfig::default(), None);
        assert!(!cache.enabled());
        let fp = fingerprint("gpt-4o", &messages("hi"));
        cache
            .store(
                &fp,
                CachedResponse {
                    content: String::new(),
                    model: "gpt-4o".to_string(),
                    created_at: 0,
                    tokens_used: 0,
                },
                0,
            )
            .await;
        assert!(cache.lookup(&fp, 0).await.is_none());
    }

    #[tokio::test]
    async fn clear_empties_the_memory_store() {
        let cache = memory_cache(60);
        let fp = fingerprint("gpt-4o", &messages("hi"));
        cache
            .store(
                &fp,
                CachedResponse {
                    content: "x".to_string(),
                    model: "gpt-4o".to_string(),
                    created_at: 0,
                    tokens_used: 0,
                },
                0,
            )
            .await;
        assert_eq!(cache.clear().await, 1);
        assert!(cache.lookup(&fp, 0).await.is_none());
    }

    #[test]
    fn stats_compute_hit_rate() {
        let stats = CacheStats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.add_tokens_saved(40);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.tokens_saved, 40);
        assert!((snapshot.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
