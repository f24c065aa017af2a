use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CacheError, SharedStore};
use crate::config::PromptCacheConfig;
use crate::relay::estimate_tokens;

/// Prefixes shorter than this (approximate tokens) are not worth caching upstream.
pub const MIN_CACHE_TOKENS: usize = 4096;

/// Upstream lifecycle operations for server-side prompt caches.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Whether the provider still holds `handle`.
    async fn cache_exists(&self, handle: &str) -> Result<bool, CacheError>;

    /// Creates cached content for the prefix the backend was built with.
    async fn create_cache(
        &self,
        model: &str,
        ttl: Duration,
        display_name: &str,
    ) -> Result<String, CacheError>;
}

/// The reusable part of a request: a stable serialization plus its size estimate.
#[derive(Debug, Clone)]
pub struct PromptPrefix {
    fingerprint: String,
    estimated_tokens: usize,
}

impl PromptPrefix {
    pub fn new<'a, T: Serialize>(
        content: &T,
        texts: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, CacheError> {
        Ok(Self {
            fingerprint: serde_json::to_string(content)?,
            estimated_tokens: estimate_tokens(texts),
        })
    }

    pub fn estimated_tokens(&self) -> usize {
        self.estimated_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOutcome {
    pub handle: String,
    pub created: bool,
    pub estimated_tokens: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope {
    cache_name: String,
    channel_id: i64,
}

/// Stored values are either the envelope or, from older writers, the bare handle.
fn parse_stored_value(raw: &str) -> Option<(String, Option<i64>)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with('{') {
        return serde_json::from_str::<CacheEnvelope>(raw)
            .ok()
            .filter(|e| !e.cache_name.is_empty())
            .map(|e| (e.cache_name, Some(e.channel_id)));
    }
    Some((raw.to_string(), None))
}

pub struct PromptCacheManager {
    store: Arc<dyn SharedStore>,
    config: PromptCacheConfig,
}

impl PromptCacheManager {
    pub fn new(store: Arc<dyn SharedStore>, config: PromptCacheConfig) -> Self {
        Self { store, config }
    }

    pub fn should_cache(&self, model: &str, prefix: &PromptPrefix) -> bool {
        if !self.config.enabled {
            return false;
        }
        let eligible = prefix.estimated_tokens >= MIN_CACHE_TOKENS;
        tracing::debug!(
            model,
            estimated_tokens = prefix.estimated_tokens,
            eligible,
            "prompt cache eligibility"
        );
        eligible
    }

    pub fn prefix_hash(model: &str, prefix: &PromptPrefix) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update(b"|");
        hasher.update(prefix.fingerprint.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn store_key(&self, channel_id: i64, hash: &str) -> String {
        if self.config.per_channel {
            format!("{}:{}:{}", self.config.namespace, channel_id, hash)
        } else {
            format!("{}:{}", self.config.namespace, hash)
        }
    }

    fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.config.store_timeout_ms.max(1))
    }

    /// Returns a verified handle for the prefix, creating upstream cached content
    /// when no usable mapping exists. Store failures degrade to the create path;
    /// only a failed upstream creation is returned as an error.
    pub async fn get_or_create(
        &self,
        backend: &dyn CacheBackend,
        channel_id: i64,
        model: &str,
        prefix: &PromptPrefix,
    ) -> Result<CacheOutcome, CacheError> {
        let hash = Self::prefix_hash(model, prefix);
        let key = self.store_key(channel_id, &hash);

        if let Some(handle) = self.lookup(&key, channel_id).await {
            match backend.cache_exists(&handle).await {
                Ok(true) => {
                    tracing::debug!(channel_id, model, %handle, "prompt cache hit");
                    return Ok(CacheOutcome {
                        handle,
                        created: false,
                        estimated_tokens: prefix.estimated_tokens,
                    });
                }
                Ok(false) => {
                    tracing::info!(channel_id, model, %handle, "cached content expired upstream");
                }
                Err(e) => {
                    tracing::warn!(channel_id, model, %handle, "verify cached content failed: {}", e);
                }
            }
        }

        let ttl = Duration::from_secs(self.config.ttl_secs.max(1));
        let handle = backend.create_cache(model, ttl, &hash).await?;
        tracing::info!(
            channel_id,
            model,
            %handle,
            estimated_tokens = prefix.estimated_tokens,
            "created upstream prompt cache"
        );

        self.write_back(&key, &handle, channel_id).await;

        Ok(CacheOutcome {
            handle,
            created: true,
            estimated_tokens: prefix.estimated_tokens,
        })
    }

    async fn lookup(&self, key: &str, channel_id: i64) -> Option<String> {
        let raw = match tokio::time::timeout(self.store_timeout(), self.store.get(key)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                tracing::warn!(key, "prompt cache store read failed: {}", e);
                return None;
            }
            Err(_) => {
                tracing::warn!(key, "prompt cache store read timed out");
                return None;
            }
        };
        match parse_stored_value(&raw) {
            Some((_, Some(owner))) if owner != channel_id => {
                tracing::debug!(key, owner, channel_id, "cached handle belongs to another channel");
                None
            }
            Some((handle, _)) => Some(handle),
            None => None,
        }
    }

    async fn write_back(&self, key: &str, handle: &str, channel_id: i64) {
        let envelope = CacheEnvelope {
            cache_name: handle.to_string(),
            channel_id,
        };
        let value = match serde_json::to_string(&envelope) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, "encode prompt cache entry failed: {}", e);
                return;
            }
        };
        let ttl = Duration::from_secs(self.config.mapping_ttl_secs.max(1));
        match tokio::time::timeout(self.store_timeout(), self.store.set_ex(key, &value, ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(key, "prompt cache store write failed: {}", e),
            Err(_) => tracing::warn!(key, "prompt cache store write timed out"),
        }
    }
}
