//! Two-level compiled-IR cache: per-process LRU over a shared KV.

pub mod kv;

pub use kv::{KvStore, MemoryKv};

use crate::compiler::ir::CompiledModel;
use crate::config::CacheConfig;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Cache key: entity + version + overlay-set hash suffix.
pub fn model_key(entity_name: &str, version: u32, overlay_hash: &str) -> String {
    format!("model:{entity_name}:{version}:{overlay_hash}")
}

/// Two-level cache for compiled models, content-addressed by `input_hash`.
///
/// L1 holds `Arc<CompiledModel>`; entries are deep-immutable after insert so
/// readers share without locking. L2 holds the canonical JSON with a TTL.
/// L2 failures degrade to a miss (callers recompile); they never propagate.
pub struct ModelCache {
    l1: Mutex<LruCache<String, Arc<CompiledModel>>>,
    l2: Arc<dyn KvStore>,
    ttl_secs: u64,
}

impl ModelCache {
    pub fn new(config: &CacheConfig, l2: Arc<dyn KvStore>) -> Self {
        let capacity = NonZeroUsize::new(config.l1_capacity.max(128))
            .unwrap_or(NonZeroUsize::new(128).unwrap());
        Self {
            l1: Mutex::new(LruCache::new(capacity)),
            l2,
            ttl_secs: config.l2_ttl_secs,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CompiledModel>> {
        if let Ok(mut l1) = self.l1.lock() {
            if let Some(model) = l1.get(key) {
                return Some(model.clone());
            }
        }

        match self.l2.get(key).await {
            Ok(Some(json)) => match serde_json::from_str::<CompiledModel>(&json) {
                Ok(model) => {
                    let model = Arc::new(model);
                    if let Ok(mut l1) = self.l1.lock() {
                        l1.put(key.to_string(), model.clone());
                    }
                    Some(model)
                }
                Err(e) => {
                    // Corrupt entry: delete and let the caller recompile.
                    tracing::warn!(key, error = %e, "corrupt L2 cache entry dropped");
                    let _ = self.l2.del(key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "L2 cache read failed; degrading to recompile");
                None
            }
        }
    }

    /// Insert a compiled model. A write never replaces an entry holding the
    /// same `input_hash` with different bytes; the first write wins, which
    /// keeps the cache content-addressed.
    pub async fn put(&self, key: &str, model: Arc<CompiledModel>) {
        if let Ok(mut l1) = self.l1.lock() {
            if let Some(existing) = l1.peek(key) {
                if existing.input_hash == model.input_hash {
                    return;
                }
            }
            l1.put(key.to_string(), model.clone());
        }

        match serde_json::to_string(model.as_ref()) {
            Ok(json) => {
                if let Err(e) = self.l2.setex(key, &json, self.ttl_secs).await {
                    tracing::warn!(key, error = %e, "L2 cache write failed");
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "model serialization for L2 failed"),
        }
    }

    /// Explicit invalidation (publish, overlay change). Cascades L1 → L2.
    pub async fn invalidate(&self, key: &str) {
        if let Ok(mut l1) = self.l1.lock() {
            l1.pop(key);
        }
        if let Err(e) = self.l2.del(key).await {
            tracing::warn!(key, error = %e, "L2 cache delete failed");
        }
    }

    /// Invalidate every cached variant of an entity version (all overlay
    /// suffixes).
    pub async fn invalidate_entity(&self, entity_name: &str, version: u32) {
        let prefix = format!("model:{entity_name}:{version}:");
        if let Ok(mut l1) = self.l1.lock() {
            // LruCache has no prefix scan; collect then pop.
            let stale: Vec<String> = l1
                .iter()
                .map(|(k, _)| k.clone())
                .filter(|k| k.starts_with(&prefix))
                .collect();
            for key in stale {
                l1.pop(&key);
            }
        }
        match self.l2.keys(&prefix).await {
            Ok(keys) => {
                for key in keys {
                    let _ = self.l2.del(&key).await;
                }
            }
            Err(e) => tracing::warn!(prefix, error = %e, "L2 key scan failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::CompiledModel;
    use crate::context::now_ms;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use uuid::Uuid;

    fn model(input_hash: &str) -> Arc<CompiledModel> {
        Arc::new(CompiledModel {
            entity_name: "Invoice".to_string(),
            version: 1,
            table_name: "ent_invoice".to_string(),
            fields: vec![],
            policies: vec![],
            select_fragment: "*".to_string(),
            from_fragment: "ent_invoice".to_string(),
            tenant_filter_fragment: "tenant_id = $1".to_string(),
            indexes: vec![],
            metadata: Default::default(),
            compiled_at: now_ms(),
            compiled_by: Uuid::nil(),
            input_hash: input_hash.to_string(),
            output_hash: "out".to_string(),
            diagnostics: vec![],
        })
    }

    fn cache() -> ModelCache {
        ModelCache::new(&CacheConfig::default(), Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn l1_hit_after_put() {
        let cache = cache();
        let key = model_key("Invoice", 1, "none");
        cache.put(&key, model("h1")).await;
        let got = cache.get(&key).await.unwrap();
        assert_eq!(got.input_hash, "h1");
    }

    #[tokio::test]
    async fn l2_promotes_to_l1() {
        let kv = Arc::new(MemoryKv::new());
        let writer = ModelCache::new(&CacheConfig::default(), kv.clone());
        let key = model_key("Invoice", 1, "none");
        writer.put(&key, model("h1")).await;

        // Fresh cache, same KV: must hydrate from L2.
        let reader = ModelCache::new(&CacheConfig::default(), kv);
        let got = reader.get(&key).await.unwrap();
        assert_eq!(got.input_hash, "h1");
    }

    #[tokio::test]
    async fn same_input_hash_write_is_idempotent() {
        let cache = cache();
        let key = model_key("Invoice", 1, "none");
        cache.put(&key, model("h1")).await;
        cache.put(&key, model("h1")).await;
        assert_eq!(cache.get(&key).await.unwrap().input_hash, "h1");
    }

    #[tokio::test]
    async fn invalidate_cascades_both_levels() {
        let kv = Arc::new(MemoryKv::new());
        let cache = ModelCache::new(&CacheConfig::default(), kv.clone());
        let key = model_key("Invoice", 1, "none");
        cache.put(&key, model("h1")).await;
        cache.invalidate(&key).await;
        assert!(cache.get(&key).await.is_none());
        assert!(kv.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_entity_clears_all_overlay_variants() {
        let cache = cache();
        let a = model_key("Invoice", 1, "aaa");
        let b = model_key("Invoice", 1, "bbb");
        let other = model_key("Order", 1, "aaa");
        cache.put(&a, model("h1")).await;
        cache.put(&b, model("h2")).await;
        cache.put(&other, model("h3")).await;

        cache.invalidate_entity("Invoice", 1).await;
        assert!(cache.get(&a).await.is_none());
        assert!(cache.get(&b).await.is_none());
        assert!(cache.get(&other).await.is_some());
    }

    struct FailingKv;

    #[async_trait]
    impl KvStore for FailingKv {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(anyhow!("connection refused"))
        }
        async fn setex(&self, _key: &str, _value: &str, _ttl: u64) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn del(&self, _key: &str) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn keys(&self, _prefix: &str) -> Result<Vec<String>> {
            Err(anyhow!("connection refused"))
        }
        async fn ping(&self) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn l2_failure_degrades_to_miss() {
        let cache = ModelCache::new(&CacheConfig::default(), Arc::new(FailingKv));
        let key = model_key("Invoice", 1, "none");
        assert!(cache.get(&key).await.is_none());
        // Put still lands in L1 even when L2 is down.
        cache.put(&key, model("h1")).await;
        assert!(cache.get(&key).await.is_some());
    }
}
