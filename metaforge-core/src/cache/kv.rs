use crate::context::{now_ms, Timestamp};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// The shared KV capability: string keys, string values, TTL on write.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn setex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn keys(&self, pattern_prefix: &str) -> Result<Vec<String>>;
    async fn ping(&self) -> Result<()>;
}

struct Entry {
    value: String,
    expires_at: Timestamp,
}

/// In-memory KV with TTL for tests and single-process deployments.
/// Expired entries are dropped lazily on read.
pub struct MemoryKv {
    inner: RwLock<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = now_ms();
        let mut w = self.inner.write().await;
        match w.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                w.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn setex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut w = self.inner.write().await;
        w.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now_ms() + (ttl_secs as i64) * 1000,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern_prefix: &str) -> Result<Vec<String>> {
        let r = self.inner.read().await;
        Ok(r.keys()
            .filter(|k| k.starts_with(pattern_prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setex_get_del_round_trip() {
        let kv = MemoryKv::new();
        kv.setex("a", "1", 60).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
        kv.del("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let kv = MemoryKv::new();
        kv.setex("a", "1", 0).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_filters_by_prefix() {
        let kv = MemoryKv::new();
        kv.setex("model:Invoice:1", "x", 60).await.unwrap();
        kv.setex("model:Order:1", "y", 60).await.unwrap();
        kv.setex("rules:Invoice:1", "z", 60).await.unwrap();
        let keys = kv.keys("model:").await.unwrap();
        assert_eq!(keys.len(), 2);
    }
}
