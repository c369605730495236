use serde::{Deserialize, Serialize};

/// Platform configuration. Every knob has a serde default so a partial
/// document (or none at all) yields a working configuration.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PlatformConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub drain: DrainConfig,
    #[serde(default)]
    pub partitions: PartitionConfig,
    #[serde(default)]
    pub query: QueryLimits,
    #[serde(default)]
    pub workers: WorkerConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// L1 LRU capacity (entries).
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,
    /// L2 KV TTL in seconds.
    #[serde(default = "default_l2_ttl_secs")]
    pub l2_ttl_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DrainConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Row lease duration while a worker holds a batch.
    #[serde(default = "default_lock_secs")]
    pub lock_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Drain period in milliseconds.
    #[serde(default = "default_drain_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// How many months of partitions to pre-create ahead of now.
    #[serde(default = "default_precreate_months")]
    pub precreate_months: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryLimits {
    #[serde(default = "default_max_filters")]
    pub max_filters: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    #[serde(default = "default_max_sort_fields")]
    pub max_sort_fields: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Grace period for in-flight jobs on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_l1_capacity() -> usize {
    128
}
fn default_l2_ttl_secs() -> u64 {
    3600
}
fn default_batch_size() -> usize {
    50
}
fn default_lock_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    5
}
fn default_drain_interval_ms() -> u64 {
    5_000
}
fn default_precreate_months() -> u32 {
    3
}
fn default_retention_days() -> u32 {
    365
}
fn default_max_filters() -> usize {
    20
}
fn default_max_page_size() -> usize {
    200
}
fn default_max_sort_fields() -> usize {
    5
}
fn default_shutdown_grace_ms() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: default_l1_capacity(),
            l2_ttl_secs: default_l2_ttl_secs(),
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            lock_secs: default_lock_secs(),
            max_attempts: default_max_attempts(),
            interval_ms: default_drain_interval_ms(),
        }
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            precreate_months: default_precreate_months(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_filters: default_max_filters(),
            max_page_size: default_max_page_size(),
            max_sort_fields: default_max_sort_fields(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: PlatformConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.cache.l1_capacity, 128);
        assert_eq!(cfg.cache.l2_ttl_secs, 3600);
        assert_eq!(cfg.drain.max_attempts, 5);
        assert_eq!(cfg.query.max_page_size, 200);
    }

    #[test]
    fn partial_document_overrides_only_named_keys() {
        let cfg: PlatformConfig =
            serde_json::from_str(r#"{"drain": {"batch_size": 10}}"#).unwrap();
        assert_eq!(cfg.drain.batch_size, 10);
        assert_eq!(cfg.drain.lock_secs, 60);
    }
}
