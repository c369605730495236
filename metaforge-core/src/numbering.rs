use crate::context::RequestContext;
use crate::error::PlatformResult;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A per-tenant, per-entity numbering sequence. The pattern may use
/// `{SEQ}`, `{YYYY}`, and `{MM}`; without a pattern the rendered number is
/// `<prefix><zero-padded counter>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NumberingSequence {
    pub tenant_id: Uuid,
    pub entity_name: String,
    pub prefix: String,
    pub padding: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub counter: u64,
}

/// Sequence persistence with an atomic take-next.
#[async_trait]
pub trait NumberingStore: Send + Sync {
    async fn save_sequence(&self, sequence: &NumberingSequence) -> Result<()>;
    /// Increment and return the next counter value, with the sequence
    /// definition. `None` when no sequence is configured.
    async fn take_next(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
    ) -> Result<Option<(NumberingSequence, u64)>>;
}

pub struct MemoryNumberingStore {
    inner: RwLock<HashMap<(Uuid, String), NumberingSequence>>,
}

impl MemoryNumberingStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryNumberingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NumberingStore for MemoryNumberingStore {
    async fn save_sequence(&self, sequence: &NumberingSequence) -> Result<()> {
        let mut w = self.inner.write().await;
        w.insert(
            (sequence.tenant_id, sequence.entity_name.clone()),
            sequence.clone(),
        );
        Ok(())
    }

    async fn take_next(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
    ) -> Result<Option<(NumberingSequence, u64)>> {
        let mut w = self.inner.write().await;
        match w.get_mut(&(tenant_id, entity_name.to_string())) {
            Some(sequence) => {
                sequence.counter += 1;
                Ok(Some((sequence.clone(), sequence.counter)))
            }
            None => Ok(None),
        }
    }
}

/// Renders human-readable record numbers from configured sequences.
pub struct NumberingService {
    store: std::sync::Arc<dyn NumberingStore>,
}

impl NumberingService {
    pub fn new(store: std::sync::Arc<dyn NumberingStore>) -> Self {
        Self { store }
    }

    /// Next rendered number for an entity, or `None` when the tenant has no
    /// sequence configured for it.
    pub async fn next(
        &self,
        entity_name: &str,
        ctx: &RequestContext,
        now_ms: i64,
    ) -> PlatformResult<Option<String>> {
        let Some((sequence, value)) = self
            .store
            .take_next(ctx.tenant_id, entity_name)
            .await?
        else {
            return Ok(None);
        };

        let now = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let seq = format!("{value:0width$}", width = sequence.padding as usize);

        let rendered = match &sequence.pattern {
            Some(pattern) => pattern
                .replace("{SEQ}", &seq)
                .replace("{YYYY}", &format!("{:04}", now.year()))
                .replace("{MM}", &format!("{:02}", now.month())),
            None => format!("{}{}", sequence.prefix, seq),
        };
        Ok(Some(rendered))
    }
}
