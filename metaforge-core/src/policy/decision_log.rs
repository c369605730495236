use crate::context::Timestamp;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One row of the permission decision log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub tenant_id: Uuid,
    pub occurred_at: Timestamp,
    pub actor: Uuid,
    pub resource: String,
    pub operation: String,
    /// "allow" or "deny".
    pub effect: String,
    pub matched_rule_id: Option<String>,
    pub reason: String,
    pub correlation_id: String,
}

/// Append-only sink for authorization decisions. Writes are best-effort:
/// a failed append must never flip a decision.
#[async_trait]
pub trait DecisionLog: Send + Sync {
    async fn append(&self, entry: DecisionLogEntry) -> Result<()>;
}

pub struct MemoryDecisionLog {
    entries: RwLock<Vec<DecisionLogEntry>>,
}

impl MemoryDecisionLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub async fn entries(&self) -> Vec<DecisionLogEntry> {
        self.entries.read().await.clone()
    }
}

impl Default for MemoryDecisionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecisionLog for MemoryDecisionLog {
    async fn append(&self, entry: DecisionLogEntry) -> Result<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }
}
