//! The durable audit pipeline: append-only outbox, batched drain worker,
//! dead-letter queue, and partition lifecycle management.

pub mod drain;
pub mod partitions;

pub use drain::{DrainStats, DrainWorker};
pub use partitions::{
    MemoryPartitionMaintenance, PartitionLifecycle, PartitionMaintenance, PartitionReport,
};

use crate::context::{now_ms, Timestamp};
use crate::txn::{rollback_or_warn, TxnHandle, TxnManager};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

// ─── Outbox rows ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Persisted,
    Failed,
    Dead,
}

/// One staged audit event. Enqueued through the caller's transaction
/// alongside the business change, so a committed change implies a durable
/// outbox row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: OutboxStatus,
    pub locked_by: Option<String>,
    pub locked_until: Option<Timestamp>,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
}

impl OutboxEntry {
    pub fn new(
        tenant_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            event_type: event_type.to_string(),
            payload,
            attempts: 0,
            max_attempts,
            status: OutboxStatus::Pending,
            locked_by: None,
            locked_until: None,
            last_error: None,
            created_at: now_ms(),
        }
    }
}

/// One row of the audit log proper. A fresh id is minted per persist attempt;
/// `(source_entry, attempt)` is the logical de-dup key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub source_entry: Uuid,
    pub attempt: u32,
    pub recorded_at: Timestamp,
}

// ─── Store traits ─────────────────────────────────────────────

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Stage a row on the caller's transaction; it becomes durable when the
    /// surrounding business transaction commits.
    async fn enqueue(&self, txn: &mut TxnHandle, entry: &OutboxEntry) -> Result<()>;

    /// Atomically select up to `batch` pending/failed rows whose lock has
    /// expired, stamping `locked_by`/`locked_until` on each.
    async fn pick(
        &self,
        batch: usize,
        lock_by: &str,
        lock_until: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<OutboxEntry>>;

    async fn mark_persisted(&self, ids: &[Uuid]) -> Result<()>;

    /// Record a failed attempt; returns the new attempt count.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<u32>;

    /// Terminal: the row moves to the DLQ for operator inspection.
    async fn mark_dead(&self, id: Uuid) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>>;
    async fn dlq_list(&self, tenant_id: Option<Uuid>) -> Result<Vec<OutboxEntry>>;
}

/// The audit log sink (partitioned table in production).
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn insert(&self, record: &AuditRecord) -> Result<()>;
}

// ─── Memory implementations ───────────────────────────────────

struct OutboxInner {
    rows: HashMap<Uuid, OutboxEntry>,
    dlq: Vec<OutboxEntry>,
}

pub struct MemoryOutboxStore {
    inner: Arc<RwLock<OutboxInner>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(OutboxInner {
                rows: HashMap::new(),
                dlq: Vec::new(),
            })),
        }
    }

    pub async fn status_of(&self, id: Uuid) -> Option<OutboxStatus> {
        self.inner.read().await.rows.get(&id).map(|e| e.status)
    }
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn enqueue(&self, txn: &mut TxnHandle, entry: &OutboxEntry) -> Result<()> {
        let txn = txn.memory()?;
        let id = entry.id;

        let mut w = self.inner.write().await;
        w.rows.insert(id, entry.clone());

        let inner = self.inner.clone();
        txn.push_undo(move || async move {
            let mut w = inner.write().await;
            w.rows.remove(&id);
        });
        Ok(())
    }

    async fn pick(
        &self,
        batch: usize,
        lock_by: &str,
        lock_until: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<OutboxEntry>> {
        let mut w = self.inner.write().await;
        let mut picked: Vec<Uuid> = w
            .rows
            .values()
            .filter(|e| {
                matches!(e.status, OutboxStatus::Pending | OutboxStatus::Failed)
                    && e.locked_until.is_none_or(|until| until <= now)
            })
            .map(|e| e.id)
            .collect();
        picked.sort();
        picked.truncate(batch);

        let mut out = Vec::with_capacity(picked.len());
        for id in picked {
            if let Some(entry) = w.rows.get_mut(&id) {
                entry.locked_by = Some(lock_by.to_string());
                entry.locked_until = Some(lock_until);
                out.push(entry.clone());
            }
        }
        Ok(out)
    }

    async fn mark_persisted(&self, ids: &[Uuid]) -> Result<()> {
        let mut w = self.inner.write().await;
        for id in ids {
            if let Some(entry) = w.rows.get_mut(id) {
                entry.status = OutboxStatus::Persisted;
                entry.locked_by = None;
                entry.locked_until = None;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<u32> {
        let mut w = self.inner.write().await;
        let entry = w
            .rows
            .get_mut(&id)
            .ok_or_else(|| anyhow!("outbox row not found: {id}"))?;
        entry.attempts += 1;
        entry.status = OutboxStatus::Failed;
        entry.last_error = Some(error.to_string());
        entry.locked_by = None;
        entry.locked_until = None;
        Ok(entry.attempts)
    }

    async fn mark_dead(&self, id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        let entry = w
            .rows
            .get_mut(&id)
            .ok_or_else(|| anyhow!("outbox row not found: {id}"))?;
        entry.status = OutboxStatus::Dead;
        let dead = entry.clone();
        w.dlq.push(dead);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
        let r = self.inner.read().await;
        Ok(r.rows.get(&id).cloned())
    }

    async fn dlq_list(&self, tenant_id: Option<Uuid>) -> Result<Vec<OutboxEntry>> {
        let r = self.inner.read().await;
        Ok(r.dlq
            .iter()
            .filter(|e| tenant_id.is_none_or(|t| e.tenant_id == t))
            .cloned()
            .collect())
    }
}

pub struct MemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn insert(&self, record: &AuditRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

// ─── Emitter facade ───────────────────────────────────────────

/// What the engines hold: stages an audit event alongside a business change.
/// `emit_in` joins the caller's transaction; `emit` opens a single-row
/// transaction for events with no surrounding business write.
pub struct AuditOutbox {
    store: Arc<dyn OutboxStore>,
    txn: Arc<dyn TxnManager>,
    max_attempts: u32,
}

impl AuditOutbox {
    pub fn new(store: Arc<dyn OutboxStore>, txn: Arc<dyn TxnManager>, max_attempts: u32) -> Self {
        Self {
            store,
            txn,
            max_attempts,
        }
    }

    /// Stage an event on the caller's transaction. Failures propagate: the
    /// outbox row shares the fate of the business write.
    pub async fn emit_in(
        &self,
        txn: &mut TxnHandle,
        tenant_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let entry = OutboxEntry::new(tenant_id, event_type, payload, self.max_attempts);
        let id = entry.id;
        self.store.enqueue(txn, &entry).await?;
        Ok(id)
    }

    /// Stage a standalone event in its own transaction.
    pub async fn emit(
        &self,
        tenant_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let mut txn = self.txn.begin().await?;
        let id = match self.emit_in(&mut txn, tenant_id, event_type, payload).await {
            Ok(id) => id,
            Err(e) => {
                rollback_or_warn(self.txn.as_ref(), txn).await;
                return Err(e);
            }
        };
        self.txn.commit(txn).await?;
        Ok(id)
    }

    pub fn store(&self) -> Arc<dyn OutboxStore> {
        self.store.clone()
    }
}
