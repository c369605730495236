use crate::audit::{AuditRecord, AuditSink, OutboxStore};
use crate::config::DrainConfig;
use crate::context::now_ms;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Counters from one drain pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub picked: usize,
    pub persisted: usize,
    pub failed: usize,
    pub dead: usize,
}

/// The batched outbox drainer. One instance per worker task; `lock_by`
/// identifies the worker on leased rows.
pub struct DrainWorker {
    store: Arc<dyn OutboxStore>,
    sink: Arc<dyn AuditSink>,
    config: DrainConfig,
    lock_by: String,
}

impl DrainWorker {
    pub fn new(store: Arc<dyn OutboxStore>, sink: Arc<dyn AuditSink>, config: DrainConfig) -> Self {
        Self {
            store,
            sink,
            config,
            lock_by: format!("drain-{}", Uuid::now_v7()),
        }
    }

    /// One pass:
    /// 1. Lease a batch of pending/failed rows.
    /// 2. Insert each into the audit log under a fresh row id.
    /// 3. Mark successes persisted; count failures against the row.
    /// 4. Rows at their attempt ceiling move to the DLQ.
    /// 5. A batch where every row failed is a worker-level error so the job
    ///    queue records the run as failed.
    pub async fn drain_once(&self) -> Result<DrainStats> {
        let now = now_ms();
        let lock_until = now + (self.config.lock_secs as i64) * 1000;
        let batch = self
            .store
            .pick(self.config.batch_size, &self.lock_by, lock_until, now)
            .await?;

        let mut stats = DrainStats {
            picked: batch.len(),
            ..DrainStats::default()
        };
        if batch.is_empty() {
            return Ok(stats);
        }

        let mut persisted_ids = Vec::new();
        for entry in &batch {
            let record = AuditRecord {
                id: Uuid::now_v7(),
                tenant_id: entry.tenant_id,
                event_type: entry.event_type.clone(),
                payload: entry.payload.clone(),
                source_entry: entry.id,
                attempt: entry.attempts + 1,
                recorded_at: now_ms(),
            };
            match self.sink.insert(&record).await {
                Ok(()) => persisted_ids.push(entry.id),
                Err(e) => {
                    stats.failed += 1;
                    let attempts = self.store.mark_failed(entry.id, &e.to_string()).await?;
                    tracing::warn!(entry = %entry.id, attempts, error = %e, "audit persist failed");
                    if attempts >= entry.max_attempts {
                        self.store.mark_dead(entry.id).await?;
                        stats.dead += 1;
                        tracing::error!(entry = %entry.id, "outbox row exhausted; moved to DLQ");
                    }
                }
            }
        }

        if !persisted_ids.is_empty() {
            self.store.mark_persisted(&persisted_ids).await?;
            stats.persisted = persisted_ids.len();
        }

        if stats.persisted == 0 && stats.failed > 0 {
            return Err(anyhow!(
                "drain batch failed entirely: {} rows",
                stats.failed
            ));
        }
        Ok(stats)
    }

    /// Periodic loop. Honors graceful shutdown: stops picking new batches
    /// when the signal flips, finishing the in-flight pass first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(self.config.interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.drain_once().await {
                        Ok(stats) if stats.picked > 0 => {
                            tracing::debug!(?stats, "drain pass complete");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "drain pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("drain worker shutting down");
                        return;
                    }
                }
            }
        }
    }
}
