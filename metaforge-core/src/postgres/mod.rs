//! PostgreSQL-backed stores behind the `postgres` feature. Schema layout:
//! `meta.*` for definitions, `core.*` for instances and timers, `wf.*` for
//! approval graphs, `audit.*` for the outbox, log, and DLQ.

pub mod approval;
pub mod audit;
pub mod lifecycle;
pub mod records;
pub mod registry;
pub mod timer;

pub use approval::PostgresApprovalStore;
pub use audit::{PostgresAuditSink, PostgresOutboxStore, PostgresPartitionMaintenance};
pub use lifecycle::PostgresLifecycleStore;
pub use records::PostgresRecordStore;
pub use registry::{PostgresOverlayStore, PostgresSchemaRegistry};
pub use timer::PostgresTimerStore;

use crate::txn::{TxnHandle, TxnManager};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::TimeZone;

/// Transaction manager over a connection pool: one `pool.begin()` per unit
/// of work, committed or rolled back as a whole.
pub struct PostgresTxnManager {
    pool: sqlx::PgPool,
}

impl PostgresTxnManager {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TxnManager for PostgresTxnManager {
    async fn begin(&self) -> Result<TxnHandle> {
        Ok(TxnHandle::Postgres(self.pool.begin().await?))
    }

    async fn commit(&self, txn: TxnHandle) -> Result<()> {
        match txn {
            TxnHandle::Postgres(tx) => {
                tx.commit().await?;
                Ok(())
            }
            TxnHandle::Memory(_) => {
                Err(anyhow!("memory transaction passed to the postgres manager"))
            }
        }
    }

    async fn rollback(&self, txn: TxnHandle) -> Result<()> {
        match txn {
            TxnHandle::Postgres(tx) => {
                tx.rollback().await?;
                Ok(())
            }
            TxnHandle::Memory(_) => {
                Err(anyhow!("memory transaction passed to the postgres manager"))
            }
        }
    }
}

/// Epoch-ms → TIMESTAMPTZ bind value.
pub(crate) fn epoch_ms_to_datetime(epoch_ms: i64) -> chrono::DateTime<chrono::Utc> {
    let secs = epoch_ms.div_euclid(1000);
    let nanos = (epoch_ms.rem_euclid(1000) * 1_000_000) as u32;
    chrono::Utc
        .timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(chrono::Utc::now)
}

/// TIMESTAMPTZ column → epoch ms.
pub(crate) fn datetime_to_epoch_ms(dt: chrono::DateTime<chrono::Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Deserialize a JSONB column into a typed value with a uniform error.
pub(crate) fn from_jsonb<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    what: &str,
) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| anyhow::anyhow!("failed to deserialize {what}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_round_trip() {
        for ms in [0i64, 1_700_000_000_123, -1000] {
            assert_eq!(datetime_to_epoch_ms(epoch_ms_to_datetime(ms)), ms);
        }
    }
}
