use crate::audit::partitions::{partition_name, PartitionMaintenance};
use crate::audit::{AuditRecord, AuditSink, OutboxEntry, OutboxStatus, OutboxStore};
use crate::context::Timestamp;
use crate::postgres::{datetime_to_epoch_ms, epoch_ms_to_datetime};
use crate::txn::TxnHandle;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

/// PostgreSQL-backed `OutboxStore` over `audit.audit_outbox` / `audit.audit_dlq`.
pub struct PostgresOutboxStore {
    pool: sqlx::PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn status_str(status: OutboxStatus) -> &'static str {
    match status {
        OutboxStatus::Pending => "pending",
        OutboxStatus::Persisted => "persisted",
        OutboxStatus::Failed => "failed",
        OutboxStatus::Dead => "dead",
    }
}

fn status_from(s: &str) -> Result<OutboxStatus> {
    Ok(match s {
        "pending" => OutboxStatus::Pending,
        "persisted" => OutboxStatus::Persisted,
        "failed" => OutboxStatus::Failed,
        "dead" => OutboxStatus::Dead,
        other => return Err(anyhow!("unknown outbox status {other}")),
    })
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> Result<OutboxEntry> {
    let status: String = row.get("status");
    let attempts: i32 = row.get("attempts");
    let max_attempts: i32 = row.get("max_attempts");
    let locked_until: Option<chrono::DateTime<chrono::Utc>> = row.get("locked_until");
    let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
    Ok(OutboxEntry {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        status: status_from(&status)?,
        locked_by: row.get("locked_by"),
        locked_until: locked_until.map(datetime_to_epoch_ms),
        last_error: row.get("last_error"),
        created_at: datetime_to_epoch_ms(created_at),
    })
}

const SELECT_ENTRY: &str = r#"
    SELECT id, tenant_id, event_type, payload, attempts, max_attempts, status,
           locked_by, locked_until, last_error, created_at
"#;

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(&self, txn: &mut TxnHandle, entry: &OutboxEntry) -> Result<()> {
        let tx = txn.postgres()?;
        sqlx::query(
            r#"
            INSERT INTO audit.audit_outbox
                (id, tenant_id, event_type, payload, attempts, max_attempts,
                 status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(entry.attempts as i32)
        .bind(entry.max_attempts as i32)
        .bind(status_str(entry.status))
        .bind(epoch_ms_to_datetime(entry.created_at))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn pick(
        &self,
        batch: usize,
        lock_by: &str,
        lock_until: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<OutboxEntry>> {
        // One atomic lease: SKIP LOCKED keeps concurrent drainers apart.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE audit.audit_outbox SET locked_by = $1, locked_until = $2
            WHERE id IN (
                SELECT id FROM audit.audit_outbox
                WHERE status IN ('pending', 'failed')
                  AND (locked_until IS NULL OR locked_until <= $3)
                ORDER BY created_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {SELECT_ENTRY_COLUMNS}
            "#,
            SELECT_ENTRY_COLUMNS = "id, tenant_id, event_type, payload, attempts, \
                max_attempts, status, locked_by, locked_until, last_error, created_at"
        ))
        .bind(lock_by)
        .bind(epoch_ms_to_datetime(lock_until))
        .bind(epoch_ms_to_datetime(now))
        .bind(batch as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_entry).collect()
    }

    async fn mark_persisted(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query(
            "UPDATE audit.audit_outbox \
             SET status = 'persisted', locked_by = NULL, locked_until = NULL \
             WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<u32> {
        let row = sqlx::query(
            r#"
            UPDATE audit.audit_outbox
            SET status = 'failed', attempts = attempts + 1, last_error = $1,
                locked_by = NULL, locked_until = NULL
            WHERE id = $2
            RETURNING attempts
            "#,
        )
        .bind(error)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("outbox row not found: {id}"))?;
        let attempts: i32 = row.get("attempts");
        Ok(attempts as u32)
    }

    async fn mark_dead(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE audit.audit_outbox SET status = 'dead' WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(anyhow!("outbox row not found: {id}"));
        }
        sqlx::query(
            r#"
            INSERT INTO audit.audit_dlq
                (id, tenant_id, event_type, payload, attempts, last_error, dead_at)
            SELECT id, tenant_id, event_type, payload, attempts, last_error, now()
            FROM audit.audit_outbox
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
        let row = sqlx::query(&format!("{SELECT_ENTRY} FROM audit.audit_outbox WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_entry).transpose()
    }

    async fn dlq_list(&self, tenant_id: Option<Uuid>) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.tenant_id, d.event_type, d.payload, d.attempts,
                   o.max_attempts, d.last_error, d.dead_at
            FROM audit.audit_dlq d
            JOIN audit.audit_outbox o ON o.id = d.id
            WHERE $1::uuid IS NULL OR d.tenant_id = $1
            ORDER BY d.dead_at
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let attempts: i32 = row.get("attempts");
                let max_attempts: i32 = row.get("max_attempts");
                let dead_at: chrono::DateTime<chrono::Utc> = row.get("dead_at");
                Ok(OutboxEntry {
                    id: row.get("id"),
                    tenant_id: row.get("tenant_id"),
                    event_type: row.get("event_type"),
                    payload: row.get("payload"),
                    attempts: attempts as u32,
                    max_attempts: max_attempts as u32,
                    status: OutboxStatus::Dead,
                    locked_by: None,
                    locked_until: None,
                    last_error: row.get("last_error"),
                    created_at: datetime_to_epoch_ms(dead_at),
                })
            })
            .collect()
    }
}

/// Inserts audit rows into the month-partitioned `audit.audit_log`.
pub struct PostgresAuditSink {
    pool: sqlx::PgPool,
}

impl PostgresAuditSink {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PostgresAuditSink {
    async fn insert(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit.audit_log
                (id, tenant_id, event_type, payload, source_entry, attempt, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.source_entry)
        .bind(record.attempt as i32)
        .bind(epoch_ms_to_datetime(record.recorded_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Partition maintenance delegating to the SQL helper functions.
pub struct PostgresPartitionMaintenance {
    pool: sqlx::PgPool,
    /// Index names every partition is expected to carry.
    expected_indexes: Vec<String>,
}

impl PostgresPartitionMaintenance {
    pub fn new(pool: sqlx::PgPool, expected_indexes: Vec<String>) -> Self {
        Self {
            pool,
            expected_indexes,
        }
    }
}

#[async_trait]
impl PartitionMaintenance for PostgresPartitionMaintenance {
    async fn create_partition_for_month(&self, year: i32, month: u32) -> Result<bool> {
        let date = chrono::NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| anyhow!("invalid month {year}-{month}"))?;
        let row = sqlx::query("SELECT core.create_audit_partition_for_month($1) AS created")
            .bind(date)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("created"))
    }

    async fn drop_partition(&self, year: i32, month: u32) -> Result<bool> {
        let row = sqlx::query("SELECT core.drop_audit_partition($1, $2) AS dropped")
            .bind(year)
            .bind(month as i32)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("dropped"))
    }

    async fn check_partition_indexes(&self, partition: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT core.check_audit_partition_indexes($1) AS index_name")
            .bind(partition)
            .fetch_all(&self.pool)
            .await?;
        let present: Vec<String> = rows
            .into_iter()
            .filter_map(|row| row.try_get("index_name").ok())
            .collect();
        Ok(self
            .expected_indexes
            .iter()
            .filter(|name| !present.contains(name))
            .cloned()
            .collect())
    }

    async fn list_partitions(&self) -> Result<Vec<(i32, u32)>> {
        let rows = sqlx::query(
            r#"
            SELECT c.relname AS name
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = 'audit' AND c.relname LIKE 'workflow_event_log_%'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut partitions = Vec::new();
        for row in rows {
            let name: String = row.get("name");
            if let Some((year, month)) = parse_partition_name(&name) {
                partitions.push((year, month));
            }
        }
        Ok(partitions)
    }

    async fn vacuum_analyze(&self) -> Result<()> {
        sqlx::query("VACUUM ANALYZE audit.audit_log")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_partition_name(name: &str) -> Option<(i32, u32)> {
    let suffix = name.strip_prefix("workflow_event_log_")?;
    let (year, month) = suffix.split_once('_')?;
    let parsed = (year.parse().ok()?, month.parse().ok()?);
    // Round-trip through the canonical formatter to reject oddities.
    (partition_name(parsed.0, parsed.1) == name).then_some(parsed)
}
