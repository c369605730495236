use crate::context::Timestamp;
use crate::postgres::{datetime_to_epoch_ms, epoch_ms_to_datetime, from_jsonb};
use crate::timer::{TimerPolicy, TimerSchedule, TimerStatus, TimerStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

/// PostgreSQL-backed `TimerStore`. Policies live in
/// `meta.lifecycle_timer_policy`, schedules in `core.lifecycle_timer_schedule`
/// with the frozen policy snapshot as JSONB.
pub struct PostgresTimerStore {
    pool: sqlx::PgPool,
}

impl PostgresTimerStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn status_str(status: TimerStatus) -> &'static str {
    match status {
        TimerStatus::Scheduled => "scheduled",
        TimerStatus::Fired => "fired",
        TimerStatus::Canceled => "canceled",
    }
}

fn status_from(s: &str) -> Result<TimerStatus> {
    Ok(match s {
        "scheduled" => TimerStatus::Scheduled,
        "fired" => TimerStatus::Fired,
        "canceled" => TimerStatus::Canceled,
        other => return Err(anyhow!("unknown timer status {other}")),
    })
}

fn row_to_schedule(row: sqlx::postgres::PgRow) -> Result<TimerSchedule> {
    let status: String = row.get("status");
    let snapshot: serde_json::Value = row.get("policy_snapshot");
    let timer_type: serde_json::Value = row.get("timer_type");
    let fire_at: chrono::DateTime<chrono::Utc> = row.get("fire_at");
    Ok(TimerSchedule {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        entity_name: row.get("entity_name"),
        entity_id: row.get("entity_id"),
        instance_id: row.get("instance_id"),
        timer_type: from_jsonb(timer_type, "timer type")?,
        fire_at: datetime_to_epoch_ms(fire_at),
        job_id: row.get("job_id"),
        policy_snapshot: from_jsonb(snapshot, "timer policy snapshot")?,
        status: status_from(&status)?,
    })
}

const SELECT_SCHEDULE: &str = r#"
    SELECT id, tenant_id, entity_name, entity_id, instance_id, timer_type,
           fire_at, job_id, policy_snapshot, status
    FROM core.lifecycle_timer_schedule
"#;

#[async_trait]
impl TimerStore for PostgresTimerStore {
    async fn save_policy(&self, policy: &TimerPolicy) -> Result<()> {
        let body = serde_json::to_value(policy)?;
        sqlx::query(
            r#"
            INSERT INTO meta.lifecycle_timer_policy (id, code, is_active, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                code = EXCLUDED.code,
                is_active = EXCLUDED.is_active,
                body = EXCLUDED.body
            "#,
        )
        .bind(policy.id)
        .bind(&policy.code)
        .bind(policy.is_active)
        .bind(&body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_policy(&self, id: Uuid) -> Result<Option<TimerPolicy>> {
        let row = sqlx::query("SELECT body FROM meta.lifecycle_timer_policy WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let body: serde_json::Value = row.get("body");
                Ok(Some(from_jsonb(body, "timer policy")?))
            }
        }
    }

    async fn save_schedule(&self, schedule: &TimerSchedule) -> Result<()> {
        let snapshot = serde_json::to_value(&schedule.policy_snapshot)?;
        let timer_type = serde_json::to_value(schedule.timer_type)?;
        sqlx::query(
            r#"
            INSERT INTO core.lifecycle_timer_schedule
                (id, tenant_id, entity_name, entity_id, instance_id, timer_type,
                 fire_at, job_id, policy_snapshot, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.tenant_id)
        .bind(&schedule.entity_name)
        .bind(schedule.entity_id)
        .bind(schedule.instance_id)
        .bind(&timer_type)
        .bind(epoch_ms_to_datetime(schedule.fire_at))
        .bind(&schedule.job_id)
        .bind(&snapshot)
        .bind(status_str(schedule.status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_schedule(&self, id: Uuid) -> Result<Option<TimerSchedule>> {
        let row = sqlx::query(&format!("{SELECT_SCHEDULE} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_schedule).transpose()
    }

    async fn set_job_id(&self, id: Uuid, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE core.lifecycle_timer_schedule SET job_id = $1 WHERE id = $2")
            .bind(job_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_fired(&self, id: Uuid) -> Result<bool> {
        // scheduled → fired is the single-fire fence.
        let result = sqlx::query(
            "UPDATE core.lifecycle_timer_schedule SET status = 'fired' \
             WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_canceled(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE core.lifecycle_timer_schedule SET status = 'canceled' \
             WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn scheduled_for_entity(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Vec<TimerSchedule>> {
        let rows = sqlx::query(&format!(
            "{SELECT_SCHEDULE} WHERE status = 'scheduled' AND tenant_id = $1 \
             AND entity_name = $2 AND entity_id = $3"
        ))
        .bind(tenant_id)
        .bind(entity_name)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_schedule).collect()
    }

    async fn scheduled_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<TimerSchedule>> {
        let rows = sqlx::query(&format!(
            "{SELECT_SCHEDULE} WHERE status = 'scheduled' AND tenant_id = $1"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_schedule).collect()
    }
}
