use crate::approval::model::{
    ApprovalInstance, ApprovalStage, ApprovalTask, ApprovalTemplate, AssignmentSnapshot,
    InstanceStatus, StageOutcome, StageStatus, TaskStatus,
};
use crate::approval::store::ApprovalStore;
use crate::context::Timestamp;
use crate::postgres::{datetime_to_epoch_ms, epoch_ms_to_datetime, from_jsonb};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

/// PostgreSQL-backed `ApprovalStore`. The external↔DB status mapping
/// (rejected ⇄ canceled + reason) happens here, at the single boundary
/// defined by `InstanceStatus::{to_db, from_db}`.
pub struct PostgresApprovalStore {
    pool: sqlx::PgPool,
}

impl PostgresApprovalStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn stage_status_str(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Open => "open",
        StageStatus::Completed => "completed",
        StageStatus::Canceled => "canceled",
    }
}

fn stage_status_from(s: &str) -> Result<StageStatus> {
    Ok(match s {
        "open" => StageStatus::Open,
        "completed" => StageStatus::Completed,
        "canceled" => StageStatus::Canceled,
        other => return Err(anyhow!("unknown stage status {other}")),
    })
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Approved => "approved",
        TaskStatus::Rejected => "rejected",
        TaskStatus::Canceled => "canceled",
        TaskStatus::Expired => "expired",
    }
}

fn task_status_from(s: &str) -> Result<TaskStatus> {
    Ok(match s {
        "pending" => TaskStatus::Pending,
        "approved" => TaskStatus::Approved,
        "rejected" => TaskStatus::Rejected,
        "canceled" => TaskStatus::Canceled,
        "expired" => TaskStatus::Expired,
        other => return Err(anyhow!("unknown task status {other}")),
    })
}

fn row_to_instance(row: sqlx::postgres::PgRow) -> ApprovalInstance {
    let status: String = row.get("status");
    let context_reason: Option<String> = row.get("context_reason");
    let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
    ApprovalInstance {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        entity_name: row.get("entity_name"),
        entity_id: row.get("entity_id"),
        transition_id: row.get("transition_id"),
        operation_code: row.get("operation_code"),
        template_id: row.get("template_id"),
        status: InstanceStatus::from_db(&status, context_reason.as_deref()),
        context_reason,
        created_at: datetime_to_epoch_ms(created_at),
        created_by: row.get("created_by"),
    }
}

fn row_to_task(row: sqlx::postgres::PgRow) -> Result<ApprovalTask> {
    let status: String = row.get("status");
    let task_json: serde_json::Value = row.get("task_type");
    let decided_at: Option<chrono::DateTime<chrono::Utc>> = row.get("decided_at");
    let due_at: Option<chrono::DateTime<chrono::Utc>> = row.get("due_at");
    Ok(ApprovalTask {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        stage_id: row.get("stage_id"),
        assignee: row.get("assignee"),
        task_type: from_jsonb(task_json, "task type")?,
        status: task_status_from(&status)?,
        decided_at: decided_at.map(datetime_to_epoch_ms),
        decided_by: row.get("decided_by"),
        note: row.get("note"),
        due_at: due_at.map(datetime_to_epoch_ms),
    })
}

#[async_trait]
impl ApprovalStore for PostgresApprovalStore {
    // ── Templates ──

    async fn save_template(&self, template: &ApprovalTemplate) -> Result<()> {
        let compiled = serde_json::to_value(template)?;
        sqlx::query(
            r#"
            INSERT INTO meta.approval_template
                (id, code, version_no, is_active, compiled_json, compiled_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                is_active = EXCLUDED.is_active,
                compiled_json = EXCLUDED.compiled_json,
                compiled_hash = EXCLUDED.compiled_hash
            "#,
        )
        .bind(template.id)
        .bind(&template.code)
        .bind(template.version_no as i32)
        .bind(template.is_active)
        .bind(&compiled)
        .bind(&template.compiled_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_template(&self, id: Uuid) -> Result<Option<ApprovalTemplate>> {
        let row = sqlx::query("SELECT compiled_json FROM meta.approval_template WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let compiled: serde_json::Value = row.get("compiled_json");
                Ok(Some(from_jsonb(compiled, "approval template")?))
            }
        }
    }

    // ── Instance graph ──

    async fn create_instance_graph(
        &self,
        instance: &ApprovalInstance,
        stages: &[ApprovalStage],
        tasks: &[ApprovalTask],
        snapshots: &[AssignmentSnapshot],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let (status, reason) = instance.status.to_db();
        sqlx::query(
            r#"
            INSERT INTO wf.approval_instance
                (id, tenant_id, entity_name, entity_id, transition_id,
                 operation_code, template_id, status, context_reason,
                 created_at, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(instance.id)
        .bind(instance.tenant_id)
        .bind(&instance.entity_name)
        .bind(instance.entity_id)
        .bind(instance.transition_id)
        .bind(&instance.operation_code)
        .bind(instance.template_id)
        .bind(status)
        .bind(instance.context_reason.as_deref().or(reason))
        .bind(epoch_ms_to_datetime(instance.created_at))
        .bind(instance.created_by)
        .execute(&mut *tx)
        .await?;

        for stage in stages {
            let quorum = serde_json::to_value(stage.quorum)?;
            let mode = serde_json::to_value(stage.mode)?;
            let outcome = serde_json::to_value(stage.outcome)?;
            sqlx::query(
                r#"
                INSERT INTO wf.approval_stage
                    (id, instance_id, stage_no, mode, quorum, status, outcome)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(stage.id)
            .bind(stage.instance_id)
            .bind(stage.stage_no as i32)
            .bind(&mode)
            .bind(&quorum)
            .bind(stage_status_str(stage.status))
            .bind(&outcome)
            .execute(&mut *tx)
            .await?;
        }

        for task in tasks {
            let task_type = serde_json::to_value(task.task_type)?;
            sqlx::query(
                r#"
                INSERT INTO wf.approval_task
                    (id, instance_id, stage_id, assignee, task_type, status,
                     decided_at, decided_by, note, due_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(task.id)
            .bind(task.instance_id)
            .bind(task.stage_id)
            .bind(task.assignee)
            .bind(&task_type)
            .bind(task_status_str(task.status))
            .bind(task.decided_at.map(epoch_ms_to_datetime))
            .bind(task.decided_by)
            .bind(&task.note)
            .bind(task.due_at.map(epoch_ms_to_datetime))
            .execute(&mut *tx)
            .await?;
        }

        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO wf.assignment_snapshot
                    (id, task_id, rule_id, template_version, resolved)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(snapshot.id)
            .bind(snapshot.task_id)
            .bind(snapshot.rule_id)
            .bind(snapshot.template_version as i32)
            .bind(&snapshot.resolved)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("approval graph commit failed")?;
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<ApprovalInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, entity_name, entity_id, transition_id,
                   operation_code, template_id, status, context_reason,
                   created_at, created_by
            FROM wf.approval_instance
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_instance))
    }

    async fn latest_instance_for(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Option<ApprovalInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, entity_name, entity_id, transition_id,
                   operation_code, template_id, status, context_reason,
                   created_at, created_by
            FROM wf.approval_instance
            WHERE tenant_id = $1 AND entity_name = $2 AND entity_id = $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(entity_name)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_instance))
    }

    async fn update_instance_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        context_reason: Option<&str>,
    ) -> Result<()> {
        let (db_status, mapped_reason) = status.to_db();
        // Terminal instances are immutable: the guard is in the predicate.
        let result = sqlx::query(
            r#"
            UPDATE wf.approval_instance
            SET status = $1, context_reason = $2
            WHERE id = $3 AND status = 'open'
            "#,
        )
        .bind(db_status)
        .bind(context_reason.or(mapped_reason))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("approval instance {id} not found or terminal"));
        }
        Ok(())
    }

    // ── Stages ──

    async fn load_stages(&self, instance_id: Uuid) -> Result<Vec<ApprovalStage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, stage_no, mode, quorum, status, outcome
            FROM wf.approval_stage
            WHERE instance_id = $1
            ORDER BY stage_no
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        let mut stages = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            let mode_json: serde_json::Value = row.get("mode");
            let quorum_json: serde_json::Value = row.get("quorum");
            let outcome_json: serde_json::Value = row.get("outcome");
            let stage_no: i32 = row.get("stage_no");
            stages.push(ApprovalStage {
                id: row.get("id"),
                instance_id: row.get("instance_id"),
                stage_no: stage_no as u32,
                mode: from_jsonb(mode_json, "stage mode")?,
                quorum: from_jsonb(quorum_json, "stage quorum")?,
                status: stage_status_from(&status)?,
                outcome: from_jsonb::<Option<StageOutcome>>(outcome_json, "stage outcome")?,
            });
        }
        Ok(stages)
    }

    async fn update_stage(
        &self,
        id: Uuid,
        status: StageStatus,
        outcome: Option<StageOutcome>,
    ) -> Result<()> {
        let outcome_json = serde_json::to_value(outcome)?;
        sqlx::query("UPDATE wf.approval_stage SET status = $1, outcome = $2 WHERE id = $3")
            .bind(stage_status_str(status))
            .bind(&outcome_json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Tasks ──

    async fn load_task(&self, id: Uuid) -> Result<Option<ApprovalTask>> {
        let row = sqlx::query(
            r#"
            SELECT id, instance_id, stage_id, assignee, task_type, status,
                   decided_at, decided_by, note, due_at
            FROM wf.approval_task
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_task).transpose()
    }

    async fn load_tasks(&self, stage_id: Uuid) -> Result<Vec<ApprovalTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, stage_id, assignee, task_type, status,
                   decided_at, decided_by, note, due_at
            FROM wf.approval_task
            WHERE stage_id = $1
            ORDER BY id
            "#,
        )
        .bind(stage_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    async fn load_tasks_for_instance(&self, instance_id: Uuid) -> Result<Vec<ApprovalTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, stage_id, assignee, task_type, status,
                   decided_at, decided_by, note, due_at
            FROM wf.approval_task
            WHERE instance_id = $1
            ORDER BY id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    async fn decide_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        decided_by: Uuid,
        decided_at: Timestamp,
        note: Option<&str>,
    ) -> Result<bool> {
        // pending → decided is the CAS fence against late decisions.
        let result = sqlx::query(
            r#"
            UPDATE wf.approval_task
            SET status = $1, decided_by = $2, decided_at = $3, note = $4
            WHERE id = $5 AND status = 'pending'
            "#,
        )
        .bind(task_status_str(status))
        .bind(decided_by)
        .bind(epoch_ms_to_datetime(decided_at))
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn overdue_tasks(&self, now: Timestamp) -> Result<Vec<ApprovalTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, stage_id, assignee, task_type, status,
                   decided_at, decided_by, note, due_at
            FROM wf.approval_task
            WHERE status = 'pending' AND due_at IS NOT NULL AND due_at <= $1
            "#,
        )
        .bind(epoch_ms_to_datetime(now))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task).collect()
    }
}
