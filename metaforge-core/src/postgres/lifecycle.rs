use crate::context::Timestamp;
use crate::lifecycle::model::{
    CompiledRoute, Lifecycle, LifecycleEvent, LifecycleInstance, LifecycleState,
    LifecycleTransition, RoutingRule,
};
use crate::lifecycle::store::LifecycleStore;
use crate::postgres::{datetime_to_epoch_ms, epoch_ms_to_datetime, from_jsonb};
use crate::txn::TxnHandle;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

/// PostgreSQL-backed `LifecycleStore`.
pub struct PostgresLifecycleStore {
    pool: sqlx::PgPool,
}

impl PostgresLifecycleStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LifecycleStore for PostgresLifecycleStore {
    // ── Definitions ──

    async fn save_lifecycle(&self, lifecycle: &Lifecycle) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO meta.lifecycle (id, code, version_no, is_active)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                code = EXCLUDED.code,
                version_no = EXCLUDED.version_no,
                is_active = EXCLUDED.is_active
            "#,
        )
        .bind(lifecycle.id)
        .bind(&lifecycle.code)
        .bind(lifecycle.version_no as i32)
        .bind(lifecycle.is_active)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM meta.lifecycle_state WHERE lifecycle_id = $1")
            .bind(lifecycle.id)
            .execute(&mut *tx)
            .await?;
        for state in &lifecycle.states {
            sqlx::query(
                r#"
                INSERT INTO meta.lifecycle_state (id, lifecycle_id, code, is_terminal, sort_order)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(state.id)
            .bind(lifecycle.id)
            .bind(&state.code)
            .bind(state.is_terminal)
            .bind(state.sort_order)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM meta.lifecycle_transition WHERE lifecycle_id = $1")
            .bind(lifecycle.id)
            .execute(&mut *tx)
            .await?;
        for transition in &lifecycle.transitions {
            let gates = serde_json::to_value(&transition.gates)?;
            sqlx::query(
                r#"
                INSERT INTO meta.lifecycle_transition
                    (id, lifecycle_id, from_state, to_state, operation_code, is_active, gates)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(transition.id)
            .bind(lifecycle.id)
            .bind(transition.from_state)
            .bind(transition.to_state)
            .bind(&transition.operation_code)
            .bind(transition.is_active)
            .bind(&gates)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("lifecycle save commit failed")?;
        Ok(())
    }

    async fn load_lifecycle(&self, id: Uuid) -> Result<Option<Lifecycle>> {
        let header = sqlx::query(
            "SELECT id, code, version_no, is_active FROM meta.lifecycle WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(header) = header else {
            return Ok(None);
        };

        let state_rows = sqlx::query(
            r#"
            SELECT id, code, is_terminal, sort_order
            FROM meta.lifecycle_state
            WHERE lifecycle_id = $1
            ORDER BY sort_order
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let states = state_rows
            .into_iter()
            .map(|row| LifecycleState {
                id: row.get("id"),
                code: row.get("code"),
                is_terminal: row.get("is_terminal"),
                sort_order: row.get("sort_order"),
            })
            .collect();

        let transition_rows = sqlx::query(
            r#"
            SELECT id, from_state, to_state, operation_code, is_active, gates
            FROM meta.lifecycle_transition
            WHERE lifecycle_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let mut transitions = Vec::with_capacity(transition_rows.len());
        for row in transition_rows {
            let gates_json: serde_json::Value = row.get("gates");
            transitions.push(LifecycleTransition {
                id: row.get("id"),
                from_state: row.get("from_state"),
                to_state: row.get("to_state"),
                operation_code: row.get("operation_code"),
                is_active: row.get("is_active"),
                gates: from_jsonb(gates_json, "transition gates")?,
            });
        }

        let version_no: i32 = header.get("version_no");
        Ok(Some(Lifecycle {
            id: header.get("id"),
            code: header.get("code"),
            version_no: version_no as u32,
            is_active: header.get("is_active"),
            states,
            transitions,
        }))
    }

    // ── Routing ──

    async fn save_routing_rules(&self, entity_name: &str, rules: &[RoutingRule]) -> Result<()> {
        let rules_json = serde_json::to_value(rules)?;
        sqlx::query(
            r#"
            INSERT INTO meta.entity_lifecycle (entity_name, rules)
            VALUES ($1, $2)
            ON CONFLICT (entity_name) DO UPDATE SET rules = EXCLUDED.rules
            "#,
        )
        .bind(entity_name)
        .bind(&rules_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_routing_rules(&self, entity_name: &str) -> Result<Vec<RoutingRule>> {
        let row = sqlx::query("SELECT rules FROM meta.entity_lifecycle WHERE entity_name = $1")
            .bind(entity_name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(Vec::new()),
            Some(row) => {
                let rules_json: serde_json::Value = row.get("rules");
                from_jsonb(rules_json, "routing rules")
            }
        }
    }

    async fn save_compiled_route(&self, route: &CompiledRoute) -> Result<()> {
        let rules_json = serde_json::to_value(&route.rules)?;
        sqlx::query(
            r#"
            INSERT INTO meta.entity_lifecycle_route_compiled
                (entity_name, rules, compiled_hash, compiled_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entity_name) DO UPDATE SET
                rules = EXCLUDED.rules,
                compiled_hash = EXCLUDED.compiled_hash,
                compiled_at = EXCLUDED.compiled_at
            "#,
        )
        .bind(&route.entity_name)
        .bind(&rules_json)
        .bind(&route.compiled_hash)
        .bind(epoch_ms_to_datetime(route.compiled_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_compiled_route(&self, entity_name: &str) -> Result<Option<CompiledRoute>> {
        let row = sqlx::query(
            r#"
            SELECT entity_name, rules, compiled_hash, compiled_at
            FROM meta.entity_lifecycle_route_compiled
            WHERE entity_name = $1
            "#,
        )
        .bind(entity_name)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let rules_json: serde_json::Value = row.get("rules");
                let compiled_at: chrono::DateTime<chrono::Utc> = row.get("compiled_at");
                Ok(Some(CompiledRoute {
                    entity_name: row.get("entity_name"),
                    rules: from_jsonb(rules_json, "compiled route rules")?,
                    compiled_hash: row.get("compiled_hash"),
                    compiled_at: datetime_to_epoch_ms(compiled_at),
                }))
            }
        }
    }

    // ── Instances ──

    async fn upsert_instance(
        &self,
        txn: &mut TxnHandle,
        instance: &LifecycleInstance,
    ) -> Result<()> {
        let tx = txn.postgres()?;
        sqlx::query(
            r#"
            INSERT INTO core.entity_lifecycle_instance
                (id, tenant_id, entity_name, entity_id, lifecycle_id, state_id,
                 updated_at, updated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, entity_name, entity_id) DO UPDATE SET
                lifecycle_id = EXCLUDED.lifecycle_id,
                state_id = EXCLUDED.state_id,
                updated_at = EXCLUDED.updated_at,
                updated_by = EXCLUDED.updated_by
            "#,
        )
        .bind(instance.id)
        .bind(instance.tenant_id)
        .bind(&instance.entity_name)
        .bind(instance.entity_id)
        .bind(instance.lifecycle_id)
        .bind(instance.state_id)
        .bind(epoch_ms_to_datetime(instance.updated_at))
        .bind(instance.updated_by)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn load_instance(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Option<LifecycleInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, entity_name, entity_id, lifecycle_id, state_id,
                   updated_at, updated_by
            FROM core.entity_lifecycle_instance
            WHERE tenant_id = $1 AND entity_name = $2 AND entity_id = $3
            "#,
        )
        .bind(tenant_id)
        .bind(entity_name)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            let updated_at: chrono::DateTime<chrono::Utc> = row.get("updated_at");
            LifecycleInstance {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                entity_name: row.get("entity_name"),
                entity_id: row.get("entity_id"),
                lifecycle_id: row.get("lifecycle_id"),
                state_id: row.get("state_id"),
                updated_at: datetime_to_epoch_ms(updated_at),
                updated_by: row.get("updated_by"),
            }
        }))
    }

    async fn transition_instance(
        &self,
        txn: &mut TxnHandle,
        instance_id: Uuid,
        expected_state: Uuid,
        new_state: Uuid,
        updated_by: Uuid,
        updated_at: Timestamp,
    ) -> Result<bool> {
        // The optimistic-lock check on (id, state_id) serializes transitions
        // within one instance.
        let tx = txn.postgres()?;
        let result = sqlx::query(
            r#"
            UPDATE core.entity_lifecycle_instance
            SET state_id = $1, updated_by = $2, updated_at = $3
            WHERE id = $4 AND state_id = $5
            "#,
        )
        .bind(new_state)
        .bind(updated_by)
        .bind(epoch_ms_to_datetime(updated_at))
        .bind(instance_id)
        .bind(expected_state)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ── Events ──

    async fn append_event(&self, txn: &mut TxnHandle, event: &LifecycleEvent) -> Result<()> {
        let tx = txn.postgres()?;
        sqlx::query(
            r#"
            INSERT INTO core.entity_lifecycle_event
                (id, instance_id, from_state, to_state, operation_code, actor,
                 payload, correlation_id, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.instance_id)
        .bind(event.from_state)
        .bind(event.to_state)
        .bind(&event.operation_code)
        .bind(event.actor)
        .bind(&event.payload)
        .bind(&event.correlation_id)
        .bind(epoch_ms_to_datetime(event.occurred_at))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn load_events(&self, instance_id: Uuid) -> Result<Vec<LifecycleEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, from_state, to_state, operation_code, actor,
                   payload, correlation_id, occurred_at
            FROM core.entity_lifecycle_event
            WHERE instance_id = $1
            ORDER BY occurred_at, id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let occurred_at: chrono::DateTime<chrono::Utc> = row.get("occurred_at");
                LifecycleEvent {
                    id: row.get("id"),
                    instance_id: row.get("instance_id"),
                    from_state: row.get("from_state"),
                    to_state: row.get("to_state"),
                    operation_code: row.get("operation_code"),
                    actor: row.get("actor"),
                    payload: row.get("payload"),
                    correlation_id: row.get("correlation_id"),
                    occurred_at: datetime_to_epoch_ms(occurred_at),
                }
            })
            .collect())
    }
}
