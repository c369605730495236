use crate::postgres::{datetime_to_epoch_ms, epoch_ms_to_datetime, from_jsonb};
use crate::schema::model::EntitySchema;
use crate::schema::overlay::{Overlay, OverlayChange, OverlayStatus, OverlayStore};
use crate::schema::registry::{PublishArtifact, SchemaRecord, SchemaRegistry, SchemaStatus};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

fn schema_status_str(status: SchemaStatus) -> &'static str {
    match status {
        SchemaStatus::Draft => "draft",
        SchemaStatus::Published => "published",
        SchemaStatus::Archived => "archived",
    }
}

fn schema_status_from(s: &str) -> Result<SchemaStatus> {
    Ok(match s {
        "draft" => SchemaStatus::Draft,
        "published" => SchemaStatus::Published,
        "archived" => SchemaStatus::Archived,
        other => return Err(anyhow!("unknown schema status {other}")),
    })
}

/// PostgreSQL-backed `SchemaRegistry` over `meta.entity` /
/// `meta.entity_version`. The schema body is a JSONB snapshot; the publish
/// artifact rides on the version row.
pub struct PostgresSchemaRegistry {
    pool: sqlx::PgPool,
}

impl PostgresSchemaRegistry {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<SchemaRecord> {
    let body: serde_json::Value = row.get("body");
    let status: String = row.get("status");
    let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
    let published_at: Option<chrono::DateTime<chrono::Utc>> = row.get("published_at");
    Ok(SchemaRecord {
        schema: from_jsonb(body, "entity schema")?,
        status: schema_status_from(&status)?,
        created_at: datetime_to_epoch_ms(created_at),
        published_at: published_at.map(datetime_to_epoch_ms),
    })
}

#[async_trait]
impl SchemaRegistry for PostgresSchemaRegistry {
    async fn save_draft(&self, schema: &EntitySchema) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO meta.entity (name) VALUES ($1)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&schema.entity_name)
        .execute(&mut *tx)
        .await?;

        let existing: Option<String> = sqlx::query(
            "SELECT status FROM meta.entity_version WHERE entity_name = $1 AND version = $2",
        )
        .bind(&schema.entity_name)
        .bind(schema.version as i32)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get("status"));
        if let Some(status) = existing {
            if status != "draft" {
                return Err(anyhow!(
                    "cannot modify {status} schema {}:v{}",
                    schema.entity_name,
                    schema.version
                ));
            }
        }

        let body = serde_json::to_value(schema)?;
        sqlx::query(
            r#"
            INSERT INTO meta.entity_version (entity_name, version, status, body, created_at)
            VALUES ($1, $2, 'draft', $3, now())
            ON CONFLICT (entity_name, version) DO UPDATE SET body = EXCLUDED.body
            "#,
        )
        .bind(&schema.entity_name)
        .bind(schema.version as i32)
        .bind(&body)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, entity_name: &str, version: u32) -> Result<Option<SchemaRecord>> {
        let row = sqlx::query(
            r#"
            SELECT body, status, created_at, published_at
            FROM meta.entity_version
            WHERE entity_name = $1 AND version = $2
            "#,
        )
        .bind(entity_name)
        .bind(version as i32)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn publish(
        &self,
        entity_name: &str,
        version: u32,
        artifact: PublishArtifact,
    ) -> Result<()> {
        let artifact_json = serde_json::to_value(&artifact)?;
        let result = sqlx::query(
            r#"
            UPDATE meta.entity_version
            SET status = 'published', published_at = $1, publish_artifact = $2
            WHERE entity_name = $3 AND version = $4 AND status = 'draft'
            "#,
        )
        .bind(epoch_ms_to_datetime(artifact.published_at))
        .bind(&artifact_json)
        .bind(entity_name)
        .bind(version as i32)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!(
                "schema {entity_name}:v{version} is missing or already published"
            ));
        }
        Ok(())
    }

    async fn archive(&self, entity_name: &str, version: u32) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE meta.entity_version SET status = 'archived'
            WHERE entity_name = $1 AND version = $2 AND status = 'published'
            "#,
        )
        .bind(entity_name)
        .bind(version as i32)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!(
                "schema {entity_name}:v{version} is not published"
            ));
        }
        Ok(())
    }

    async fn latest_published(&self, entity_name: &str) -> Result<Option<SchemaRecord>> {
        let row = sqlx::query(
            r#"
            SELECT body, status, created_at, published_at
            FROM meta.entity_version
            WHERE entity_name = $1 AND status = 'published'
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(entity_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn get_artifact(
        &self,
        entity_name: &str,
        version: u32,
    ) -> Result<Option<PublishArtifact>> {
        let row = sqlx::query(
            r#"
            SELECT publish_artifact FROM meta.entity_version
            WHERE entity_name = $1 AND version = $2 AND publish_artifact IS NOT NULL
            "#,
        )
        .bind(entity_name)
        .bind(version as i32)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let artifact: serde_json::Value = row.get("publish_artifact");
                Ok(Some(from_jsonb(artifact, "publish artifact")?))
            }
        }
    }

    async fn list(&self, entity_name: Option<&str>) -> Result<Vec<SchemaRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT body, status, created_at, published_at
            FROM meta.entity_version
            WHERE $1::text IS NULL OR entity_name = $1
            ORDER BY entity_name, version
            "#,
        )
        .bind(entity_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }
}

/// PostgreSQL-backed `OverlayStore` over `meta.overlay` /
/// `meta.overlay_change`.
pub struct PostgresOverlayStore {
    pool: sqlx::PgPool,
}

impl PostgresOverlayStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    async fn load_one(&self, id: Uuid) -> Result<Option<Overlay>> {
        let header = sqlx::query(
            "SELECT id, tenant_id, name, status FROM meta.overlay WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(header) = header else {
            return Ok(None);
        };

        let change_rows = sqlx::query(
            r#"
            SELECT kind, payload, sort_order, conflict_mode
            FROM meta.overlay_change
            WHERE overlay_id = $1
            ORDER BY sort_order
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let mut changes = Vec::with_capacity(change_rows.len());
        for row in change_rows {
            let kind: serde_json::Value = row.get("kind");
            let conflict_mode: serde_json::Value = row.get("conflict_mode");
            changes.push(OverlayChange {
                kind: from_jsonb(kind, "overlay change kind")?,
                payload: row.get("payload"),
                sort_order: row.get("sort_order"),
                conflict_mode: from_jsonb(conflict_mode, "overlay conflict mode")?,
            });
        }

        let status: String = header.get("status");
        Ok(Some(Overlay {
            id: header.get("id"),
            tenant_id: header.get("tenant_id"),
            name: header.get("name"),
            status: overlay_status_from(&status)?,
            changes,
        }))
    }
}

fn overlay_status_str(status: OverlayStatus) -> &'static str {
    match status {
        OverlayStatus::Draft => "draft",
        OverlayStatus::Published => "published",
        OverlayStatus::Archived => "archived",
    }
}

fn overlay_status_from(s: &str) -> Result<OverlayStatus> {
    Ok(match s {
        "draft" => OverlayStatus::Draft,
        "published" => OverlayStatus::Published,
        "archived" => OverlayStatus::Archived,
        other => return Err(anyhow!("unknown overlay status {other}")),
    })
}

#[async_trait]
impl OverlayStore for PostgresOverlayStore {
    async fn save(&self, overlay: &Overlay) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query("SELECT status FROM meta.overlay WHERE id = $1")
                .bind(overlay.id)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.get("status"));
        if let Some(status) = existing {
            if status != "draft" {
                return Err(anyhow!("cannot modify {status} overlay {}", overlay.id));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO meta.overlay (id, tenant_id, name, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status
            "#,
        )
        .bind(overlay.id)
        .bind(overlay.tenant_id)
        .bind(&overlay.name)
        .bind(overlay_status_str(overlay.status))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM meta.overlay_change WHERE overlay_id = $1")
            .bind(overlay.id)
            .execute(&mut *tx)
            .await?;
        for change in &overlay.changes {
            let kind = serde_json::to_value(change.kind)?;
            let conflict_mode = serde_json::to_value(change.conflict_mode)?;
            sqlx::query(
                r#"
                INSERT INTO meta.overlay_change
                    (overlay_id, kind, payload, sort_order, conflict_mode)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(overlay.id)
            .bind(&kind)
            .bind(&change.payload)
            .bind(change.sort_order)
            .bind(&conflict_mode)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Overlay>> {
        self.load_one(id).await
    }

    async fn set_status(&self, id: Uuid, status: OverlayStatus) -> Result<()> {
        let allowed_from = match status {
            OverlayStatus::Published => "draft",
            OverlayStatus::Archived => "published",
            OverlayStatus::Draft => {
                return Err(anyhow!("overlays cannot return to draft"));
            }
        };
        let result = sqlx::query(
            "UPDATE meta.overlay SET status = $1 WHERE id = $2 AND status = $3",
        )
        .bind(overlay_status_str(status))
        .bind(id)
        .bind(allowed_from)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("invalid overlay transition for {id}"));
        }
        Ok(())
    }

    async fn resolve_set(&self, overlay_set: &[Uuid]) -> Result<Vec<Overlay>> {
        let mut resolved = Vec::with_capacity(overlay_set.len());
        for id in overlay_set {
            let overlay = self
                .load_one(*id)
                .await?
                .ok_or_else(|| anyhow!("overlay not found: {id}"))?;
            if overlay.status != OverlayStatus::Published {
                return Err(anyhow!("overlay {id} is not published"));
            }
            resolved.push(overlay);
        }
        Ok(resolved)
    }

    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Overlay>> {
        let rows = sqlx::query("SELECT id FROM meta.overlay WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        let mut overlays = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(overlay) = self.load_one(row.get("id")).await? {
                overlays.push(overlay);
            }
        }
        Ok(overlays)
    }
}
