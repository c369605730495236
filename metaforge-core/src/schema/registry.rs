use crate::context::{now_ms, Timestamp};
use crate::schema::model::EntitySchema;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

// ── Schema version state machine ──
// Draft → Published → Archived
// (no backward transitions from Archived; published content is frozen)

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaStatus {
    Draft,
    Published,
    Archived,
}

/// A schema version as held by the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub schema: EntitySchema,
    pub status: SchemaStatus,
    pub created_at: Timestamp,
    pub published_at: Option<Timestamp>,
}

/// Durable record of a publish: which overlay set was applied, what the
/// compiler produced, and when. Re-publishing the same (entity, version) is
/// rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishArtifact {
    pub entity_name: String,
    pub version: u32,
    pub compiled_hash: String,
    pub diagnostics_summary: String,
    pub applied_overlay_set: Vec<Uuid>,
    pub published_at: Timestamp,
}

/// Versioned store of entity schemas.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Save or overwrite a draft. Published and archived versions are frozen.
    async fn save_draft(&self, schema: &EntitySchema) -> Result<()>;
    async fn get(&self, entity_name: &str, version: u32) -> Result<Option<SchemaRecord>>;
    /// Freeze a draft and record the publish artifact.
    async fn publish(&self, entity_name: &str, version: u32, artifact: PublishArtifact)
        -> Result<()>;
    async fn archive(&self, entity_name: &str, version: u32) -> Result<()>;
    async fn latest_published(&self, entity_name: &str) -> Result<Option<SchemaRecord>>;
    async fn get_artifact(&self, entity_name: &str, version: u32)
        -> Result<Option<PublishArtifact>>;
    async fn list(&self, entity_name: Option<&str>) -> Result<Vec<SchemaRecord>>;
}

type VersionKey = (String, u32);

struct Inner {
    records: HashMap<VersionKey, SchemaRecord>,
    artifacts: HashMap<VersionKey, PublishArtifact>,
}

/// In-memory registry for tests and single-process deployments.
pub struct MemorySchemaRegistry {
    inner: RwLock<Inner>,
}

impl MemorySchemaRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                artifacts: HashMap::new(),
            }),
        }
    }
}

impl Default for MemorySchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaRegistry for MemorySchemaRegistry {
    async fn save_draft(&self, schema: &EntitySchema) -> Result<()> {
        let key = (schema.entity_name.clone(), schema.version);
        let mut w = self.inner.write().await;

        if let Some(existing) = w.records.get(&key) {
            match existing.status {
                SchemaStatus::Published => {
                    return Err(anyhow!(
                        "cannot modify published schema {}:v{}",
                        schema.entity_name,
                        schema.version
                    ));
                }
                SchemaStatus::Archived => {
                    return Err(anyhow!(
                        "cannot modify archived schema {}:v{}",
                        schema.entity_name,
                        schema.version
                    ));
                }
                SchemaStatus::Draft => {}
            }
        }

        w.records.insert(
            key,
            SchemaRecord {
                schema: schema.clone(),
                status: SchemaStatus::Draft,
                created_at: now_ms(),
                published_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, entity_name: &str, version: u32) -> Result<Option<SchemaRecord>> {
        let r = self.inner.read().await;
        Ok(r.records.get(&(entity_name.to_string(), version)).cloned())
    }

    async fn publish(
        &self,
        entity_name: &str,
        version: u32,
        artifact: PublishArtifact,
    ) -> Result<()> {
        let key = (entity_name.to_string(), version);
        let mut w = self.inner.write().await;

        if w.artifacts.contains_key(&key) {
            return Err(anyhow!(
                "schema {entity_name}:v{version} is already published"
            ));
        }

        let record = w
            .records
            .get_mut(&key)
            .ok_or_else(|| anyhow!("schema not found: {entity_name}:v{version}"))?;

        match record.status {
            SchemaStatus::Draft => {}
            SchemaStatus::Published => {
                return Err(anyhow!(
                    "schema {entity_name}:v{version} is already published"
                ));
            }
            SchemaStatus::Archived => {
                return Err(anyhow!("cannot publish archived schema {entity_name}:v{version}"));
            }
        }

        record.status = SchemaStatus::Published;
        record.published_at = Some(artifact.published_at);
        w.artifacts.insert(key, artifact);
        Ok(())
    }

    async fn archive(&self, entity_name: &str, version: u32) -> Result<()> {
        let mut w = self.inner.write().await;
        let record = w
            .records
            .get_mut(&(entity_name.to_string(), version))
            .ok_or_else(|| anyhow!("schema not found: {entity_name}:v{version}"))?;
        match record.status {
            SchemaStatus::Published => {
                record.status = SchemaStatus::Archived;
                Ok(())
            }
            from => Err(anyhow!(
                "invalid state transition {from:?} → Archived for {entity_name}:v{version}"
            )),
        }
    }

    async fn latest_published(&self, entity_name: &str) -> Result<Option<SchemaRecord>> {
        let r = self.inner.read().await;
        Ok(r.records
            .values()
            .filter(|rec| {
                rec.schema.entity_name == entity_name && rec.status == SchemaStatus::Published
            })
            .max_by_key(|rec| rec.schema.version)
            .cloned())
    }

    async fn get_artifact(
        &self,
        entity_name: &str,
        version: u32,
    ) -> Result<Option<PublishArtifact>> {
        let r = self.inner.read().await;
        Ok(r.artifacts.get(&(entity_name.to_string(), version)).cloned())
    }

    async fn list(&self, entity_name: Option<&str>) -> Result<Vec<SchemaRecord>> {
        let r = self.inner.read().await;
        Ok(r.records
            .values()
            .filter(|rec| entity_name.is_none_or(|n| rec.schema.entity_name == n))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{EntitySchema, FieldDef, FieldType};

    fn sample(version: u32) -> EntitySchema {
        let mut s = EntitySchema::new("Invoice", version).with_system_fields();
        s.fields.push(FieldDef::new("amount", FieldType::Number));
        s
    }

    fn artifact(version: u32) -> PublishArtifact {
        PublishArtifact {
            entity_name: "Invoice".to_string(),
            version,
            compiled_hash: "abc123".to_string(),
            diagnostics_summary: "0 errors, 0 warnings".to_string(),
            applied_overlay_set: vec![],
            published_at: now_ms(),
        }
    }

    #[tokio::test]
    async fn draft_save_load_round_trip() {
        let registry = MemorySchemaRegistry::new();
        registry.save_draft(&sample(1)).await.unwrap();
        let loaded = registry.get("Invoice", 1).await.unwrap().unwrap();
        assert_eq!(loaded.status, SchemaStatus::Draft);
        assert_eq!(loaded.schema.version, 1);
    }

    #[tokio::test]
    async fn published_version_is_frozen() {
        let registry = MemorySchemaRegistry::new();
        registry.save_draft(&sample(1)).await.unwrap();
        registry.publish("Invoice", 1, artifact(1)).await.unwrap();

        let result = registry.save_draft(&sample(1)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cannot modify"));
    }

    #[tokio::test]
    async fn republish_same_version_rejected() {
        let registry = MemorySchemaRegistry::new();
        registry.save_draft(&sample(1)).await.unwrap();
        registry.publish("Invoice", 1, artifact(1)).await.unwrap();

        let result = registry.publish("Invoice", 1, artifact(1)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already published"));
    }

    #[tokio::test]
    async fn latest_published_picks_highest_version() {
        let registry = MemorySchemaRegistry::new();
        for v in 1..=3 {
            registry.save_draft(&sample(v)).await.unwrap();
        }
        registry.publish("Invoice", 1, artifact(1)).await.unwrap();
        registry.publish("Invoice", 3, artifact(3)).await.unwrap();

        let latest = registry.latest_published("Invoice").await.unwrap().unwrap();
        assert_eq!(latest.schema.version, 3);

        registry.archive("Invoice", 3).await.unwrap();
        let latest = registry.latest_published("Invoice").await.unwrap().unwrap();
        assert_eq!(latest.schema.version, 1);
    }

    #[tokio::test]
    async fn archive_requires_published() {
        let registry = MemorySchemaRegistry::new();
        registry.save_draft(&sample(1)).await.unwrap();
        let result = registry.archive("Invoice", 1).await;
        assert!(result.is_err());
    }
}
