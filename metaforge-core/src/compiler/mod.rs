//! The schema/policy compiler: (schema, overlay set) → Compiled Model IR.

pub mod canonical;
pub mod ir;
pub mod overlay_apply;
pub mod validate;

pub use canonical::{canonical_json, hash_canonical, hex_encode};
pub use ir::{
    CompilationResult, CompiledField, CompiledModel, CompiledPolicy, Diagnostic, FieldConstraints,
    IndexSpec, Severity,
};

use crate::cache::{model_key, ModelCache};
use crate::context::{now_ms, RequestContext};
use crate::error::{FieldViolation, PlatformError, PlatformResult};
use crate::schema::model::EntitySchema;
use crate::schema::overlay::OverlayStore;
use crate::schema::registry::{PublishArtifact, SchemaRegistry};
use std::sync::Arc;
use uuid::Uuid;

/// Convert an API name to its physical column name.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// Hash suffix identifying an overlay set in cache keys. Empty set → "base".
pub fn overlay_set_hash(overlay_set: &[Uuid]) -> String {
    if overlay_set.is_empty() {
        return "base".to_string();
    }
    let ids: Vec<String> = overlay_set.iter().map(Uuid::to_string).collect();
    let mut hash = hash_canonical(&ids).unwrap_or_else(|_| "unhashable".to_string());
    hash.truncate(16);
    hash
}

/// The compiler service. Stateless between calls; all caching lives in C5.
pub struct ModelCompiler {
    registry: Arc<dyn SchemaRegistry>,
    overlays: Arc<dyn OverlayStore>,
    cache: Arc<ModelCache>,
}

impl ModelCompiler {
    pub fn new(
        registry: Arc<dyn SchemaRegistry>,
        overlays: Arc<dyn OverlayStore>,
        cache: Arc<ModelCache>,
    ) -> Self {
        Self {
            registry,
            overlays,
            cache,
        }
    }

    /// Full pipeline:
    /// 1. Resolve base schema (fail if not found).
    /// 2. Apply overlay changes to a deep copy.
    /// 3. Validate the modified schema.
    /// 4. Compile fields and policies.
    /// 5. Compute input/output hashes.
    /// 6. On success, write through the cache.
    pub async fn compile(
        &self,
        entity_name: &str,
        version: u32,
        overlay_set: &[Uuid],
        ctx: &RequestContext,
    ) -> PlatformResult<CompilationResult> {
        // 1. Base schema
        let record = self
            .registry
            .get(entity_name, version)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("schema {entity_name}:v{version}")))?;

        // 2. Overlays
        let overlays = self.overlays.resolve_set(overlay_set).await?;
        let schema = match overlay_apply::apply_overlay_set(&record.schema, &overlays) {
            Ok(schema) => schema,
            Err(diagnostics) => return Ok(CompilationResult::failure(diagnostics)),
        };

        // 3. Validate
        let diagnostics = validate::validate_schema(&schema);
        if diagnostics.iter().any(|d| d.severity == Severity::Error) {
            return Ok(CompilationResult::failure(diagnostics));
        }

        // 4.–5. Compile + hash
        let model = build_model(&schema, overlay_set, ctx.user_id, diagnostics.clone())?;

        // 6. Cache write (ERROR diagnostics never reach this point)
        let key = model_key(entity_name, version, &overlay_set_hash(overlay_set));
        let model = Arc::new(model);
        self.cache.put(&key, model.clone()).await;

        Ok(CompilationResult {
            success: true,
            model: Some(model.as_ref().clone()),
            diagnostics,
        })
    }

    /// Cache-through lookup used by every runtime read path. A compilation
    /// failure surfaces as `Validation`.
    pub async fn get_or_compile(
        &self,
        entity_name: &str,
        version: u32,
        overlay_set: &[Uuid],
        ctx: &RequestContext,
    ) -> PlatformResult<Arc<CompiledModel>> {
        let key = model_key(entity_name, version, &overlay_set_hash(overlay_set));
        if let Some(model) = self.cache.get(&key).await {
            return Ok(model);
        }

        let result = self.compile(entity_name, version, overlay_set, ctx).await?;
        if !result.success {
            return Err(diagnostics_to_error(&result));
        }
        // compile() already wrote the cache; read back the shared Arc.
        if let Some(model) = self.cache.get(&key).await {
            return Ok(model);
        }
        Ok(Arc::new(result.model.ok_or_else(|| {
            PlatformError::Internal(anyhow::anyhow!("successful compile produced no model"))
        })?))
    }

    /// Resolve the latest published version for an entity.
    pub async fn latest_model(
        &self,
        entity_name: &str,
        overlay_set: &[Uuid],
        ctx: &RequestContext,
    ) -> PlatformResult<Arc<CompiledModel>> {
        let record = self
            .registry
            .latest_published(entity_name)
            .await?
            .ok_or_else(|| {
                PlatformError::not_found(format!("no published schema for {entity_name}"))
            })?;
        self.get_or_compile(entity_name, record.schema.version, overlay_set, ctx)
            .await
    }

    /// Publish a schema version: compile, persist the artifact, freeze the
    /// version, and invalidate cached variants of older compiles.
    pub async fn publish(
        &self,
        entity_name: &str,
        version: u32,
        overlay_set: &[Uuid],
        ctx: &RequestContext,
    ) -> PlatformResult<PublishArtifact> {
        let result = self.compile(entity_name, version, overlay_set, ctx).await?;
        if !result.success {
            return Err(diagnostics_to_error(&result));
        }
        let model = result
            .model
            .as_ref()
            .ok_or_else(|| PlatformError::Internal(anyhow::anyhow!("compile lost its model")))?;

        let artifact = PublishArtifact {
            entity_name: entity_name.to_string(),
            version,
            compiled_hash: model.output_hash.clone(),
            diagnostics_summary: result.summary(),
            applied_overlay_set: overlay_set.to_vec(),
            published_at: now_ms(),
        };
        self.registry
            .publish(entity_name, version, artifact.clone())
            .await?;

        self.cache.invalidate_entity(entity_name, version).await;
        Ok(artifact)
    }

    /// Explicit invalidation hook for overlay changes.
    pub async fn invalidate(&self, entity_name: &str, version: u32) {
        self.cache.invalidate_entity(entity_name, version).await;
    }
}

fn diagnostics_to_error(result: &CompilationResult) -> PlatformError {
    PlatformError::Validation(
        result
            .errors()
            .map(|d| FieldViolation {
                rule_id: d.code.clone(),
                field: d.field.clone().unwrap_or_default(),
                message: d.message.clone(),
            })
            .collect(),
    )
}

fn build_model(
    schema: &EntitySchema,
    overlay_set: &[Uuid],
    compiled_by: Uuid,
    diagnostics: Vec<Diagnostic>,
) -> PlatformResult<CompiledModel> {
    let table_name = format!("ent_{}", snake_case(&schema.entity_name));

    let fields: Vec<CompiledField> = schema
        .fields
        .iter()
        .map(|f| {
            let column_name = snake_case(&f.name);
            CompiledField {
                select_as: format!("{column_name} as {}", f.name),
                api_name: f.name.clone(),
                column_name,
                field_type: f.field_type,
                required: f.required,
                reference_to: f.reference_to.clone(),
                on_delete: f.on_delete,
                enum_values: f.enum_values.clone(),
                constraints: FieldConstraints {
                    min_length: f.min_length,
                    max_length: f.max_length,
                    min: f.min,
                    max: f.max,
                    pattern: f.pattern.clone(),
                },
                default_value: f.default_value.clone(),
                indexed: f.indexed,
                unique: f.unique,
            }
        })
        .collect();

    let policies: Vec<CompiledPolicy> = schema
        .policies
        .iter()
        .map(|p| CompiledPolicy {
            name: p.name.clone(),
            effect: p.effect,
            action: p.action,
            resource: p.resource.clone(),
            conditions: p.conditions.clone(),
            fields: p.fields.clone(),
            priority: p.priority,
        })
        .collect();

    let select_fragment = fields
        .iter()
        .map(|f| f.select_as.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut indexes: Vec<IndexSpec> = vec![IndexSpec {
        column_name: "tenant_id".to_string(),
        unique: false,
    }];
    for f in &fields {
        if (f.indexed || f.unique) && f.column_name != "tenant_id" {
            indexes.push(IndexSpec {
                column_name: f.column_name.clone(),
                unique: f.unique,
            });
        }
    }

    let input_hash = hash_canonical(&serde_json::json!({
        "entityName": schema.entity_name,
        "version": schema.version,
        "fields": schema.fields,
        "policies": schema.policies,
        "metadata": schema.metadata,
        "overlaySet": overlay_set,
    }))
    .map_err(PlatformError::Internal)?;

    let mut model = CompiledModel {
        entity_name: schema.entity_name.clone(),
        version: schema.version,
        table_name: table_name.clone(),
        fields,
        policies,
        select_fragment,
        from_fragment: table_name,
        tenant_filter_fragment: "tenant_id = $1 AND deleted_at IS NULL".to_string(),
        indexes,
        metadata: schema.metadata.clone(),
        compiled_at: now_ms(),
        compiled_by,
        input_hash,
        output_hash: String::new(),
        diagnostics,
    };

    // The output hash covers the IR minus both hash fields and the volatile
    // compile stamp, so recompiling identical inputs is byte-stable.
    let mut hashable = model.clone();
    hashable.input_hash = String::new();
    hashable.output_hash = String::new();
    hashable.compiled_at = 0;
    hashable.compiled_by = Uuid::nil();
    model.output_hash = hash_canonical(&hashable).map_err(PlatformError::Internal)?;

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryKv;
    use crate::config::CacheConfig;
    use crate::schema::model::{FieldDef, FieldType};
    use crate::schema::overlay::{
        ConflictMode, MemoryOverlayStore, Overlay, OverlayChange, OverlayChangeKind,
        OverlayStatus,
    };
    use crate::schema::registry::MemorySchemaRegistry;
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext::new(Uuid::now_v7(), Uuid::now_v7(), "core", vec!["admin".into()])
    }

    async fn compiler_with_schema() -> (ModelCompiler, Arc<MemoryOverlayStore>) {
        let registry = Arc::new(MemorySchemaRegistry::new());
        let overlays = Arc::new(MemoryOverlayStore::new());
        let cache = Arc::new(ModelCache::new(
            &CacheConfig::default(),
            Arc::new(MemoryKv::new()),
        ));

        let mut schema = EntitySchema::new("PurchaseOrder", 1).with_system_fields();
        schema.fields.push(FieldDef::new("totalAmount", FieldType::Number));
        let mut memo = FieldDef::new("memo", FieldType::String);
        memo.indexed = true;
        schema.fields.push(memo);
        registry.save_draft(&schema).await.unwrap();

        (
            ModelCompiler::new(registry, overlays.clone(), cache),
            overlays,
        )
    }

    #[test]
    fn snake_case_handles_camel_and_acronyms() {
        assert_eq!(snake_case("totalAmount"), "total_amount");
        assert_eq!(snake_case("PurchaseOrder"), "purchase_order");
        assert_eq!(snake_case("already_snake"), "already_snake");
        assert_eq!(snake_case("APIKey"), "apikey");
    }

    #[tokio::test]
    async fn compile_produces_table_and_fragments() {
        let (compiler, _) = compiler_with_schema().await;
        let result = compiler
            .compile("PurchaseOrder", 1, &[], &ctx())
            .await
            .unwrap();
        assert!(result.success);
        let model = result.model.unwrap();
        assert_eq!(model.table_name, "ent_purchase_order");
        assert!(model.select_fragment.contains("total_amount as totalAmount"));
        assert!(model
            .indexes
            .iter()
            .any(|i| i.column_name == "memo" && !i.unique));
    }

    #[tokio::test]
    async fn compile_is_deterministic() {
        let (compiler, _) = compiler_with_schema().await;
        let a = compiler
            .compile("PurchaseOrder", 1, &[], &ctx())
            .await
            .unwrap()
            .model
            .unwrap();
        let b = compiler
            .compile("PurchaseOrder", 1, &[], &ctx())
            .await
            .unwrap()
            .model
            .unwrap();
        assert_eq!(a.input_hash, b.input_hash);
        assert_eq!(a.output_hash, b.output_hash);
    }

    #[tokio::test]
    async fn output_hash_survives_serialization_round_trip() {
        let (compiler, _) = compiler_with_schema().await;
        let model = compiler
            .compile("PurchaseOrder", 1, &[], &ctx())
            .await
            .unwrap()
            .model
            .unwrap();

        let json = serde_json::to_string(&model).unwrap();
        let mut back: CompiledModel = serde_json::from_str(&json).unwrap();

        // Recompute over the round-tripped IR with hash fields and the
        // volatile compile stamp cleared.
        let expected = back.output_hash.clone();
        back.input_hash = String::new();
        back.output_hash = String::new();
        back.compiled_at = 0;
        back.compiled_by = Uuid::nil();
        assert_eq!(hash_canonical(&back).unwrap(), expected);
    }

    #[tokio::test]
    async fn missing_schema_is_not_found() {
        let (compiler, _) = compiler_with_schema().await;
        let err = compiler
            .compile("Ghost", 1, &[], &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.code().as_str(), "NotFound");
    }

    #[tokio::test]
    async fn validation_errors_block_model_and_cache() {
        let registry = Arc::new(MemorySchemaRegistry::new());
        let overlays = Arc::new(MemoryOverlayStore::new());
        let cache = Arc::new(ModelCache::new(
            &CacheConfig::default(),
            Arc::new(MemoryKv::new()),
        ));
        // Schema without system fields: ERROR diagnostics expected.
        let mut schema = EntitySchema::new("Broken", 1);
        schema.fields.push(FieldDef::new("x", FieldType::String));
        registry.save_draft(&schema).await.unwrap();

        let compiler = ModelCompiler::new(registry, overlays, cache);
        let result = compiler.compile("Broken", 1, &[], &ctx()).await.unwrap();
        assert!(!result.success);
        assert!(result.model.is_none());
        assert!(result.errors().count() > 0);

        let err = compiler
            .get_or_compile("Broken", 1, &[], &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.code().as_str(), "Validation");
    }

    #[tokio::test]
    async fn overlay_changes_input_hash_and_is_idempotent() {
        let (compiler, overlays) = compiler_with_schema().await;
        let overlay = Overlay {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            name: "add-memo2".to_string(),
            status: OverlayStatus::Draft,
            changes: vec![OverlayChange {
                kind: OverlayChangeKind::AddField,
                payload: json!({"name": "memo2", "type": "string"}),
                sort_order: 0,
                conflict_mode: ConflictMode::Fail,
            }],
        };
        overlays.save(&overlay).await.unwrap();
        overlays
            .set_status(overlay.id, OverlayStatus::Published)
            .await
            .unwrap();

        let base = compiler
            .compile("PurchaseOrder", 1, &[], &ctx())
            .await
            .unwrap()
            .model
            .unwrap();
        let with_overlay_1 = compiler
            .compile("PurchaseOrder", 1, &[overlay.id], &ctx())
            .await
            .unwrap()
            .model
            .unwrap();
        let with_overlay_2 = compiler
            .compile("PurchaseOrder", 1, &[overlay.id], &ctx())
            .await
            .unwrap()
            .model
            .unwrap();

        assert_ne!(base.input_hash, with_overlay_1.input_hash);
        // Same (base, overlaySet) → equal compiled hash.
        assert_eq!(with_overlay_1.output_hash, with_overlay_2.output_hash);
        assert!(with_overlay_1.field("memo2").is_some());
    }

    #[tokio::test]
    async fn publish_persists_artifact_and_rejects_republish() {
        let (compiler, _) = compiler_with_schema().await;
        let artifact = compiler
            .publish("PurchaseOrder", 1, &[], &ctx())
            .await
            .unwrap();
        assert!(!artifact.compiled_hash.is_empty());
        assert_eq!(artifact.diagnostics_summary, "0 errors, 0 warnings");

        let err = compiler.publish("PurchaseOrder", 1, &[], &ctx()).await;
        assert!(err.is_err());
    }
}
