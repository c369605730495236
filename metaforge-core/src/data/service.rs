use crate::audit::AuditOutbox;
use crate::compiler::ir::CompiledModel;
use crate::compiler::ModelCompiler;
use crate::config::QueryLimits;
use crate::context::{now_ms, RequestContext};
use crate::data::query::{self, Query};
use crate::data::store::RecordStore;
use crate::error::{FieldViolation, PlatformError, PlatformResult, RestrictReferrer};
use crate::lifecycle::manager::LifecycleManager;
use crate::lifecycle::model::TransitionResult;
use crate::numbering::NumberingService;
use crate::policy::condition::Record;
use crate::policy::{FieldAccess, PolicyEngine};
use crate::schema::model::{OnDelete, PolicyAction, SYSTEM_FIELDS};
use crate::schema::registry::SchemaRegistry;
use crate::txn::{rollback_or_warn, TxnHandle, TxnManager};
use crate::validation::{RulePhase, RuleTrigger, ValidationEngine};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Maximum cascade recursion depth for soft deletes.
const MAX_CASCADE_DEPTH: u32 = 10;

/// Outcome of one item in a bulk operation.
#[derive(Clone, Debug)]
pub struct BulkItemResult {
    pub index: usize,
    pub id: Option<Uuid>,
    pub error: Option<String>,
    pub error_code: Option<&'static str>,
}

/// Tenant-isolated CRUD over IR-described tables, enforcing policy,
/// validation, and lifecycle on every operation. Each mutating operation
/// runs its writes — the record row, the lifecycle rows, and the audit
/// outbox row — in one transaction.
pub struct DataService {
    compiler: Arc<ModelCompiler>,
    policy: Arc<PolicyEngine>,
    validation: Arc<ValidationEngine>,
    lifecycle: Arc<LifecycleManager>,
    store: Arc<dyn RecordStore>,
    registry: Arc<dyn SchemaRegistry>,
    numbering: Arc<NumberingService>,
    outbox: Arc<AuditOutbox>,
    txn: Arc<dyn TxnManager>,
    limits: QueryLimits,
}

impl DataService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        compiler: Arc<ModelCompiler>,
        policy: Arc<PolicyEngine>,
        validation: Arc<ValidationEngine>,
        lifecycle: Arc<LifecycleManager>,
        store: Arc<dyn RecordStore>,
        registry: Arc<dyn SchemaRegistry>,
        numbering: Arc<NumberingService>,
        outbox: Arc<AuditOutbox>,
        txn: Arc<dyn TxnManager>,
        limits: QueryLimits,
    ) -> Self {
        Self {
            compiler,
            policy,
            validation,
            lifecycle,
            store,
            registry,
            numbering,
            outbox,
            txn,
            limits,
        }
    }

    async fn model(
        &self,
        entity_name: &str,
        ctx: &RequestContext,
    ) -> PlatformResult<Arc<CompiledModel>> {
        // Every operation resolves the IR first, so the request deadline is
        // checked here before any I/O is issued.
        if ctx.deadline_exceeded(now_ms()) {
            return Err(PlatformError::Timeout(format!(
                "request {} exceeded its deadline",
                ctx.request_id
            )));
        }
        self.compiler.latest_model(entity_name, &[], ctx).await
    }

    // ─── Create ───────────────────────────────────────────────

    pub async fn create(
        &self,
        entity_name: &str,
        data: Record,
        ctx: &RequestContext,
    ) -> PlatformResult<Record> {
        let model = self.model(entity_name, ctx).await?;
        let record = self.prepare_create(&model, entity_name, data, ctx).await?;

        let mut txn = self.txn.begin().await?;
        match self
            .apply_create(&model, entity_name, &record, ctx, &mut txn)
            .await
        {
            Ok(()) => {
                self.txn.commit(txn).await?;
                Ok(record)
            }
            Err(e) => {
                rollback_or_warn(self.txn.as_ref(), txn).await;
                Err(e)
            }
        }
    }

    /// Everything before the writes: authorization, the field write filter,
    /// declared defaults, numbering, validation, and the system columns.
    async fn prepare_create(
        &self,
        model: &CompiledModel,
        entity_name: &str,
        data: Record,
        ctx: &RequestContext,
    ) -> PlatformResult<Record> {
        self.policy
            .enforce(PolicyAction::Create, model, ctx, Some(&data))
            .await?;

        let mut record = self
            .apply_write_filter(PolicyAction::Create, model, ctx, data)
            .await?;

        // Defaults for declared fields the caller omitted.
        for field in &model.fields {
            if let Some(default) = &field.default_value {
                record
                    .entry(field.api_name.clone())
                    .or_insert_with(|| default.clone());
            }
        }

        // Numbering, when the model names a numbered field.
        if let Some(number_field) = model
            .metadata
            .get("numbering")
            .and_then(|v| v.as_str())
        {
            if !record.contains_key(number_field) {
                if let Some(number) = self.numbering.next(entity_name, ctx, now_ms()).await? {
                    record.insert(number_field.to_string(), serde_json::json!(number));
                }
            }
        }

        let graph = self.validation.graph_for(model).await;
        self.validation
            .execute(
                &graph,
                &record,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                ctx,
                None,
            )
            .await
            .into_result()?;

        let id = Uuid::now_v7();
        let now = now_ms();
        record.insert("id".to_string(), serde_json::json!(id));
        record.insert("tenant_id".to_string(), serde_json::json!(ctx.tenant_id));
        record.insert("realm_id".to_string(), serde_json::json!(ctx.realm_id));
        record.insert("created_at".to_string(), serde_json::json!(now));
        record.insert("created_by".to_string(), serde_json::json!(ctx.user_id));
        record.insert("updated_at".to_string(), serde_json::json!(now));
        record.insert("updated_by".to_string(), serde_json::json!(ctx.user_id));
        record.insert("deleted_at".to_string(), serde_json::Value::Null);
        record.insert("deleted_by".to_string(), serde_json::Value::Null);
        record.insert("version".to_string(), serde_json::json!(1));
        Ok(record)
    }

    /// The transactional writes: the record row, its lifecycle instance and
    /// CREATE event, and the audit outbox row.
    async fn apply_create(
        &self,
        model: &CompiledModel,
        entity_name: &str,
        record: &Record,
        ctx: &RequestContext,
        txn: &mut TxnHandle,
    ) -> PlatformResult<()> {
        let id = record
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| PlatformError::Internal(anyhow::anyhow!("prepared record lost its id")))?;

        self.store.insert(txn, model, ctx.tenant_id, record).await?;

        self.lifecycle
            .create_instance(entity_name, id, ctx, Some(record), txn)
            .await?;

        self.audit_in(txn, ctx, "entity.created", entity_name, id).await
    }

    // ─── Read ─────────────────────────────────────────────────

    pub async fn read(
        &self,
        entity_name: &str,
        id: Uuid,
        ctx: &RequestContext,
        include_deleted: bool,
        as_of: Option<i64>,
    ) -> PlatformResult<Record> {
        let model = self.model(entity_name, ctx).await?;
        self.policy
            .enforce(PolicyAction::Read, &model, ctx, None)
            .await?;

        let record = self
            .store
            .get(&model, ctx.tenant_id, id, include_deleted, as_of)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("{entity_name}/{id}")))?;

        let access = self
            .policy
            .allowed_fields(PolicyAction::Read, &model, ctx, Some(&record))
            .await;
        Ok(apply_read_filter(record, &access))
    }

    pub async fn list(
        &self,
        entity_name: &str,
        query: Query,
        ctx: &RequestContext,
    ) -> PlatformResult<Vec<Record>> {
        let model = self.model(entity_name, ctx).await?;
        self.policy
            .enforce(PolicyAction::Read, &model, ctx, None)
            .await?;
        query::validate_query(&model, &query, &self.limits)?;

        let rows = self.store.query(&model, ctx.tenant_id, &query).await?;
        let mut filtered = Vec::with_capacity(rows.len());
        for row in rows {
            let access = self
                .policy
                .allowed_fields(PolicyAction::Read, &model, ctx, Some(&row))
                .await;
            filtered.push(apply_read_filter(row, &access));
        }
        Ok(filtered)
    }

    // ─── Update ───────────────────────────────────────────────

    /// Optimistic update: the patch must carry `_version`; a mismatch is a
    /// `VersionConflict` and the stored row is untouched.
    pub async fn update(
        &self,
        entity_name: &str,
        id: Uuid,
        mut patch: Record,
        ctx: &RequestContext,
    ) -> PlatformResult<Record> {
        let model = self.model(entity_name, ctx).await?;

        let existing = self
            .store
            .get(&model, ctx.tenant_id, id, false, None)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("{entity_name}/{id}")))?;

        self.policy
            .enforce(PolicyAction::Update, &model, ctx, Some(&existing))
            .await?;
        self.lifecycle
            .enforce_terminal_state(entity_name, id, ctx)
            .await?;

        let sent_version = patch
            .remove("_version")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                PlatformError::Validation(vec![FieldViolation {
                    rule_id: "update.version".to_string(),
                    field: "_version".to_string(),
                    message: "updates require the record version".to_string(),
                }])
            })?;
        let current_version = existing
            .get("version")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if sent_version != current_version {
            return Err(PlatformError::VersionConflict {
                expected: sent_version,
                actual: current_version,
            });
        }

        let patch = self
            .apply_write_filter(PolicyAction::Update, &model, ctx, patch)
            .await?;

        let mut merged = existing.clone();
        for (key, value) in patch {
            merged.insert(key, value);
        }

        let graph = self.validation.graph_for(&model).await;
        self.validation
            .execute(
                &graph,
                &merged,
                RuleTrigger::Update,
                RulePhase::BeforePersist,
                ctx,
                Some(&existing),
            )
            .await
            .into_result()?;

        merged.insert("version".to_string(), serde_json::json!(current_version + 1));
        merged.insert("updated_at".to_string(), serde_json::json!(now_ms()));
        merged.insert("updated_by".to_string(), serde_json::json!(ctx.user_id));

        let mut txn = self.txn.begin().await?;
        match self
            .apply_versioned_write(
                &model,
                entity_name,
                id,
                current_version,
                &merged,
                "entity.updated",
                ctx,
                &mut txn,
            )
            .await
        {
            Ok(()) => {
                self.txn.commit(txn).await?;
                Ok(merged)
            }
            Err(e) => {
                rollback_or_warn(self.txn.as_ref(), txn).await;
                Err(e)
            }
        }
    }

    /// CAS replacement plus the audit row, on one transaction. Shared by
    /// update and restore.
    #[allow(clippy::too_many_arguments)]
    async fn apply_versioned_write(
        &self,
        model: &CompiledModel,
        entity_name: &str,
        id: Uuid,
        expected_version: i64,
        record: &Record,
        event_type: &str,
        ctx: &RequestContext,
        txn: &mut TxnHandle,
    ) -> PlatformResult<()> {
        let won = self
            .store
            .update_cas(txn, model, ctx.tenant_id, id, expected_version, record)
            .await?;
        if !won {
            return Err(PlatformError::VersionConflict {
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        self.audit_in(txn, ctx, event_type, entity_name, id).await
    }

    // ─── Delete / restore ─────────────────────────────────────

    /// Soft delete with referential cascade:
    /// RESTRICT references abort with the violating entities; CASCADE
    /// references soft-delete depth-first (visited set, bounded depth);
    /// SET_NULL references are nulled. The whole cascade shares one
    /// transaction.
    pub async fn delete(
        &self,
        entity_name: &str,
        id: Uuid,
        ctx: &RequestContext,
    ) -> PlatformResult<()> {
        let model = self.model(entity_name, ctx).await?;
        let existing = self
            .store
            .get(&model, ctx.tenant_id, id, false, None)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("{entity_name}/{id}")))?;

        self.policy
            .enforce(PolicyAction::Delete, &model, ctx, Some(&existing))
            .await?;
        self.lifecycle
            .enforce_terminal_state(entity_name, id, ctx)
            .await?;

        // RESTRICT scan walks the whole cascade closure before any mutation:
        // a restricted reference anywhere in the tree aborts the delete.
        let mut violations = Vec::new();
        let mut scanned = HashSet::new();
        self.collect_restrict_violations(entity_name, id, ctx, &mut scanned, 0, &mut violations)
            .await?;
        if !violations.is_empty() {
            return Err(PlatformError::RestrictViolation(violations));
        }

        let mut txn = self.txn.begin().await?;
        match self.apply_delete(entity_name, id, ctx, &mut txn).await {
            Ok(()) => {
                self.txn.commit(txn).await?;
                Ok(())
            }
            Err(e) => {
                rollback_or_warn(self.txn.as_ref(), txn).await;
                Err(e)
            }
        }
    }

    /// The transactional body of `delete`: the cascade plus the audit row.
    async fn apply_delete(
        &self,
        entity_name: &str,
        id: Uuid,
        ctx: &RequestContext,
        txn: &mut TxnHandle,
    ) -> PlatformResult<()> {
        let mut visited = HashSet::new();
        self.soft_delete_recursive(entity_name, id, ctx, &mut visited, 0, txn)
            .await?;
        self.audit_in(txn, ctx, "entity.deleted", entity_name, id).await
    }

    /// Restore a soft-deleted record.
    pub async fn restore(
        &self,
        entity_name: &str,
        id: Uuid,
        ctx: &RequestContext,
    ) -> PlatformResult<Record> {
        let model = self.model(entity_name, ctx).await?;
        let mut record = self
            .store
            .get(&model, ctx.tenant_id, id, true, None)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("{entity_name}/{id}")))?;

        self.policy
            .enforce(PolicyAction::Update, &model, ctx, Some(&record))
            .await?;

        if record.get("deleted_at").is_none_or(|v| v.is_null()) {
            return Ok(record);
        }

        let version = record.get("version").and_then(|v| v.as_i64()).unwrap_or(0);
        record.insert("deleted_at".to_string(), serde_json::Value::Null);
        record.insert("deleted_by".to_string(), serde_json::Value::Null);
        record.insert("version".to_string(), serde_json::json!(version + 1));
        record.insert("updated_at".to_string(), serde_json::json!(now_ms()));
        record.insert("updated_by".to_string(), serde_json::json!(ctx.user_id));

        let mut txn = self.txn.begin().await?;
        match self
            .apply_versioned_write(
                &model,
                entity_name,
                id,
                version,
                &record,
                "entity.restored",
                ctx,
                &mut txn,
            )
            .await
        {
            Ok(()) => {
                self.txn.commit(txn).await?;
                Ok(record)
            }
            Err(e) => {
                rollback_or_warn(self.txn.as_ref(), txn).await;
                Err(e)
            }
        }
    }

    // ─── Bulk ─────────────────────────────────────────────────

    /// Bulk create in one transaction. Items failing validation are skipped
    /// individually and the batch still commits for the rest; any other
    /// failure rolls the whole batch back.
    pub async fn bulk_create(
        &self,
        entity_name: &str,
        items: Vec<Record>,
        ctx: &RequestContext,
    ) -> PlatformResult<Vec<BulkItemResult>> {
        let model = self.model(entity_name, ctx).await?;

        let mut txn = self.txn.begin().await?;
        match self
            .apply_bulk_create(&model, entity_name, items, ctx, &mut txn)
            .await
        {
            Ok(results) => {
                self.txn.commit(txn).await?;
                Ok(results)
            }
            Err(e) => {
                rollback_or_warn(self.txn.as_ref(), txn).await;
                Err(e)
            }
        }
    }

    async fn apply_bulk_create(
        &self,
        model: &CompiledModel,
        entity_name: &str,
        items: Vec<Record>,
        ctx: &RequestContext,
        txn: &mut TxnHandle,
    ) -> PlatformResult<Vec<BulkItemResult>> {
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let record = match self.prepare_create(model, entity_name, item, ctx).await {
                Ok(record) => record,
                // Validation skips the item; anything else fails the batch.
                Err(e @ PlatformError::Validation(_)) => {
                    results.push(BulkItemResult {
                        index,
                        id: None,
                        error: Some(e.to_string()),
                        error_code: Some(e.code().as_str()),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.apply_create(model, entity_name, &record, ctx, txn)
                .await?;
            results.push(BulkItemResult {
                index,
                id: record
                    .get("id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok()),
                error: None,
                error_code: None,
            });
        }
        Ok(results)
    }

    // ─── Transition ───────────────────────────────────────────

    /// `POST /api/data/{entity}/{id}/transition/{operationCode}` delegate.
    pub async fn transition(
        &self,
        entity_name: &str,
        id: Uuid,
        operation_code: &str,
        ctx: &RequestContext,
        payload: Option<serde_json::Value>,
    ) -> PlatformResult<TransitionResult> {
        let model = self.model(entity_name, ctx).await?;
        let record = self.store.get(&model, ctx.tenant_id, id, false, None).await?;
        self.policy
            .enforce(PolicyAction::Update, &model, ctx, record.as_ref())
            .await?;
        self.lifecycle
            .transition(entity_name, id, operation_code, ctx, payload)
            .await
    }

    // ─── Internals ────────────────────────────────────────────

    /// Keep only IR-declared, policy-writable, non-system fields.
    async fn apply_write_filter(
        &self,
        action: PolicyAction,
        model: &CompiledModel,
        ctx: &RequestContext,
        data: Record,
    ) -> PlatformResult<Record> {
        let access = self.policy.allowed_fields(action, model, ctx, Some(&data)).await;
        if access == FieldAccess::None {
            return Err(PlatformError::unauthorized(
                "no writable fields for this principal",
                None,
            ));
        }
        Ok(data
            .into_iter()
            .filter(|(key, _)| {
                model.field(key).is_some()
                    && !SYSTEM_FIELDS.iter().any(|(name, _)| name == key)
                    && access.permits(key)
            })
            .collect())
    }

    /// Every (entity, reference-field, on-delete, active-count) pointing at
    /// the target, across all published entities.
    async fn collect_referrers(
        &self,
        target_entity: &str,
        target_id: Uuid,
        ctx: &RequestContext,
    ) -> PlatformResult<Vec<(String, String, OnDelete, u64)>> {
        let mut out = Vec::new();
        let mut seen_entities = HashSet::new();
        for record in self.registry.list(None).await? {
            let name = record.schema.entity_name.clone();
            if !seen_entities.insert(name.clone()) {
                continue;
            }
            // Unpublished entities have no live tables.
            let Ok(model) = self.model(&name, ctx).await else {
                continue;
            };
            for field in model.references_to(target_entity) {
                let referencing = self
                    .store
                    .referencing_records(&model, ctx.tenant_id, &field.api_name, target_id)
                    .await?;
                out.push((
                    name.clone(),
                    field.api_name.clone(),
                    field.on_delete,
                    referencing.len() as u64,
                ));
            }
        }
        Ok(out)
    }

    /// Dry-run pass over the cascade closure collecting RESTRICT violations.
    #[async_recursion::async_recursion]
    async fn collect_restrict_violations(
        &self,
        entity_name: &str,
        id: Uuid,
        ctx: &RequestContext,
        visited: &mut HashSet<(String, Uuid)>,
        depth: u32,
        violations: &mut Vec<RestrictReferrer>,
    ) -> PlatformResult<()> {
        if depth > MAX_CASCADE_DEPTH || !visited.insert((entity_name.to_string(), id)) {
            return Ok(());
        }
        for (referrer, field, on_delete, count) in
            self.collect_referrers(entity_name, id, ctx).await?
        {
            if count == 0 {
                continue;
            }
            match on_delete {
                OnDelete::Restrict => violations.push(RestrictReferrer {
                    entity: referrer,
                    field,
                    count,
                }),
                OnDelete::Cascade => {
                    let model = self.model(&referrer, ctx).await?;
                    let rows = self
                        .store
                        .referencing_records(&model, ctx.tenant_id, &field, id)
                        .await?;
                    for row in rows {
                        if let Some(row_id) = row
                            .get("id")
                            .and_then(|v| v.as_str())
                            .and_then(|s| Uuid::parse_str(s).ok())
                        {
                            self.collect_restrict_violations(
                                &referrer,
                                row_id,
                                ctx,
                                visited,
                                depth + 1,
                                violations,
                            )
                            .await?;
                        }
                    }
                }
                OnDelete::SetNull | OnDelete::None => {}
            }
        }
        Ok(())
    }

    /// Depth-first soft delete honoring per-field on-delete semantics.
    #[async_recursion::async_recursion]
    async fn soft_delete_recursive(
        &self,
        entity_name: &str,
        id: Uuid,
        ctx: &RequestContext,
        visited: &mut HashSet<(String, Uuid)>,
        depth: u32,
        txn: &mut TxnHandle,
    ) -> PlatformResult<()> {
        if depth > MAX_CASCADE_DEPTH {
            return Err(PlatformError::Validation(vec![FieldViolation {
                rule_id: "delete.depth".to_string(),
                field: entity_name.to_string(),
                message: format!("cascade exceeded depth {MAX_CASCADE_DEPTH}"),
            }]));
        }
        if !visited.insert((entity_name.to_string(), id)) {
            return Ok(());
        }

        // Children first.
        for (referrer, field, on_delete, count) in
            self.collect_referrers(entity_name, id, ctx).await?
        {
            if count == 0 {
                continue;
            }
            let model = self.model(&referrer, ctx).await?;
            match on_delete {
                OnDelete::Cascade => {
                    let rows = self
                        .store
                        .referencing_records(&model, ctx.tenant_id, &field, id)
                        .await?;
                    for row in rows {
                        if let Some(row_id) = row
                            .get("id")
                            .and_then(|v| v.as_str())
                            .and_then(|s| Uuid::parse_str(s).ok())
                        {
                            self.soft_delete_recursive(&referrer, row_id, ctx, visited, depth + 1, txn)
                                .await?;
                        }
                    }
                }
                OnDelete::SetNull => {
                    self.store
                        .null_references(txn, &model, ctx.tenant_id, &field, id)
                        .await?;
                }
                // RESTRICT was checked before any mutation; None is inert.
                OnDelete::Restrict | OnDelete::None => {}
            }
        }

        let model = self.model(entity_name, ctx).await?;
        if let Some(mut record) = self
            .store
            .get(&model, ctx.tenant_id, id, false, None)
            .await?
        {
            let version = record.get("version").and_then(|v| v.as_i64()).unwrap_or(0);
            record.insert("deleted_at".to_string(), serde_json::json!(now_ms()));
            record.insert("deleted_by".to_string(), serde_json::json!(ctx.user_id));
            record.insert("version".to_string(), serde_json::json!(version + 1));
            self.store
                .update_cas(txn, &model, ctx.tenant_id, id, version, &record)
                .await?;
        }
        Ok(())
    }

    /// Stage an audit event on the operation's transaction. A failure here
    /// aborts the operation: the outbox row shares the business write's fate.
    async fn audit_in(
        &self,
        txn: &mut TxnHandle,
        ctx: &RequestContext,
        event_type: &str,
        entity_name: &str,
        id: Uuid,
    ) -> PlatformResult<()> {
        let payload = serde_json::json!({
            "entity": entity_name,
            "entityId": id,
            "actor": ctx.user_id,
            "correlationId": ctx.request_id,
        });
        self.outbox
            .emit_in(txn, ctx.tenant_id, event_type, payload)
            .await?;
        Ok(())
    }
}

/// Project a record through a field-allow set. System fields `id` and
/// `version` always survive so callers can re-read and update.
fn apply_read_filter(record: Record, access: &FieldAccess) -> Record {
    match access {
        FieldAccess::All => record,
        FieldAccess::None => Record::new(),
        FieldAccess::Fields(allowed) => record
            .into_iter()
            .filter(|(key, _)| allowed.contains(key) || key == "id" || key == "version")
            .collect(),
    }
}
