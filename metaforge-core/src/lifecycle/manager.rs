use crate::approval::{ApprovalEngine, InstanceStatus};
use crate::audit::AuditOutbox;
use crate::bus::PlatformMessage;
use crate::compiler::ModelCompiler;
use crate::context::{now_ms, RequestContext, META_APPROVAL_BYPASS};
use crate::error::{PlatformError, PlatformResult};
use crate::lifecycle::model::*;
use crate::lifecycle::routing::RouteCompiler;
use crate::lifecycle::store::LifecycleStore;
use crate::policy::condition::{self, Record};
use crate::policy::PolicyEngine;
use crate::schema::model::PolicyAction;
use crate::timer::service::RecordSource;
use crate::timer::TimerService;
use crate::txn::{rollback_or_warn, TxnHandle, TxnManager};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Operation code recorded on the instance-creation event.
pub const OP_CREATE: &str = "CREATE";

/// The state-machine instance manager: create, transition, gate, terminal
/// enforcement. Transitions within one instance are serialized by a
/// compare-and-set on the prior state.
pub struct LifecycleManager {
    store: Arc<dyn LifecycleStore>,
    routes: Arc<RouteCompiler>,
    compiler: Arc<ModelCompiler>,
    policy: Arc<PolicyEngine>,
    approvals: Arc<ApprovalEngine>,
    timers: Arc<TimerService>,
    records: Arc<dyn RecordSource>,
    outbox: Arc<AuditOutbox>,
    txn: Arc<dyn TxnManager>,
}

impl LifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        routes: Arc<RouteCompiler>,
        compiler: Arc<ModelCompiler>,
        policy: Arc<PolicyEngine>,
        approvals: Arc<ApprovalEngine>,
        timers: Arc<TimerService>,
        records: Arc<dyn RecordSource>,
        outbox: Arc<AuditOutbox>,
        txn: Arc<dyn TxnManager>,
    ) -> Self {
        Self {
            store,
            routes,
            compiler,
            policy,
            approvals,
            timers,
            records,
            outbox,
            txn,
        }
    }

    pub fn store(&self) -> Arc<dyn LifecycleStore> {
        self.store.clone()
    }

    // ─── Create ───────────────────────────────────────────────

    /// Resolve a lifecycle for a freshly created entity and seed its
    /// instance at the initial state, on the caller's transaction. Entities
    /// whose routing resolves nothing simply have no lifecycle.
    pub async fn create_instance(
        &self,
        entity_name: &str,
        entity_id: Uuid,
        ctx: &RequestContext,
        record: Option<&Record>,
        txn: &mut TxnHandle,
    ) -> PlatformResult<Option<LifecycleInstance>> {
        let Some(lifecycle_id) = self.routes.resolve(entity_name, ctx, record).await? else {
            return Ok(None);
        };
        let lifecycle = self
            .store
            .load_lifecycle(lifecycle_id)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("lifecycle {lifecycle_id}")))?;
        let initial = lifecycle
            .initial_state()
            .ok_or_else(|| PlatformError::not_found(format!("initial state of {}", lifecycle.code)))?;

        let instance = LifecycleInstance {
            id: Uuid::now_v7(),
            tenant_id: ctx.tenant_id,
            entity_name: entity_name.to_string(),
            entity_id,
            lifecycle_id,
            state_id: initial.id,
            updated_at: now_ms(),
            updated_by: ctx.user_id,
        };
        self.store.upsert_instance(txn, &instance).await?;

        let event = LifecycleEvent {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            from_state: None,
            to_state: initial.id,
            operation_code: OP_CREATE.to_string(),
            actor: ctx.user_id,
            payload: None,
            correlation_id: ctx.request_id.clone(),
            occurred_at: now_ms(),
        };
        self.store.append_event(txn, &event).await?;

        self.outbox
            .emit_in(
                txn,
                ctx.tenant_id,
                "lifecycle.instance_created",
                serde_json::json!({
                    "entity": entity_name,
                    "entityId": entity_id,
                    "lifecycleId": lifecycle_id,
                    "state": initial.code,
                }),
            )
            .await?;

        Ok(Some(instance))
    }

    /// The current instance for an entity, if routing assigned one.
    pub async fn get_instance(
        &self,
        entity_name: &str,
        entity_id: Uuid,
        ctx: &RequestContext,
    ) -> PlatformResult<Option<LifecycleInstance>> {
        Ok(self
            .store
            .load_instance(ctx.tenant_id, entity_name, entity_id)
            .await?)
    }

    // ─── Transition ───────────────────────────────────────────

    /// Drive one transition:
    /// 1. Load instance and current state; terminal states admit nothing.
    /// 2. Find the active transition for the operation.
    /// 3. Validate every gate (operations, approval, thresholds).
    /// 4. In one transaction: compare-and-set the instance on its prior
    ///    state (a lost race is `StaleState`; callers may re-read and
    ///    retry), append exactly one event, and stage the outbox row.
    /// 5. After commit, cancel timers per policy snapshots.
    pub async fn transition(
        &self,
        entity_name: &str,
        entity_id: Uuid,
        operation_code: &str,
        ctx: &RequestContext,
        payload: Option<serde_json::Value>,
    ) -> PlatformResult<TransitionResult> {
        let instance = self
            .store
            .load_instance(ctx.tenant_id, entity_name, entity_id)
            .await?
            .ok_or_else(|| {
                PlatformError::not_found(format!(
                    "lifecycle instance for {entity_name}/{entity_id}"
                ))
            })?;
        let lifecycle = self
            .store
            .load_lifecycle(instance.lifecycle_id)
            .await?
            .ok_or_else(|| {
                PlatformError::not_found(format!("lifecycle {}", instance.lifecycle_id))
            })?;
        let current = lifecycle
            .state(instance.state_id)
            .ok_or_else(|| PlatformError::not_found(format!("state {}", instance.state_id)))?;
        if current.is_terminal {
            return Err(PlatformError::Terminal(current.code.clone()));
        }

        let transition = lifecycle
            .transition_from(current.id, operation_code)
            .ok_or_else(|| {
                PlatformError::not_found(format!(
                    "no active transition from {} for operation {operation_code}",
                    current.code
                ))
            })?;
        let to_state = lifecycle
            .state(transition.to_state)
            .ok_or_else(|| PlatformError::not_found(format!("state {}", transition.to_state)))?;

        let record = self
            .records
            .fetch(ctx.tenant_id, entity_name, entity_id)
            .await?;

        // 3. Gates.
        for gate in &transition.gates {
            self.check_gate(gate, transition, entity_name, entity_id, operation_code, ctx, record.as_ref())
                .await?;
        }

        // 4. Serialized state swap, its event, and its outbox row commit
        // together.
        let now = now_ms();
        let event = LifecycleEvent {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            from_state: Some(current.id),
            to_state: to_state.id,
            operation_code: operation_code.to_string(),
            actor: ctx.user_id,
            payload,
            correlation_id: ctx.request_id.clone(),
            occurred_at: now,
        };

        let mut txn = self.txn.begin().await?;
        match self
            .apply_transition(&mut txn, &instance, current.id, to_state.id, &event, entity_name, entity_id, &to_state.code, ctx)
            .await
        {
            Ok(()) => self.txn.commit(txn).await?,
            Err(e) => {
                rollback_or_warn(self.txn.as_ref(), txn).await;
                return Err(e);
            }
        }

        // 5. Post-commit bookkeeping.
        if let Err(e) = self
            .timers
            .cancel_after_transition(ctx.tenant_id, entity_name, entity_id, &to_state.code)
            .await
        {
            // Timer bookkeeping never fails the transition.
            tracing::warn!(error = %e, "post-transition timer cancel failed");
        }

        Ok(TransitionResult {
            instance_id: instance.id,
            state_code: to_state.code.clone(),
            event_id: event.id,
        })
    }

    /// The transactional body of `transition`.
    #[allow(clippy::too_many_arguments)]
    async fn apply_transition(
        &self,
        txn: &mut TxnHandle,
        instance: &LifecycleInstance,
        from_state: Uuid,
        to_state: Uuid,
        event: &LifecycleEvent,
        entity_name: &str,
        entity_id: Uuid,
        to_state_code: &str,
        ctx: &RequestContext,
    ) -> PlatformResult<()> {
        let won = self
            .store
            .transition_instance(txn, instance.id, from_state, to_state, ctx.user_id, event.occurred_at)
            .await?;
        if !won {
            return Err(PlatformError::StaleState(format!(
                "instance {} moved past its prior state concurrently",
                instance.id
            )));
        }

        self.store.append_event(txn, event).await?;

        self.outbox
            .emit_in(
                txn,
                ctx.tenant_id,
                "lifecycle.transitioned",
                serde_json::json!({
                    "entity": entity_name,
                    "entityId": entity_id,
                    "operation": event.operation_code,
                    "to": to_state_code,
                    "eventId": event.id,
                }),
            )
            .await?;
        Ok(())
    }

    /// Raised by the data service on update/delete of entities whose
    /// instance sits in a terminal state.
    pub async fn enforce_terminal_state(
        &self,
        entity_name: &str,
        entity_id: Uuid,
        ctx: &RequestContext,
    ) -> PlatformResult<()> {
        let Some(instance) = self
            .store
            .load_instance(ctx.tenant_id, entity_name, entity_id)
            .await?
        else {
            return Ok(());
        };
        let Some(lifecycle) = self.store.load_lifecycle(instance.lifecycle_id).await? else {
            return Ok(());
        };
        if let Some(state) = lifecycle.state(instance.state_id) {
            if state.is_terminal {
                return Err(PlatformError::Terminal(state.code.clone()));
            }
        }
        Ok(())
    }

    /// Every transition leaving the current state, with a per-transition
    /// authorization verdict and approval requirement.
    pub async fn get_available_transitions(
        &self,
        entity_name: &str,
        entity_id: Uuid,
        ctx: &RequestContext,
    ) -> PlatformResult<Vec<AvailableTransition>> {
        let instance = self
            .store
            .load_instance(ctx.tenant_id, entity_name, entity_id)
            .await?
            .ok_or_else(|| {
                PlatformError::not_found(format!(
                    "lifecycle instance for {entity_name}/{entity_id}"
                ))
            })?;
        let lifecycle = self
            .store
            .load_lifecycle(instance.lifecycle_id)
            .await?
            .ok_or_else(|| {
                PlatformError::not_found(format!("lifecycle {}", instance.lifecycle_id))
            })?;
        let record = self
            .records
            .fetch(ctx.tenant_id, entity_name, entity_id)
            .await?;

        let mut available = Vec::new();
        for transition in lifecycle.transitions_from(instance.state_id) {
            let to_code = lifecycle
                .state(transition.to_state)
                .map(|s| s.code.clone())
                .unwrap_or_default();

            let mut authorized = true;
            let mut reason = None;
            let mut requires_approval = false;

            for gate in &transition.gates {
                match self
                    .check_gate(
                        gate,
                        transition,
                        entity_name,
                        entity_id,
                        &transition.operation_code,
                        // Dry run: never create approval instances here.
                        &ctx.with_flag(META_APPROVAL_BYPASS, true),
                        record.as_ref(),
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(e) => {
                        authorized = false;
                        reason = Some(e.to_string());
                    }
                }
                if gate.approval_template_id.is_some()
                    || gate
                        .threshold_rules
                        .iter()
                        .any(|r| r.action == ThresholdAction::RequireApproval
                            && record.as_ref().is_some_and(|rec| {
                                r.trips(rec.get(&r.field).unwrap_or(&serde_json::Value::Null))
                            }))
                {
                    requires_approval = true;
                }
            }

            available.push(AvailableTransition {
                transition_id: transition.id,
                operation_code: transition.operation_code.clone(),
                to_state_code: to_code,
                authorized,
                unauthorized_reason: reason,
                requires_approval,
            });
        }
        Ok(available)
    }

    // ─── Gates ────────────────────────────────────────────────

    /// One gate: scoping conditions, required operations through the policy
    /// engine, the approval sub-workflow, and threshold rules.
    async fn check_gate(
        &self,
        gate: &TransitionGate,
        transition: &LifecycleTransition,
        entity_name: &str,
        entity_id: Uuid,
        operation_code: &str,
        ctx: &RequestContext,
        record: Option<&Record>,
    ) -> PlatformResult<()> {
        // Conditions scope the gate: a non-matching gate does not apply.
        if !gate.conditions.is_empty() {
            match condition::evaluate_all(&gate.conditions, ctx, record) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => {
                    return Err(PlatformError::unauthorized(
                        format!("gate condition evaluation failed: {e}"),
                        None,
                    ))
                }
            }
        }

        // Required operations, first failure wins.
        if !gate.required_operations.is_empty() {
            let model = self.compiler.latest_model(entity_name, &[], ctx).await?;
            for operation in &gate.required_operations {
                let action = operation_to_action(operation);
                let decision = self.policy.authorize(action, &model, ctx, record).await;
                if !decision.allowed {
                    return Err(PlatformError::unauthorized(
                        format!("required operation {operation} denied: {}", decision.reason),
                        decision.matched_rule,
                    ));
                }
            }
        }

        // Thresholds: block outright or escalate to approval.
        let mut approval_required = gate.approval_template_id.is_some();
        for rule in &gate.threshold_rules {
            let value = record
                .and_then(|r| r.get(&rule.field))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            if rule.trips(&value) {
                match rule.action {
                    ThresholdAction::Block => {
                        return Err(PlatformError::unauthorized(
                            format!("threshold on {} blocks {operation_code}", rule.field),
                            None,
                        ));
                    }
                    ThresholdAction::RequireApproval => {
                        if gate.approval_template_id.is_none() {
                            return Err(PlatformError::unauthorized(
                                format!(
                                    "threshold on {} requires approval but the gate names no template",
                                    rule.field
                                ),
                                None,
                            ));
                        }
                        approval_required = true;
                    }
                }
            }
        }

        if approval_required && !ctx.flag(META_APPROVAL_BYPASS) {
            let template_id = gate
                .approval_template_id
                .ok_or_else(|| PlatformError::unauthorized("approval gate has no template", None))?;
            return self
                .check_approval(template_id, transition, entity_name, entity_id, operation_code, ctx, record)
                .await;
        }

        Ok(())
    }

    async fn check_approval(
        &self,
        template_id: Uuid,
        transition: &LifecycleTransition,
        entity_name: &str,
        entity_id: Uuid,
        operation_code: &str,
        ctx: &RequestContext,
        record: Option<&Record>,
    ) -> PlatformResult<()> {
        let existing = self
            .approvals
            .store()
            .latest_instance_for(ctx.tenant_id, entity_name, entity_id)
            .await?;

        match existing.map(|i| (i.status, i)) {
            None => {
                self.approvals
                    .create_instance(
                        entity_name,
                        entity_id,
                        transition.id,
                        operation_code,
                        template_id,
                        ctx,
                        record,
                    )
                    .await?;
                tracing::info!(entity = entity_name, %entity_id, "approval initiated");
                Err(PlatformError::ApprovalPending)
            }
            Some((InstanceStatus::Open, _)) => Err(PlatformError::ApprovalPending),
            Some((InstanceStatus::Rejected, _)) => Err(PlatformError::ApprovalRejected),
            Some((InstanceStatus::Canceled, _)) => Err(PlatformError::ApprovalCanceled),
            Some((InstanceStatus::Completed, _)) => Ok(()),
        }
    }

    // ─── Approval completion loop ─────────────────────────────

    /// Consume one bus message. A completed approval re-runs the gated
    /// transition under a system context with the bypass flag; the loop is
    /// a message hop, never a re-entrant call.
    pub async fn consume(&self, message: PlatformMessage) {
        match message {
            PlatformMessage::ApprovalCompleted {
                approval_id,
                tenant_id,
                realm_id,
                entity_name,
                entity_id,
                operation_code,
                ..
            } => {
                let mut ctx = RequestContext::system(tenant_id, &realm_id, false);
                ctx.request_id = format!("approval-{approval_id}");
                let ctx = ctx.with_flag(META_APPROVAL_BYPASS, true);
                match self
                    .transition(&entity_name, entity_id, &operation_code, &ctx, None)
                    .await
                {
                    Ok(result) => {
                        tracing::info!(%approval_id, state = %result.state_code,
                            "approved transition completed");
                    }
                    Err(e) => {
                        tracing::warn!(%approval_id, error = %e,
                            "approved transition failed after completion");
                    }
                }
            }
            PlatformMessage::ApprovalRejected {
                approval_id,
                entity_name,
                entity_id,
                ..
            } => {
                tracing::info!(%approval_id, entity = %entity_name, %entity_id,
                    "approval rejected; transition stays gated");
            }
        }
    }

    /// Worker loop draining the platform bus until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PlatformMessage>) {
        while let Some(message) = rx.recv().await {
            self.consume(message).await;
        }
    }
}

/// Transition operation codes check against the policy engine as the CRUD
/// action they imply; custom codes authorize as `update` on the resource.
fn operation_to_action(operation: &str) -> PolicyAction {
    match operation.to_ascii_lowercase().as_str() {
        "create" => PolicyAction::Create,
        "read" => PolicyAction::Read,
        "delete" => PolicyAction::Delete,
        _ => PolicyAction::Update,
    }
}
