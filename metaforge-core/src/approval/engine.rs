use crate::approval::model::*;
use crate::approval::store::ApprovalStore;
use crate::audit::AuditOutbox;
use crate::bus::{PlatformBus, PlatformMessage};
use crate::context::{now_ms, RequestContext};
use crate::error::{FieldViolation, PlatformError, PlatformResult};
use crate::identity::IdentityProvider;
use crate::policy::condition::{self, Record};
use std::sync::Arc;
use uuid::Uuid;

/// Metadata flag letting an administrator decide a task they are not
/// assigned to.
pub const META_APPROVAL_OVERRIDE: &str = "_approvalOverride";

/// The approval engine: materializes instances from compiled templates,
/// accepts decisions, aggregates stages and instances, and announces
/// completion on the platform bus.
pub struct ApprovalEngine {
    store: Arc<dyn ApprovalStore>,
    identity: Arc<dyn IdentityProvider>,
    outbox: Arc<AuditOutbox>,
    bus: PlatformBus,
}

impl ApprovalEngine {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        identity: Arc<dyn IdentityProvider>,
        outbox: Arc<AuditOutbox>,
        bus: PlatformBus,
    ) -> Self {
        Self {
            store,
            identity,
            outbox,
            bus,
        }
    }

    pub fn store(&self) -> Arc<dyn ApprovalStore> {
        self.store.clone()
    }

    // ─── Create ───────────────────────────────────────────────

    /// Materialize an approval instance:
    /// 1. Load the compiled template.
    /// 2. Stages in `stage_no` order, all `open`; the lowest-numbered open
    ///    stage is the active one.
    /// 3. Per stage, the first matching assignment rule (priority order)
    ///    resolves to concrete assignees; unresolved falls back to the
    ///    template default reviewer.
    /// 4. An assignment snapshot is frozen per task.
    pub async fn create_instance(
        &self,
        entity_name: &str,
        entity_id: Uuid,
        transition_id: Uuid,
        operation_code: &str,
        template_id: Uuid,
        ctx: &RequestContext,
        assignment_context: Option<&Record>,
    ) -> PlatformResult<ApprovalInstance> {
        let template = self
            .store
            .load_template(template_id)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("approval template {template_id}")))?;
        if !template.is_active {
            return Err(PlatformError::Validation(vec![FieldViolation {
                rule_id: "template.active".to_string(),
                field: "templateId".to_string(),
                message: format!("approval template {} is inactive", template.code),
            }]));
        }

        let instance = ApprovalInstance {
            id: Uuid::now_v7(),
            tenant_id: ctx.tenant_id,
            entity_name: entity_name.to_string(),
            entity_id,
            transition_id,
            operation_code: operation_code.to_string(),
            template_id,
            status: InstanceStatus::Open,
            context_reason: None,
            created_at: now_ms(),
            created_by: ctx.user_id,
        };

        let mut stages = Vec::new();
        let mut tasks = Vec::new();
        let mut snapshots = Vec::new();

        for template_stage in template.ordered_stages() {
            let stage_id = Uuid::now_v7();

            let (assignees, task_type, rule_id, resolved_desc) = self
                .resolve_stage_assignment(&template, template_stage.stage_no, ctx, assignment_context)
                .await?;

            let quorum = template_stage
                .quorum
                .map(|q| q.resolved(assignees.len() as u32));

            stages.push(ApprovalStage {
                id: stage_id,
                instance_id: instance.id,
                stage_no: template_stage.stage_no,
                mode: template_stage.mode,
                quorum,
                status: StageStatus::Open,
                outcome: None,
            });

            let due_at = template.task_due_ms.map(|ms| now_ms() + ms);
            for assignee in assignees {
                let task_id = Uuid::now_v7();
                tasks.push(ApprovalTask {
                    id: task_id,
                    instance_id: instance.id,
                    stage_id,
                    assignee,
                    task_type,
                    status: TaskStatus::Pending,
                    decided_at: None,
                    decided_by: None,
                    note: None,
                    due_at,
                });
                snapshots.push(AssignmentSnapshot {
                    id: Uuid::now_v7(),
                    task_id,
                    rule_id,
                    template_version: template.version_no,
                    resolved: resolved_desc.clone(),
                });
            }
        }

        self.store
            .create_instance_graph(&instance, &stages, &tasks, &snapshots)
            .await?;

        self.audit(
            ctx,
            "approval.created",
            serde_json::json!({
                "approvalId": instance.id,
                "entity": entity_name,
                "entityId": entity_id,
                "templateId": template_id,
                "stages": stages.len(),
                "tasks": tasks.len(),
            }),
        )
        .await;

        Ok(instance)
    }

    /// First matching rule wins; fall back to the template default reviewer.
    async fn resolve_stage_assignment(
        &self,
        template: &ApprovalTemplate,
        stage_no: u32,
        ctx: &RequestContext,
        assignment_context: Option<&Record>,
    ) -> PlatformResult<(Vec<Uuid>, TaskType, Option<Uuid>, serde_json::Value)> {
        for rule in template.rules_for_stage(stage_no) {
            match condition::evaluate_all(&rule.conditions, ctx, assignment_context) {
                Ok(true) => {
                    let assignees = self.resolve_assignee(&rule.assign_to, ctx.tenant_id).await?;
                    if assignees.is_empty() {
                        continue;
                    }
                    let resolved = serde_json::json!({
                        "assignTo": rule.assign_to,
                        "assignees": assignees,
                    });
                    return Ok((assignees, rule.task_type, Some(rule.id), resolved));
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(rule = %rule.id, error = %e,
                        "assignment rule evaluation failed; skipping");
                }
            }
        }

        if let Some(fallback) = &template.default_reviewer {
            let assignees = self.resolve_assignee(fallback, ctx.tenant_id).await?;
            if !assignees.is_empty() {
                let resolved = serde_json::json!({
                    "assignTo": fallback,
                    "assignees": assignees,
                    "fallback": true,
                });
                return Ok((assignees, TaskType::Reviewer, None, resolved));
            }
        }

        Err(PlatformError::Validation(vec![FieldViolation {
            rule_id: "assignment.unresolved".to_string(),
            field: format!("stage:{stage_no}"),
            message: format!(
                "no assignment rule resolved assignees for stage {stage_no} of template {}",
                template.code
            ),
        }]))
    }

    async fn resolve_assignee(
        &self,
        assignee: &Assignee,
        tenant_id: Uuid,
    ) -> PlatformResult<Vec<Uuid>> {
        let resolved = match assignee {
            Assignee::Principal { id } => vec![*id],
            Assignee::Role { role } => self.identity.principals_with_role(tenant_id, role).await?,
            Assignee::Group { group } => self.identity.members_of_group(tenant_id, group).await?,
        };
        Ok(resolved)
    }

    // ─── Decide ───────────────────────────────────────────────

    /// Record one decision and run stage/instance aggregation. Returns the
    /// instance status after aggregation.
    pub async fn decide(
        &self,
        task_id: Uuid,
        verb: DecisionVerb,
        note: Option<&str>,
        ctx: &RequestContext,
    ) -> PlatformResult<InstanceStatus> {
        let task = self
            .store
            .load_task(task_id)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("approval task {task_id}")))?;
        let instance = self
            .store
            .load_instance(task.instance_id)
            .await?
            .ok_or_else(|| {
                PlatformError::not_found(format!("approval instance {}", task.instance_id))
            })?;

        if instance.status.is_terminal() {
            return Err(PlatformError::NotPending(format!(
                "approval instance is {:?}",
                instance.status
            )));
        }
        if task.status != TaskStatus::Pending {
            return Err(PlatformError::NotPending(format!(
                "task is {:?}",
                task.status
            )));
        }

        let stages = self.store.load_stages(instance.id).await?;
        let active_stage = stages
            .iter()
            .find(|s| s.status == StageStatus::Open)
            .ok_or_else(|| PlatformError::NotPending("no open stage".to_string()))?;
        if task.stage_id != active_stage.id {
            return Err(PlatformError::NotPending(
                "task belongs to a stage that is not yet active".to_string(),
            ));
        }

        // Serial stages process approver tasks in order.
        if active_stage.mode == StageMode::Serial && task.task_type == TaskType::Approver {
            let stage_tasks = self.store.load_tasks(active_stage.id).await?;
            let next_pending = stage_tasks
                .iter()
                .find(|t| t.task_type == TaskType::Approver && t.status == TaskStatus::Pending);
            if next_pending.is_some_and(|t| t.id != task.id) {
                return Err(PlatformError::NotPending(
                    "an earlier approver task is still pending".to_string(),
                ));
            }
        }

        let override_allowed = ctx.flag(META_APPROVAL_OVERRIDE);
        if task.assignee != ctx.user_id && !override_allowed {
            return Err(PlatformError::unauthorized(
                "task is assigned to a different principal",
                None,
            ));
        }

        let status = match verb {
            DecisionVerb::Approve => TaskStatus::Approved,
            DecisionVerb::Reject => TaskStatus::Rejected,
        };
        let accepted = self
            .store
            .decide_task(task_id, status, ctx.user_id, now_ms(), note)
            .await?;
        if !accepted {
            return Err(PlatformError::NotPending("task is no longer pending".to_string()));
        }

        self.audit(
            ctx,
            "approval.decided",
            serde_json::json!({
                "approvalId": instance.id,
                "taskId": task_id,
                "decision": verb,
                "note": note,
            }),
        )
        .await;

        self.aggregate(&instance, ctx).await
    }

    /// Mark overdue pending tasks expired and re-aggregate the affected
    /// instances. Returns how many tasks expired.
    pub async fn expire_overdue_tasks(&self, ctx: &RequestContext) -> PlatformResult<u32> {
        let overdue = self.store.overdue_tasks(now_ms()).await?;
        let mut expired = 0u32;
        let mut touched: Vec<Uuid> = Vec::new();

        for task in overdue {
            let accepted = self
                .store
                .decide_task(task.id, TaskStatus::Expired, Uuid::nil(), now_ms(), None)
                .await?;
            if accepted {
                expired += 1;
                if !touched.contains(&task.instance_id) {
                    touched.push(task.instance_id);
                }
                self.audit(
                    ctx,
                    "approval.task_expired",
                    serde_json::json!({"taskId": task.id, "approvalId": task.instance_id}),
                )
                .await;
            }
        }

        for instance_id in touched {
            if let Some(instance) = self.store.load_instance(instance_id).await? {
                if !instance.status.is_terminal() {
                    self.aggregate(&instance, ctx).await?;
                }
            }
        }
        Ok(expired)
    }

    /// Cancel an open instance (entity deleted, transition withdrawn).
    pub async fn cancel_instance(
        &self,
        instance_id: Uuid,
        reason: &str,
        ctx: &RequestContext,
    ) -> PlatformResult<()> {
        let instance = self
            .store
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("approval instance {instance_id}")))?;
        if instance.status.is_terminal() {
            return Err(PlatformError::NotPending(format!(
                "approval instance is {:?}",
                instance.status
            )));
        }

        self.cancel_open_work(&instance).await?;
        self.store
            .update_instance_status(instance_id, InstanceStatus::Canceled, Some(reason))
            .await?;
        self.audit(
            ctx,
            "approval.canceled",
            serde_json::json!({"approvalId": instance_id, "reason": reason}),
        )
        .await;
        Ok(())
    }

    // ─── Aggregation ──────────────────────────────────────────

    /// Stage aggregation, then instance aggregation. On a completed
    /// instance, the gated transition is re-run via a bus message; never
    /// an in-place call back into the lifecycle manager.
    async fn aggregate(
        &self,
        instance: &ApprovalInstance,
        ctx: &RequestContext,
    ) -> PlatformResult<InstanceStatus> {
        let stages = self.store.load_stages(instance.id).await?;

        for stage in &stages {
            if stage.status != StageStatus::Open {
                continue;
            }
            let tasks = self.store.load_tasks(stage.id).await?;
            if let Some(outcome) = stage_outcome(stage, &tasks) {
                self.store
                    .update_stage(stage.id, StageStatus::Completed, Some(outcome))
                    .await?;
                if outcome == StageOutcome::Rejected {
                    break;
                }
            } else {
                // The active stage is still in flight; later stages wait.
                break;
            }
        }

        let stages = self.store.load_stages(instance.id).await?;
        let rejected = stages
            .iter()
            .any(|s| s.outcome == Some(StageOutcome::Rejected));
        let all_approved = stages
            .iter()
            .all(|s| s.status == StageStatus::Completed && s.outcome == Some(StageOutcome::Approved));

        if rejected {
            self.cancel_open_work(instance).await?;
            self.store
                .update_instance_status(instance.id, InstanceStatus::Rejected, Some(REASON_REJECTED))
                .await?;
            self.audit(
                ctx,
                "approval.rejected",
                serde_json::json!({"approvalId": instance.id}),
            )
            .await;
            self.bus.publish(PlatformMessage::ApprovalRejected {
                approval_id: instance.id,
                tenant_id: instance.tenant_id,
                entity_name: instance.entity_name.clone(),
                entity_id: instance.entity_id,
            });
            return Ok(InstanceStatus::Rejected);
        }

        if all_approved && !stages.is_empty() {
            self.store
                .update_instance_status(instance.id, InstanceStatus::Completed, None)
                .await?;
            self.audit(
                ctx,
                "approval.completed",
                serde_json::json!({"approvalId": instance.id}),
            )
            .await;
            self.bus.publish(PlatformMessage::ApprovalCompleted {
                approval_id: instance.id,
                tenant_id: instance.tenant_id,
                realm_id: ctx.realm_id.clone(),
                entity_name: instance.entity_name.clone(),
                entity_id: instance.entity_id,
                transition_id: instance.transition_id,
                operation_code: instance.operation_code.clone(),
            });
            return Ok(InstanceStatus::Completed);
        }

        Ok(InstanceStatus::Open)
    }

    /// Cancel every still-pending task and still-open stage of an instance.
    async fn cancel_open_work(&self, instance: &ApprovalInstance) -> PlatformResult<()> {
        for task in self.store.load_tasks_for_instance(instance.id).await? {
            if task.status == TaskStatus::Pending {
                self.store
                    .decide_task(task.id, TaskStatus::Canceled, Uuid::nil(), now_ms(), None)
                    .await?;
            }
        }
        for stage in self.store.load_stages(instance.id).await? {
            if stage.status == StageStatus::Open {
                self.store
                    .update_stage(stage.id, StageStatus::Canceled, stage.outcome)
                    .await?;
            }
        }
        Ok(())
    }

    async fn audit(&self, ctx: &RequestContext, event_type: &str, payload: serde_json::Value) {
        if let Err(e) = self.outbox.emit(ctx.tenant_id, event_type, payload).await {
            tracing::warn!(event_type, error = %e, "approval audit emit failed");
        }
    }
}

/// Completion rule for one stage, or `None` while it is still in flight.
///
/// Serial (and parallel without quorum): every approver must approve; any
/// reject rejects; an expired or canceled approver makes approval
/// unreachable. Quorum: `approved ≥ required` approves; the stage rejects as
/// soon as the remaining pending tasks cannot reach the quorum.
fn stage_outcome(stage: &ApprovalStage, tasks: &[ApprovalTask]) -> Option<StageOutcome> {
    let approvers: Vec<&ApprovalTask> = tasks
        .iter()
        .filter(|t| t.task_type == TaskType::Approver)
        .collect();
    if approvers.is_empty() {
        // Reviewer/watcher-only stages complete immediately.
        return Some(StageOutcome::Approved);
    }

    let approved = approvers
        .iter()
        .filter(|t| t.status == TaskStatus::Approved)
        .count() as u32;
    let pending = approvers
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .count() as u32;
    let rejected = approvers
        .iter()
        .any(|t| t.status == TaskStatus::Rejected);

    if rejected {
        return Some(StageOutcome::Rejected);
    }

    match stage.quorum {
        Some(quorum) => {
            if approved >= quorum.required_count {
                Some(StageOutcome::Approved)
            } else if approved + pending < quorum.required_count {
                Some(StageOutcome::Rejected)
            } else {
                None
            }
        }
        None => {
            if approved == approvers.len() as u32 {
                Some(StageOutcome::Approved)
            } else if pending + approved < approvers.len() as u32 {
                // Someone expired or was canceled: full approval unreachable.
                Some(StageOutcome::Rejected)
            } else {
                None
            }
        }
    }
}
