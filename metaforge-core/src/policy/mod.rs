//! The policy decision engine: indexed rule sets, deny-wins evaluation,
//! field-allow sets, and the decision log.

pub mod condition;
pub mod decision_log;

pub use condition::{Condition, ConditionOp, Record};
pub use decision_log::{DecisionLog, DecisionLogEntry, MemoryDecisionLog};

use crate::compiler::ir::{CompiledModel, CompiledPolicy};
use crate::context::{now_ms, RequestContext};
use crate::error::{PlatformError, PlatformResult};
use crate::schema::model::{PolicyAction, PolicyEffect};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

// ─── Compiled rule set ────────────────────────────────────────

/// One rule after indexing. The field subset is normalized at compile time:
/// a policy with no subset becomes `["*"]`.
#[derive(Clone, Debug)]
pub struct PolicyRule {
    pub id: String,
    pub effect: PolicyEffect,
    pub action: PolicyAction,
    pub resource: String,
    pub conditions: Vec<Condition>,
    pub fields: Vec<String>,
    pub priority: i32,
    /// Roles this rule names in a `ctx.roles in [...]` condition, if any.
    /// Used to skip the rule early for principals holding none of them.
    subjects: Vec<String>,
}

impl PolicyRule {
    fn subject_prefilter_passes(&self, ctx: &RequestContext) -> bool {
        self.subjects.is_empty() || self.subjects.iter().any(|s| ctx.has_role(s))
    }
}

/// Rules indexed three ways: by scope (resource), by operation (action), and
/// by subject (role), plus one priority-ordered list. Higher priority first;
/// on a tie, deny sorts before allow.
pub struct PolicySet {
    ordered: Vec<PolicyRule>,
    by_scope: HashMap<String, Vec<usize>>,
    by_operation: HashMap<PolicyAction, Vec<usize>>,
    by_subject: HashMap<String, Vec<usize>>,
}

impl PolicySet {
    pub fn compile(policies: &[CompiledPolicy]) -> Self {
        let mut ordered: Vec<PolicyRule> = policies
            .iter()
            .map(|p| PolicyRule {
                id: p.name.clone(),
                effect: p.effect,
                action: p.action,
                resource: p.resource.clone(),
                conditions: p.conditions.clone(),
                fields: p.fields.clone().unwrap_or_else(|| vec!["*".to_string()]),
                priority: p.priority,
                subjects: extract_subjects(&p.conditions),
            })
            .collect();

        ordered.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| {
                // Deny evaluates before allow at equal priority.
                let rank = |e: PolicyEffect| match e {
                    PolicyEffect::Deny => 0,
                    PolicyEffect::Allow => 1,
                };
                rank(a.effect).cmp(&rank(b.effect))
            })
        });

        let mut by_scope: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_operation: HashMap<PolicyAction, Vec<usize>> = HashMap::new();
        let mut by_subject: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, rule) in ordered.iter().enumerate() {
            by_scope.entry(rule.resource.clone()).or_default().push(idx);
            by_operation.entry(rule.action).or_default().push(idx);
            for subject in &rule.subjects {
                by_subject.entry(subject.clone()).or_default().push(idx);
            }
        }

        Self {
            ordered,
            by_scope,
            by_operation,
            by_subject,
        }
    }

    /// Candidate rules for a request, in evaluation order: scope index
    /// intersected with the operation (including `*`) index.
    fn candidates(&self, action: PolicyAction, resource: &str) -> Vec<&PolicyRule> {
        let Some(scoped) = self.by_scope.get(resource) else {
            return Vec::new();
        };
        let mut op_indices: BTreeSet<usize> = BTreeSet::new();
        for key in [action, PolicyAction::All] {
            if let Some(indices) = self.by_operation.get(&key) {
                op_indices.extend(indices.iter().copied());
            }
        }
        scoped
            .iter()
            .filter(|idx| op_indices.contains(*idx))
            .map(|idx| &self.ordered[*idx])
            .collect()
    }

    /// Rules naming a specific role subject (introspection/tooling).
    pub fn rules_for_subject(&self, role: &str) -> Vec<&PolicyRule> {
        self.by_subject
            .get(role)
            .map(|indices| indices.iter().map(|i| &self.ordered[*i]).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Roles named by a `roles in [...]` condition.
fn extract_subjects(conditions: &[Condition]) -> Vec<String> {
    conditions
        .iter()
        .filter(|c| {
            matches!(c.op, ConditionOp::In)
                && matches!(c.path.as_str(), "roles" | "ctx.roles")
        })
        .flat_map(|c| {
            c.value
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        })
        .collect()
}

// ─── Decisions ────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub matched_rule: Option<String>,
    pub reason: String,
}

impl Decision {
    fn deny(matched_rule: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            matched_rule,
            reason: reason.into(),
        }
    }

    fn allow(matched_rule: String) -> Self {
        Self {
            allowed: true,
            matched_rule: Some(matched_rule),
            reason: "matched allow".to_string(),
        }
    }
}

/// Field-allow set for an (action, resource, principal) combination.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldAccess {
    All,
    Fields(BTreeSet<String>),
    None,
}

impl FieldAccess {
    pub fn permits(&self, field: &str) -> bool {
        match self {
            FieldAccess::All => true,
            FieldAccess::Fields(fields) => fields.contains(field),
            FieldAccess::None => false,
        }
    }
}

/// One item of an `authorize_many` batch.
pub struct AccessRequest {
    pub action: PolicyAction,
    pub resource: String,
    pub record: Option<Record>,
}

// ─── Engine ───────────────────────────────────────────────────

/// The policy decision engine. Holds a per-process cache of compiled rule
/// sets keyed by the model's output hash, so a batch compiles each resource
/// at most once.
pub struct PolicyEngine {
    log: Arc<dyn DecisionLog>,
    sets: Mutex<HashMap<String, Arc<PolicySet>>>,
}

impl PolicyEngine {
    pub fn new(log: Arc<dyn DecisionLog>) -> Self {
        Self {
            log,
            sets: Mutex::new(HashMap::new()),
        }
    }

    /// Compiled rule set for a model, cached by output hash.
    pub fn rule_set(&self, model: &CompiledModel) -> Arc<PolicySet> {
        if let Ok(mut sets) = self.sets.lock() {
            if let Some(set) = sets.get(&model.output_hash) {
                return set.clone();
            }
            let set = Arc::new(PolicySet::compile(&model.policies));
            sets.insert(model.output_hash.clone(), set.clone());
            return set;
        }
        Arc::new(PolicySet::compile(&model.policies))
    }

    /// Decision function. Deny rules are evaluated first; any match denies.
    /// Allow rules then run in descending priority; first match allows.
    /// No match denies. Any evaluation failure denies (fail secure).
    pub async fn authorize(
        &self,
        action: PolicyAction,
        model: &CompiledModel,
        ctx: &RequestContext,
        record: Option<&Record>,
    ) -> Decision {
        let set = self.rule_set(model);
        let decision = evaluate_decision(&set, action, &model.entity_name, ctx, record);
        self.log_decision(&decision, action, &model.entity_name, ctx)
            .await;
        decision
    }

    /// `authorize` that raises `Unauthorized` on deny.
    pub async fn enforce(
        &self,
        action: PolicyAction,
        model: &CompiledModel,
        ctx: &RequestContext,
        record: Option<&Record>,
    ) -> PlatformResult<()> {
        let decision = self.authorize(action, model, ctx, record).await;
        if decision.allowed {
            Ok(())
        } else {
            Err(PlatformError::unauthorized(
                decision.reason,
                decision.matched_rule,
            ))
        }
    }

    /// Field-allow set: ∅ when a matching deny applies or nothing allows;
    /// ALL when a matching allow carries `*`; otherwise the union of allow
    /// subsets.
    pub async fn allowed_fields(
        &self,
        action: PolicyAction,
        model: &CompiledModel,
        ctx: &RequestContext,
        record: Option<&Record>,
    ) -> FieldAccess {
        let set = self.rule_set(model);
        let candidates = set.candidates(action, &model.entity_name);

        let mut union: BTreeSet<String> = BTreeSet::new();
        let mut all = false;
        let mut any_allow = false;

        for rule in &candidates {
            if rule.effect != PolicyEffect::Deny {
                continue;
            }
            if !rule.subject_prefilter_passes(ctx) {
                continue;
            }
            match condition::evaluate_all(&rule.conditions, ctx, record) {
                Ok(true) => return FieldAccess::None,
                Ok(false) => {}
                Err(_) => return FieldAccess::None,
            }
        }

        for rule in &candidates {
            if rule.effect != PolicyEffect::Allow {
                continue;
            }
            if !rule.subject_prefilter_passes(ctx) {
                continue;
            }
            match condition::evaluate_all(&rule.conditions, ctx, record) {
                Ok(true) => {
                    any_allow = true;
                    if rule.fields.iter().any(|f| f == "*") {
                        all = true;
                    } else {
                        union.extend(rule.fields.iter().cloned());
                    }
                }
                Ok(false) => {}
                Err(_) => return FieldAccess::None,
            }
        }

        if all {
            FieldAccess::All
        } else if any_allow {
            FieldAccess::Fields(union)
        } else {
            FieldAccess::None
        }
    }

    /// Batch path: groups by resource so each rule set compiles at most once
    /// per call (the per-engine cache makes repeat calls free as well).
    pub async fn authorize_many(
        &self,
        requests: &[AccessRequest],
        models: &HashMap<String, Arc<CompiledModel>>,
        ctx: &RequestContext,
    ) -> Vec<Decision> {
        let mut decisions = Vec::with_capacity(requests.len());
        for request in requests {
            match models.get(&request.resource) {
                Some(model) => {
                    decisions.push(
                        self.authorize(request.action, model, ctx, request.record.as_ref())
                            .await,
                    );
                }
                None => decisions.push(Decision::deny(
                    None,
                    format!("no model for resource {}", request.resource),
                )),
            }
        }
        decisions
    }

    async fn log_decision(
        &self,
        decision: &Decision,
        action: PolicyAction,
        resource: &str,
        ctx: &RequestContext,
    ) {
        let entry = DecisionLogEntry {
            tenant_id: ctx.tenant_id,
            occurred_at: now_ms(),
            actor: ctx.user_id,
            resource: resource.to_string(),
            operation: format!("{action:?}").to_lowercase(),
            effect: if decision.allowed { "allow" } else { "deny" }.to_string(),
            matched_rule_id: decision.matched_rule.clone(),
            reason: decision.reason.clone(),
            correlation_id: ctx.request_id.clone(),
        };
        if let Err(e) = self.log.append(entry).await {
            // Never flip the decision over a log failure.
            tracing::warn!(error = %e, "decision log append failed");
        }
    }
}

fn evaluate_decision(
    set: &PolicySet,
    action: PolicyAction,
    resource: &str,
    ctx: &RequestContext,
    record: Option<&Record>,
) -> Decision {
    let candidates = set.candidates(action, resource);

    // Deny rules first; any match wins.
    for rule in &candidates {
        if rule.effect != PolicyEffect::Deny {
            continue;
        }
        if !rule.subject_prefilter_passes(ctx) {
            continue;
        }
        match condition::evaluate_all(&rule.conditions, ctx, record) {
            Ok(true) => return Decision::deny(Some(rule.id.clone()), "matched deny"),
            Ok(false) => {}
            Err(e) => {
                return Decision::deny(
                    Some(rule.id.clone()),
                    format!("evaluation failed: {e}"),
                )
            }
        }
    }

    // Allow rules in descending priority; first match wins.
    for rule in &candidates {
        if rule.effect != PolicyEffect::Allow {
            continue;
        }
        if !rule.subject_prefilter_passes(ctx) {
            continue;
        }
        match condition::evaluate_all(&rule.conditions, ctx, record) {
            Ok(true) => return Decision::allow(rule.id.clone()),
            Ok(false) => {}
            Err(e) => {
                return Decision::deny(
                    Some(rule.id.clone()),
                    format!("evaluation failed: {e}"),
                )
            }
        }
    }

    Decision::deny(None, "no matching allow")
}
