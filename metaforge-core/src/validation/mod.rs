//! The validation engine: a per-entity rule graph with typed rule kinds,
//! executed at persist and transition phases.

pub mod rules;

pub use rules::{RuleKind, RulePhase, RuleSeverity, RuleTrigger, ValidationRule};

use crate::cache::KvStore;
use crate::compiler::ir::CompiledModel;
use crate::context::RequestContext;
use crate::error::{FieldViolation, PlatformError, PlatformResult};
use crate::policy::condition::{self, Record};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ─── Record lookups (referential / unique) ────────────────────

/// Store-side lookups the engine needs. `reference_exists` returns `None`
/// when the target entity itself is unknown; reported as a warning, not a
/// hard error.
#[async_trait]
pub trait RecordLookup: Send + Sync {
    async fn reference_exists(
        &self,
        tenant_id: Uuid,
        target_entity: &str,
        id: &serde_json::Value,
    ) -> Result<Option<bool>>;

    async fn duplicate_exists(
        &self,
        tenant_id: Uuid,
        entity: &str,
        field: &str,
        value: &serde_json::Value,
        scope: &[(String, serde_json::Value)],
        exclude_id: Option<Uuid>,
    ) -> Result<bool>;
}

// ─── Outcome ──────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct RuleViolation {
    pub rule_id: String,
    pub field: String,
    pub severity: RuleSeverity,
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub struct ValidationOutcome {
    pub errors: Vec<RuleViolation>,
    pub warnings: Vec<RuleViolation>,
}

impl ValidationOutcome {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, violation: RuleViolation) {
        match violation.severity {
            RuleSeverity::Error => self.errors.push(violation),
            RuleSeverity::Warning => self.warnings.push(violation),
        }
    }

    /// Raise `Validation` when any error-severity violation accumulated.
    pub fn into_result(self) -> PlatformResult<Vec<RuleViolation>> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(PlatformError::Validation(
                self.errors
                    .into_iter()
                    .map(|v| FieldViolation {
                        rule_id: v.rule_id,
                        field: v.field,
                        message: v.message,
                    })
                    .collect(),
            ))
        }
    }
}

// ─── Engine ───────────────────────────────────────────────────

/// The validation engine. Rule graphs are derived from the IR, cached
/// in-process by model output hash and written through to the shared KV
/// keyed by (entity, version).
pub struct ValidationEngine {
    lookup: Arc<dyn RecordLookup>,
    l2: Arc<dyn KvStore>,
    graphs: Mutex<HashMap<String, Arc<Vec<ValidationRule>>>>,
}

impl ValidationEngine {
    pub fn new(lookup: Arc<dyn RecordLookup>, l2: Arc<dyn KvStore>) -> Self {
        Self {
            lookup,
            l2,
            graphs: Mutex::new(HashMap::new()),
        }
    }

    /// Compiled rule graph for a model: constraint rules derived from the IR
    /// followed by rules declared in model metadata under `validationRules`.
    pub async fn graph_for(&self, model: &CompiledModel) -> Arc<Vec<ValidationRule>> {
        if let Ok(graphs) = self.graphs.lock() {
            if let Some(graph) = graphs.get(&model.output_hash) {
                return graph.clone();
            }
        }

        let mut graph = rules::rules_from_model(model);
        if let Some(declared) = model.metadata.get("validationRules") {
            match serde_json::from_value::<Vec<ValidationRule>>(declared.clone()) {
                Ok(mut extra) => graph.append(&mut extra),
                Err(e) => {
                    tracing::warn!(entity = %model.entity_name, error = %e,
                        "declared validation rules are malformed; ignoring");
                }
            }
        }

        let graph = Arc::new(graph);
        if let Ok(mut graphs) = self.graphs.lock() {
            graphs.insert(model.output_hash.clone(), graph.clone());
        }
        let key = format!("rules:{}:{}", model.entity_name, model.version);
        if let Ok(json) = serde_json::to_string(graph.as_ref()) {
            if let Err(e) = self.l2.setex(&key, &json, 3600).await {
                tracing::warn!(key, error = %e, "rule graph L2 write failed");
            }
        }
        graph
    }

    /// Execute the graph:
    /// 1. Keep rules whose `applies_on` includes the trigger (or `all`) and
    ///    whose phase matches.
    /// 2. Run in declaration order; each rule yields at most one violation.
    /// 3. Violations accumulate by severity; valid ⇔ no errors.
    pub async fn execute(
        &self,
        graph: &[ValidationRule],
        data: &Record,
        trigger: RuleTrigger,
        phase: RulePhase,
        ctx: &RequestContext,
        existing: Option<&Record>,
    ) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();
        for rule in graph {
            if rule.phase != phase || !rule.applies_to(trigger) {
                continue;
            }
            self.run_rule(rule, None, data, ctx, existing, &mut outcome)
                .await;
        }
        outcome
    }

    /// Evaluate one rule, recursing into `conditional` children. A parent
    /// with error severity escalates its children's violations.
    #[async_recursion::async_recursion]
    async fn run_rule(
        &self,
        rule: &ValidationRule,
        escalate: Option<RuleSeverity>,
        data: &Record,
        ctx: &RequestContext,
        existing: Option<&Record>,
        outcome: &mut ValidationOutcome,
    ) {
        let severity = match escalate {
            Some(RuleSeverity::Error) => RuleSeverity::Error,
            _ => rule.severity,
        };
        let value = data
            .get(&rule.field_path)
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let failure: Option<String> = match &rule.kind {
            RuleKind::Required => check_required(&value),
            RuleKind::MinMax { min, max } => check_min_max(&value, *min, *max),
            RuleKind::Length {
                min_length,
                max_length,
            } => check_length(&value, *min_length, *max_length),
            RuleKind::Regex { pattern } => check_regex(&value, pattern),
            RuleKind::Enum { values } => check_enum(&value, values),
            RuleKind::CrossField { compare_field, op } => {
                let other = data
                    .get(compare_field)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                match condition::compare_values(*op, &value, &other) {
                    Ok(true) => None,
                    Ok(false) => Some(format!(
                        "must be {op:?} field `{compare_field}`"
                    )),
                    Err(e) => Some(format!("cross-field comparison failed: {e}")),
                }
            }
            RuleKind::Conditional { when, then } => {
                match condition::evaluate_all(when, ctx, Some(data)) {
                    Ok(true) => {
                        for child in then {
                            self.run_rule(child, Some(severity), data, ctx, existing, outcome)
                                .await;
                        }
                        None
                    }
                    Ok(false) => None,
                    Err(e) => Some(format!("condition group failed: {e}")),
                }
            }
            RuleKind::DateRange {
                after_field,
                before_field,
                min_date,
                max_date,
            } => check_date_range(
                &value,
                data,
                after_field.as_deref(),
                before_field.as_deref(),
                min_date.as_deref(),
                max_date.as_deref(),
            ),
            RuleKind::Referential { target_entity } => {
                if value.is_null() {
                    None
                } else {
                    match self
                        .lookup
                        .reference_exists(ctx.tenant_id, target_entity, &value)
                        .await
                    {
                        Ok(Some(true)) => None,
                        Ok(Some(false)) => {
                            Some(format!("referenced {target_entity} does not exist"))
                        }
                        Ok(None) => {
                            // Unknown target entity: downgrade to warning.
                            outcome.push(RuleViolation {
                                rule_id: rule.id.clone(),
                                field: rule.field_path.clone(),
                                severity: RuleSeverity::Warning,
                                message: format!("reference target {target_entity} is unknown"),
                            });
                            None
                        }
                        Err(e) => {
                            outcome.push(RuleViolation {
                                rule_id: rule.id.clone(),
                                field: rule.field_path.clone(),
                                severity: RuleSeverity::Warning,
                                message: format!("reference lookup failed: {e}"),
                            });
                            None
                        }
                    }
                }
            }
            RuleKind::Unique { scope_fields } => {
                if value.is_null() {
                    None
                } else {
                    let scope: Vec<(String, serde_json::Value)> = scope_fields
                        .iter()
                        .map(|f| {
                            (
                                f.clone(),
                                data.get(f).cloned().unwrap_or(serde_json::Value::Null),
                            )
                        })
                        .collect();
                    let exclude_id = existing
                        .and_then(|r| r.get("id"))
                        .or_else(|| data.get("id"))
                        .and_then(|v| v.as_str())
                        .and_then(|s| Uuid::parse_str(s).ok());
                    match self
                        .lookup
                        .duplicate_exists(
                            ctx.tenant_id,
                            &rule.entity,
                            &rule.field_path,
                            &value,
                            &scope,
                            exclude_id,
                        )
                        .await
                    {
                        Ok(true) => Some("value must be unique".to_string()),
                        Ok(false) => None,
                        Err(e) => Some(format!("uniqueness check failed: {e}")),
                    }
                }
            }
        };

        if let Some(message) = failure {
            outcome.push(RuleViolation {
                rule_id: rule.id.clone(),
                field: rule.field_path.clone(),
                severity,
                message: rule.message.clone().unwrap_or(message),
            });
        }
    }
}

// ─── Per-kind checks ──────────────────────────────────────────

fn check_required(value: &serde_json::Value) -> Option<String> {
    let empty = match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    };
    empty.then(|| "value is required".to_string())
}

fn check_min_max(value: &serde_json::Value, min: Option<f64>, max: Option<f64>) -> Option<String> {
    if value.is_null() {
        return None;
    }
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    let Some(number) = number else {
        return Some("value is not a number".to_string());
    };
    if number.is_nan() {
        return Some("value is not a number".to_string());
    }
    if let Some(lo) = min {
        if number < lo {
            return Some(format!("value {number} is below minimum {lo}"));
        }
    }
    if let Some(hi) = max {
        if number > hi {
            return Some(format!("value {number} is above maximum {hi}"));
        }
    }
    None
}

fn check_length(
    value: &serde_json::Value,
    min_length: Option<u32>,
    max_length: Option<u32>,
) -> Option<String> {
    if value.is_null() {
        return None;
    }
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let len = text.chars().count() as u32;
    if let Some(lo) = min_length {
        if len < lo {
            return Some(format!("length {len} is below minimum {lo}"));
        }
    }
    if let Some(hi) = max_length {
        if len > hi {
            return Some(format!("length {len} is above maximum {hi}"));
        }
    }
    None
}

fn check_regex(value: &serde_json::Value, pattern: &str) -> Option<String> {
    let regex = match regex::Regex::new(pattern) {
        Ok(r) => r,
        // Invalid patterns are a rule defect, reported on the rule itself.
        Err(e) => return Some(format!("invalid pattern `{pattern}`: {e}")),
    };
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => {
            (!regex.is_match(s)).then(|| format!("value does not match `{pattern}`"))
        }
        other => (!regex.is_match(&other.to_string()))
            .then(|| format!("value does not match `{pattern}`")),
    }
}

fn check_enum(value: &serde_json::Value, allowed: &[String]) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => (!allowed.iter().any(|a| a == s))
            .then(|| format!("value `{s}` is not one of {allowed:?}")),
        other => Some(format!("value {other} is not one of {allowed:?}")),
    }
}

/// Parse a date value: RFC 3339, bare date, or epoch milliseconds.
fn parse_datetime(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|ndt| Utc.from_utc_datetime(&ndt))
            }),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn check_date_range(
    value: &serde_json::Value,
    data: &Record,
    after_field: Option<&str>,
    before_field: Option<&str>,
    min_date: Option<&str>,
    max_date: Option<&str>,
) -> Option<String> {
    if value.is_null() {
        return None;
    }
    let Some(date) = parse_datetime(value) else {
        return Some("value is not a date".to_string());
    };

    // Field-relative bounds are strict; absolute bounds are inclusive.
    if let Some(field) = after_field {
        if let Some(other) = data.get(field).and_then(parse_datetime) {
            if date <= other {
                return Some(format!("must be after `{field}`"));
            }
        }
    }
    if let Some(field) = before_field {
        if let Some(other) = data.get(field).and_then(parse_datetime) {
            if date >= other {
                return Some(format!("must be before `{field}`"));
            }
        }
    }
    if let Some(min) = min_date.and_then(|s| parse_datetime(&serde_json::json!(s))) {
        if date < min {
            return Some(format!("must not be before {min}"));
        }
    }
    if let Some(max) = max_date.and_then(|s| parse_datetime(&serde_json::json!(s))) {
        if date > max {
            return Some(format!("must not be after {max}"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryKv;
    use crate::policy::condition::{Condition, ConditionOp};
    use serde_json::json;

    struct StubLookup {
        known_targets: Vec<String>,
        existing_refs: Vec<String>,
        duplicates: bool,
    }

    #[async_trait]
    impl RecordLookup for StubLookup {
        async fn reference_exists(
            &self,
            _tenant_id: Uuid,
            target_entity: &str,
            id: &serde_json::Value,
        ) -> Result<Option<bool>> {
            if !self.known_targets.iter().any(|t| t == target_entity) {
                return Ok(None);
            }
            let id = id.as_str().unwrap_or_default().to_string();
            Ok(Some(self.existing_refs.contains(&id)))
        }

        async fn duplicate_exists(
            &self,
            _tenant_id: Uuid,
            _entity: &str,
            _field: &str,
            _value: &serde_json::Value,
            _scope: &[(String, serde_json::Value)],
            _exclude_id: Option<Uuid>,
        ) -> Result<bool> {
            Ok(self.duplicates)
        }
    }

    fn engine(lookup: StubLookup) -> ValidationEngine {
        ValidationEngine::new(Arc::new(lookup), Arc::new(MemoryKv::new()))
    }

    fn plain_engine() -> ValidationEngine {
        engine(StubLookup {
            known_targets: vec![],
            existing_refs: vec![],
            duplicates: false,
        })
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Uuid::now_v7(), Uuid::now_v7(), "core", vec!["user".into()])
    }

    fn rule(id: &str, field: &str, kind: RuleKind) -> ValidationRule {
        ValidationRule {
            id: id.to_string(),
            entity: "Invoice".to_string(),
            field_path: field.to_string(),
            severity: RuleSeverity::Error,
            phase: RulePhase::BeforePersist,
            applies_on: vec![RuleTrigger::All],
            message: None,
            kind,
        }
    }

    fn record(pairs: &[(&str, serde_json::Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn required_rejects_null_and_empty_string() {
        let engine = plain_engine();
        let graph = vec![rule("amount.required", "amount", RuleKind::Required)];

        for value in [json!(null), json!("")] {
            let data = record(&[("amount", value)]);
            let outcome = engine
                .execute(
                    &graph,
                    &data,
                    RuleTrigger::Create,
                    RulePhase::BeforePersist,
                    &ctx(),
                    None,
                )
                .await;
            assert!(!outcome.valid());
        }

        let data = record(&[("amount", json!(0))]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert!(outcome.valid());
    }

    #[tokio::test]
    async fn min_max_skips_null_and_rejects_non_numbers() {
        let engine = plain_engine();
        let graph = vec![rule(
            "qty.min_max",
            "qty",
            RuleKind::MinMax {
                min: Some(1.0),
                max: Some(10.0),
            },
        )];

        let cases = [
            (json!(null), true),
            (json!(5), true),
            (json!(0), false),
            (json!(11), false),
            (json!("abc"), false),
        ];
        for (value, expect_valid) in cases {
            let data = record(&[("qty", value.clone())]);
            let outcome = engine
                .execute(
                    &graph,
                    &data,
                    RuleTrigger::Create,
                    RulePhase::BeforePersist,
                    &ctx(),
                    None,
                )
                .await;
            assert_eq!(outcome.valid(), expect_valid, "value {value}");
        }
    }

    #[tokio::test]
    async fn length_stringifies_non_strings() {
        let engine = plain_engine();
        let graph = vec![rule(
            "code.length",
            "code",
            RuleKind::Length {
                min_length: Some(2),
                max_length: Some(4),
            },
        )];

        let data = record(&[("code", json!(12345))]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert!(!outcome.valid(), "5-digit number stringifies to length 5");
    }

    #[tokio::test]
    async fn invalid_regex_pattern_is_a_rule_level_error() {
        let engine = plain_engine();
        let graph = vec![rule(
            "code.regex",
            "code",
            RuleKind::Regex {
                pattern: "[unclosed".to_string(),
            },
        )];
        let data = record(&[("code", json!("x"))]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert!(!outcome.valid());
        assert!(outcome.errors[0].message.contains("invalid pattern"));
    }

    #[tokio::test]
    async fn cross_field_uses_condition_operators() {
        let engine = plain_engine();
        let graph = vec![rule(
            "end.after_start",
            "endDate",
            RuleKind::CrossField {
                compare_field: "startDate".to_string(),
                op: ConditionOp::Gt,
            },
        )];

        let ok = record(&[
            ("startDate", json!("2026-01-01T00:00:00Z")),
            ("endDate", json!("2026-06-01T00:00:00Z")),
        ]);
        let outcome = engine
            .execute(
                &graph,
                &ok,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert!(outcome.valid());

        let bad = record(&[
            ("startDate", json!("2026-06-01T00:00:00Z")),
            ("endDate", json!("2026-01-01T00:00:00Z")),
        ]);
        let outcome = engine
            .execute(
                &graph,
                &bad,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert!(!outcome.valid());
    }

    #[tokio::test]
    async fn conditional_escalates_child_severity() {
        let engine = plain_engine();
        let mut child = rule("memo.required", "memo", RuleKind::Required);
        child.severity = RuleSeverity::Warning;
        let graph = vec![rule(
            "memo.when_rejected",
            "memo",
            RuleKind::Conditional {
                when: vec![Condition::new(
                    "record.status",
                    ConditionOp::Eq,
                    json!("REJECTED"),
                )],
                then: vec![child],
            },
        )];

        // when matches and parent is error severity → child escalates.
        let data = record(&[("status", json!("REJECTED")), ("memo", json!(null))]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert_eq!(outcome.errors.len(), 1);

        // when does not match → child never runs.
        let data = record(&[("status", json!("OPEN")), ("memo", json!(null))]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert!(outcome.valid());
    }

    #[tokio::test]
    async fn date_range_field_bounds_are_strict_absolute_inclusive() {
        let engine = plain_engine();
        let graph = vec![rule(
            "due.range",
            "dueDate",
            RuleKind::DateRange {
                after_field: Some("createdDate".to_string()),
                before_field: None,
                min_date: Some("2026-01-01".to_string()),
                max_date: None,
            },
        )];

        // Equal to after_field → strict failure.
        let data = record(&[
            ("createdDate", json!("2026-02-01T00:00:00Z")),
            ("dueDate", json!("2026-02-01T00:00:00Z")),
        ]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert!(!outcome.valid());

        // Exactly the absolute minimum → inclusive pass.
        let data = record(&[
            ("createdDate", json!("2025-06-01T00:00:00Z")),
            ("dueDate", json!("2026-01-01T00:00:00Z")),
        ]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert!(outcome.valid());
    }

    #[tokio::test]
    async fn referential_unknown_target_is_a_warning() {
        let engine = engine(StubLookup {
            known_targets: vec!["Customer".to_string()],
            existing_refs: vec!["c1".to_string()],
            duplicates: false,
        });
        let graph = vec![
            rule(
                "customer.referential",
                "customerId",
                RuleKind::Referential {
                    target_entity: "Customer".to_string(),
                },
            ),
            rule(
                "ghost.referential",
                "ghostId",
                RuleKind::Referential {
                    target_entity: "Ghost".to_string(),
                },
            ),
        ];

        let data = record(&[("customerId", json!("c1")), ("ghostId", json!("g1"))]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        // Missing target entity is a warning, not a hard error.
        assert!(outcome.valid());
        assert_eq!(outcome.warnings.len(), 1);

        let data = record(&[("customerId", json!("missing")), ("ghostId", json!(null))]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert!(!outcome.valid());
    }

    #[tokio::test]
    async fn unique_violation_fails() {
        let engine = engine(StubLookup {
            known_targets: vec![],
            existing_refs: vec![],
            duplicates: true,
        });
        let graph = vec![rule(
            "number.unique",
            "number",
            RuleKind::Unique {
                scope_fields: vec![],
            },
        )];
        let data = record(&[("number", json!("INV-001"))]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Create,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        assert!(!outcome.valid());
    }

    #[tokio::test]
    async fn trigger_and_phase_filtering() {
        let engine = plain_engine();
        let mut only_create = rule("amount.required", "amount", RuleKind::Required);
        only_create.applies_on = vec![RuleTrigger::Create];
        let mut transition_phase = rule("status.required", "status", RuleKind::Required);
        transition_phase.phase = RulePhase::BeforeTransition;
        let graph = vec![only_create, transition_phase];

        let data = record(&[("amount", json!(null)), ("status", json!(null))]);
        let outcome = engine
            .execute(
                &graph,
                &data,
                RuleTrigger::Update,
                RulePhase::BeforePersist,
                &ctx(),
                None,
            )
            .await;
        // Create-only rule skipped on update; transition-phase rule skipped
        // in the persist phase.
        assert!(outcome.valid());
    }
}
