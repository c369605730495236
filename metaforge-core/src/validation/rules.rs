use crate::compiler::ir::CompiledModel;
use crate::policy::condition::{Condition, ConditionOp};
use crate::schema::model::FieldType;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSeverity {
    Error,
    Warning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RulePhase {
    BeforePersist,
    BeforeTransition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTrigger {
    Create,
    Update,
    Transition,
    All,
}

/// The typed rule kinds. Tagged so declared rules deserialize from metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    Required,
    MinMax {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Length {
        #[serde(default)]
        min_length: Option<u32>,
        #[serde(default)]
        max_length: Option<u32>,
    },
    Regex {
        pattern: String,
    },
    Enum {
        values: Vec<String>,
    },
    CrossField {
        compare_field: String,
        op: ConditionOp,
    },
    Conditional {
        when: Vec<Condition>,
        then: Vec<ValidationRule>,
    },
    DateRange {
        #[serde(default)]
        after_field: Option<String>,
        #[serde(default)]
        before_field: Option<String>,
        #[serde(default)]
        min_date: Option<String>,
        #[serde(default)]
        max_date: Option<String>,
    },
    Referential {
        target_entity: String,
    },
    Unique {
        #[serde(default)]
        scope_fields: Vec<String>,
    },
}

/// One node of the per-entity rule graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: String,
    pub entity: String,
    pub field_path: String,
    pub severity: RuleSeverity,
    pub phase: RulePhase,
    pub applies_on: Vec<RuleTrigger>,
    /// Message template; falls back to the kind's default message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub kind: RuleKind,
}

impl ValidationRule {
    pub fn applies_to(&self, trigger: RuleTrigger) -> bool {
        self.applies_on
            .iter()
            .any(|t| *t == RuleTrigger::All || *t == trigger)
    }
}

/// Derive constraint rules from the IR. Declaration order follows field
/// order, with required checks before shape checks per field.
pub fn rules_from_model(model: &CompiledModel) -> Vec<ValidationRule> {
    let mut graph = Vec::new();
    let persist_all = |id: String, field: &str, kind: RuleKind| ValidationRule {
        id,
        entity: model.entity_name.clone(),
        field_path: field.to_string(),
        severity: RuleSeverity::Error,
        phase: RulePhase::BeforePersist,
        applies_on: vec![RuleTrigger::All],
        message: None,
        kind,
    };

    for field in &model.fields {
        // System columns are maintained by the platform, not validated input.
        if crate::schema::model::SYSTEM_FIELDS
            .iter()
            .any(|(name, _)| *name == field.api_name)
        {
            continue;
        }

        if field.required {
            graph.push(persist_all(
                format!("{}.required", field.api_name),
                &field.api_name,
                RuleKind::Required,
            ));
        }
        if field.constraints.min.is_some() || field.constraints.max.is_some() {
            graph.push(persist_all(
                format!("{}.min_max", field.api_name),
                &field.api_name,
                RuleKind::MinMax {
                    min: field.constraints.min,
                    max: field.constraints.max,
                },
            ));
        }
        if field.constraints.min_length.is_some() || field.constraints.max_length.is_some() {
            graph.push(persist_all(
                format!("{}.length", field.api_name),
                &field.api_name,
                RuleKind::Length {
                    min_length: field.constraints.min_length,
                    max_length: field.constraints.max_length,
                },
            ));
        }
        if let Some(pattern) = &field.constraints.pattern {
            graph.push(persist_all(
                format!("{}.regex", field.api_name),
                &field.api_name,
                RuleKind::Regex {
                    pattern: pattern.clone(),
                },
            ));
        }
        if field.field_type == FieldType::Enum && !field.enum_values.is_empty() {
            graph.push(persist_all(
                format!("{}.enum", field.api_name),
                &field.api_name,
                RuleKind::Enum {
                    values: field.enum_values.clone(),
                },
            ));
        }
        if field.field_type == FieldType::Reference {
            if let Some(target) = &field.reference_to {
                graph.push(persist_all(
                    format!("{}.referential", field.api_name),
                    &field.api_name,
                    RuleKind::Referential {
                        target_entity: target.clone(),
                    },
                ));
            }
        }
        if field.unique {
            graph.push(persist_all(
                format!("{}.unique", field.api_name),
                &field.api_name,
                RuleKind::Unique {
                    scope_fields: vec![],
                },
            ));
        }
    }

    graph
}
