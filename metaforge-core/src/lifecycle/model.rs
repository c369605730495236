use crate::context::Timestamp;
use crate::policy::condition::Condition;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Lifecycle definitions ────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleState {
    pub id: Uuid,
    pub code: String,
    pub is_terminal: bool,
    pub sort_order: i32,
}

/// Blocking/approval thresholds attached to a transition gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
    Between,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdAction {
    Block,
    RequireApproval,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub field: String,
    pub op: ThresholdOp,
    /// Scalar for the plain operators, `[lo, hi]` for `between`.
    pub value: serde_json::Value,
    pub action: ThresholdAction,
}

impl ThresholdRule {
    /// Whether the rule *trips* for the given record value. A tripped rule
    /// triggers its action (block or require approval).
    pub fn trips(&self, record_value: &serde_json::Value) -> bool {
        let Some(actual) = record_value.as_f64() else {
            return false;
        };
        match self.op {
            ThresholdOp::Between => {
                let (Some(lo), Some(hi)) = (
                    self.value.get(0).and_then(|v| v.as_f64()),
                    self.value.get(1).and_then(|v| v.as_f64()),
                ) else {
                    return false;
                };
                actual >= lo && actual <= hi
            }
            op => {
                let Some(target) = self.value.as_f64() else {
                    return false;
                };
                match op {
                    ThresholdOp::Gt => actual > target,
                    ThresholdOp::Gte => actual >= target,
                    ThresholdOp::Lt => actual < target,
                    ThresholdOp::Lte => actual <= target,
                    ThresholdOp::Eq => actual == target,
                    ThresholdOp::Ne => actual != target,
                    ThresholdOp::Between => unreachable!(),
                }
            }
        }
    }
}

/// Preconditions attached to a transition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransitionGate {
    #[serde(default)]
    pub required_operations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_template_id: Option<Uuid>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub threshold_rules: Vec<ThresholdRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleTransition {
    pub id: Uuid,
    pub from_state: Uuid,
    pub to_state: Uuid,
    pub operation_code: String,
    pub is_active: bool,
    #[serde(default)]
    pub gates: Vec<TransitionGate>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lifecycle {
    pub id: Uuid,
    pub code: String,
    pub version_no: u32,
    pub is_active: bool,
    pub states: Vec<LifecycleState>,
    pub transitions: Vec<LifecycleTransition>,
}

impl Lifecycle {
    /// The state with the lowest sort order is the initial state.
    pub fn initial_state(&self) -> Option<&LifecycleState> {
        self.states.iter().min_by_key(|s| s.sort_order)
    }

    pub fn state(&self, id: Uuid) -> Option<&LifecycleState> {
        self.states.iter().find(|s| s.id == id)
    }

    pub fn state_by_code(&self, code: &str) -> Option<&LifecycleState> {
        self.states.iter().find(|s| s.code == code)
    }

    /// The active transition leaving `from` under `operation_code`.
    pub fn transition_from(
        &self,
        from: Uuid,
        operation_code: &str,
    ) -> Option<&LifecycleTransition> {
        self.transitions
            .iter()
            .find(|t| t.is_active && t.from_state == from && t.operation_code == operation_code)
    }

    pub fn transitions_from(&self, from: Uuid) -> Vec<&LifecycleTransition> {
        self.transitions
            .iter()
            .filter(|t| t.is_active && t.from_state == from)
            .collect()
    }
}

// ─── Routing ──────────────────────────────────────────────────

/// One conditional routing rule: entity → lifecycle. Lower priority wins;
/// a rule with no conditions is the default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: Uuid,
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub lifecycle_id: Uuid,
}

/// A compiled, persisted routing table for one entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompiledRoute {
    pub entity_name: String,
    pub rules: Vec<RoutingRule>,
    pub compiled_hash: String,
    pub compiled_at: Timestamp,
}

// ─── Instances & events ───────────────────────────────────────

/// One lifecycle instance; unique per (tenant, entity, entity id), created
/// at entity create and never deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub entity_name: String,
    pub entity_id: Uuid,
    pub lifecycle_id: Uuid,
    pub state_id: Uuid,
    pub updated_at: Timestamp,
    pub updated_by: Uuid,
}

/// Append-only record of every transition (and the initial create).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub from_state: Option<Uuid>,
    pub to_state: Uuid,
    pub operation_code: String,
    pub actor: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub correlation_id: String,
    pub occurred_at: Timestamp,
}

/// Result of a successful transition.
#[derive(Clone, Debug)]
pub struct TransitionResult {
    pub instance_id: Uuid,
    pub state_code: String,
    pub event_id: Uuid,
}

/// One row of `get_available_transitions`.
#[derive(Clone, Debug)]
pub struct AvailableTransition {
    pub transition_id: Uuid,
    pub operation_code: String,
    pub to_state_code: String,
    pub authorized: bool,
    pub unauthorized_reason: Option<String>,
    pub requires_approval: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(code: &str, sort_order: i32, terminal: bool) -> LifecycleState {
        LifecycleState {
            id: Uuid::now_v7(),
            code: code.to_string(),
            is_terminal: terminal,
            sort_order,
        }
    }

    #[test]
    fn initial_state_is_lowest_sort_order() {
        let lifecycle = Lifecycle {
            id: Uuid::now_v7(),
            code: "default".to_string(),
            version_no: 1,
            is_active: true,
            states: vec![state("CLOSED", 30, true), state("DRAFT", 10, false), state("OPEN", 20, false)],
            transitions: vec![],
        };
        assert_eq!(lifecycle.initial_state().unwrap().code, "DRAFT");
    }

    #[test]
    fn threshold_between_and_scalar_ops() {
        let between = ThresholdRule {
            field: "amount".to_string(),
            op: ThresholdOp::Between,
            value: json!([100, 500]),
            action: ThresholdAction::Block,
        };
        assert!(between.trips(&json!(250)));
        assert!(between.trips(&json!(100)));
        assert!(!between.trips(&json!(501)));

        let gt = ThresholdRule {
            field: "amount".to_string(),
            op: ThresholdOp::Gt,
            value: json!(1000),
            action: ThresholdAction::RequireApproval,
        };
        assert!(gt.trips(&json!(1500)));
        assert!(!gt.trips(&json!(1000)));
        // Non-numeric record values never trip.
        assert!(!gt.trips(&json!("a lot")));
    }
}
