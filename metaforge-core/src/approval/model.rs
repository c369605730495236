use crate::context::Timestamp;
use crate::policy::condition::Condition;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Templates ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    Serial,
    Parallel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuorumType {
    Count,
    Percent,
}

/// Completion rule of a parallel stage. `required_count` is resolved at
/// materialization from the actual approver count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    pub quorum_type: QuorumType,
    pub value: u32,
    #[serde(default)]
    pub required_count: u32,
}

impl Quorum {
    /// Resolve `required_count` against the number of approver tasks.
    pub fn resolved(mut self, approver_count: u32) -> Self {
        self.required_count = match self.quorum_type {
            QuorumType::Count => self.value.min(approver_count.max(1)),
            QuorumType::Percent => {
                let pct = self.value.min(100) as f64 / 100.0;
                ((approver_count as f64 * pct).ceil() as u32).max(1)
            }
        };
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Assignee {
    Principal { id: Uuid },
    Role { role: String },
    Group { group: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Approver,
    Reviewer,
    Watcher,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateStage {
    pub stage_no: u32,
    pub mode: StageMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<Quorum>,
}

/// One assignment rule. Rules apply to a specific stage when `stage_no` is
/// set, otherwise to every stage. Lower priority evaluates first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub id: Uuid,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_no: Option<u32>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub assign_to: Assignee,
    #[serde(default = "default_task_type")]
    pub task_type: TaskType,
}

fn default_task_type() -> TaskType {
    TaskType::Approver
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalTemplate {
    pub id: Uuid,
    pub code: String,
    pub version_no: u32,
    pub is_active: bool,
    pub stages: Vec<TemplateStage>,
    pub rules: Vec<AssignmentRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_reviewer: Option<Assignee>,
    /// Task deadline in milliseconds, if stages expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_due_ms: Option<i64>,
    pub compiled_hash: String,
}

impl ApprovalTemplate {
    /// Stages in materialization order.
    pub fn ordered_stages(&self) -> Vec<&TemplateStage> {
        let mut stages: Vec<&TemplateStage> = self.stages.iter().collect();
        stages.sort_by_key(|s| s.stage_no);
        stages
    }

    /// Rules for one stage, lowest priority first.
    pub fn rules_for_stage(&self, stage_no: u32) -> Vec<&AssignmentRule> {
        let mut rules: Vec<&AssignmentRule> = self
            .rules
            .iter()
            .filter(|r| r.stage_no.is_none_or(|n| n == stage_no))
            .collect();
        rules.sort_by_key(|r| r.priority);
        rules
    }
}

// ─── Instances ────────────────────────────────────────────────

/// External instance status. The database stores `rejected` as `canceled`
/// with a context reason; `to_db`/`from_db` are the single mapping boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Open,
    Completed,
    Rejected,
    Canceled,
}

/// Context reason recorded for rejected instances in the store.
pub const REASON_REJECTED: &str = "rejected";

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Open)
    }

    /// DB representation: (status column, context reason).
    pub fn to_db(&self) -> (&'static str, Option<&'static str>) {
        match self {
            InstanceStatus::Open => ("open", None),
            InstanceStatus::Completed => ("completed", None),
            InstanceStatus::Rejected => ("canceled", Some(REASON_REJECTED)),
            InstanceStatus::Canceled => ("canceled", None),
        }
    }

    pub fn from_db(status: &str, context_reason: Option<&str>) -> Self {
        match (status, context_reason) {
            ("open", _) => InstanceStatus::Open,
            ("completed", _) => InstanceStatus::Completed,
            ("canceled", Some(REASON_REJECTED)) => InstanceStatus::Rejected,
            _ => InstanceStatus::Canceled,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub entity_name: String,
    pub entity_id: Uuid,
    pub transition_id: Uuid,
    pub operation_code: String,
    pub template_id: Uuid,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_reason: Option<String>,
    pub created_at: Timestamp,
    pub created_by: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Open,
    Completed,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Approved,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalStage {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub stage_no: u32,
    pub mode: StageMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<Quorum>,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StageOutcome>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Approved,
    Rejected,
    Canceled,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub stage_id: Uuid,
    /// Concrete principal the task is assigned to.
    pub assignee: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<Timestamp>,
}

/// Frozen record of how a task's assignment was resolved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignmentSnapshot {
    pub id: Uuid,
    pub task_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub template_version: u32,
    pub resolved: serde_json::Value,
}

/// The caller-facing decision verbs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionVerb {
    Approve,
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_round_trips() {
        for status in [
            InstanceStatus::Open,
            InstanceStatus::Completed,
            InstanceStatus::Rejected,
            InstanceStatus::Canceled,
        ] {
            let (db_status, reason) = status.to_db();
            assert_eq!(InstanceStatus::from_db(db_status, reason), status);
        }
        // Rejected is stored as canceled + reason.
        assert_eq!(InstanceStatus::Rejected.to_db(), ("canceled", Some("rejected")));
    }

    #[test]
    fn quorum_resolution() {
        let count = Quorum {
            quorum_type: QuorumType::Count,
            value: 2,
            required_count: 0,
        };
        assert_eq!(count.resolved(5).required_count, 2);
        // Never above the approver count.
        assert_eq!(count.resolved(1).required_count, 1);

        let percent = Quorum {
            quorum_type: QuorumType::Percent,
            value: 50,
            required_count: 0,
        };
        assert_eq!(percent.resolved(4).required_count, 2);
        assert_eq!(percent.resolved(5).required_count, 3);
        assert_eq!(percent.resolved(1).required_count, 1);
    }

    #[test]
    fn rules_filter_by_stage_and_sort_by_priority() {
        let template = ApprovalTemplate {
            id: Uuid::now_v7(),
            code: "T1".to_string(),
            version_no: 1,
            is_active: true,
            stages: vec![],
            rules: vec![
                AssignmentRule {
                    id: Uuid::now_v7(),
                    priority: 20,
                    stage_no: Some(1),
                    conditions: vec![],
                    assign_to: Assignee::Role {
                        role: "manager".to_string(),
                    },
                    task_type: TaskType::Approver,
                },
                AssignmentRule {
                    id: Uuid::now_v7(),
                    priority: 10,
                    stage_no: None,
                    conditions: vec![],
                    assign_to: Assignee::Role {
                        role: "finance".to_string(),
                    },
                    task_type: TaskType::Approver,
                },
                AssignmentRule {
                    id: Uuid::now_v7(),
                    priority: 5,
                    stage_no: Some(2),
                    conditions: vec![],
                    assign_to: Assignee::Role {
                        role: "cfo".to_string(),
                    },
                    task_type: TaskType::Approver,
                },
            ],
            default_reviewer: None,
            task_due_ms: None,
            compiled_hash: String::new(),
        };

        let stage1 = template.rules_for_stage(1);
        assert_eq!(stage1.len(), 2);
        assert_eq!(stage1[0].priority, 10);

        let stage2 = template.rules_for_stage(2);
        assert_eq!(stage2.len(), 2);
        assert_eq!(stage2[0].priority, 5);
    }
}
