//! Multi-stage approval instances: templates, assignment resolution,
//! decision aggregation, and completion signaling.

pub mod engine;
pub mod model;
pub mod store;

pub use engine::{ApprovalEngine, META_APPROVAL_OVERRIDE};
pub use model::{
    ApprovalInstance, ApprovalStage, ApprovalTask, ApprovalTemplate, Assignee, AssignmentRule,
    AssignmentSnapshot, DecisionVerb, InstanceStatus, Quorum, QuorumType, StageMode, StageOutcome,
    StageStatus, TaskStatus, TaskType, TemplateStage,
};
pub use store::{ApprovalStore, MemoryApprovalStore};
