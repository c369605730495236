use crate::approval::model::{
    ApprovalInstance, ApprovalStage, ApprovalTask, ApprovalTemplate, AssignmentSnapshot,
    InstanceStatus, StageOutcome, StageStatus, TaskStatus,
};
use crate::context::Timestamp;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for approval templates and instance graphs. Terminal
/// statuses are immutable at this layer.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    // ── Templates ──

    async fn save_template(&self, template: &ApprovalTemplate) -> Result<()>;
    async fn load_template(&self, id: Uuid) -> Result<Option<ApprovalTemplate>>;

    // ── Instance graph ──

    /// Persist an instance with its stages, tasks, and assignment snapshots
    /// in one transaction.
    async fn create_instance_graph(
        &self,
        instance: &ApprovalInstance,
        stages: &[ApprovalStage],
        tasks: &[ApprovalTask],
        snapshots: &[AssignmentSnapshot],
    ) -> Result<()>;

    async fn load_instance(&self, id: Uuid) -> Result<Option<ApprovalInstance>>;

    /// Most recent instance for an entity, any status.
    async fn latest_instance_for(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Option<ApprovalInstance>>;

    async fn update_instance_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        context_reason: Option<&str>,
    ) -> Result<()>;

    // ── Stages ──

    async fn load_stages(&self, instance_id: Uuid) -> Result<Vec<ApprovalStage>>;
    async fn update_stage(
        &self,
        id: Uuid,
        status: StageStatus,
        outcome: Option<StageOutcome>,
    ) -> Result<()>;

    // ── Tasks ──

    async fn load_task(&self, id: Uuid) -> Result<Option<ApprovalTask>>;
    async fn load_tasks(&self, stage_id: Uuid) -> Result<Vec<ApprovalTask>>;
    async fn load_tasks_for_instance(&self, instance_id: Uuid) -> Result<Vec<ApprovalTask>>;

    /// Compare-and-set decision: only a `pending` task accepts a write.
    /// Returns false when the task was no longer pending.
    async fn decide_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        decided_by: Uuid,
        decided_at: Timestamp,
        note: Option<&str>,
    ) -> Result<bool>;

    /// Pending tasks whose `due_at` has passed.
    async fn overdue_tasks(&self, now: Timestamp) -> Result<Vec<ApprovalTask>>;
}

struct Inner {
    templates: HashMap<Uuid, ApprovalTemplate>,
    instances: HashMap<Uuid, ApprovalInstance>,
    stages: HashMap<Uuid, ApprovalStage>,
    tasks: HashMap<Uuid, ApprovalTask>,
    snapshots: HashMap<Uuid, AssignmentSnapshot>,
}

pub struct MemoryApprovalStore {
    inner: RwLock<Inner>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                templates: HashMap::new(),
                instances: HashMap::new(),
                stages: HashMap::new(),
                tasks: HashMap::new(),
                snapshots: HashMap::new(),
            }),
        }
    }

    pub async fn snapshot_for_task(&self, task_id: Uuid) -> Option<AssignmentSnapshot> {
        self.inner
            .read()
            .await
            .snapshots
            .values()
            .find(|s| s.task_id == task_id)
            .cloned()
    }
}

impl Default for MemoryApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    // ── Templates ──

    async fn save_template(&self, template: &ApprovalTemplate) -> Result<()> {
        let mut w = self.inner.write().await;
        w.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn load_template(&self, id: Uuid) -> Result<Option<ApprovalTemplate>> {
        let r = self.inner.read().await;
        Ok(r.templates.get(&id).cloned())
    }

    // ── Instance graph ──

    async fn create_instance_graph(
        &self,
        instance: &ApprovalInstance,
        stages: &[ApprovalStage],
        tasks: &[ApprovalTask],
        snapshots: &[AssignmentSnapshot],
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        w.instances.insert(instance.id, instance.clone());
        for stage in stages {
            w.stages.insert(stage.id, stage.clone());
        }
        for task in tasks {
            w.tasks.insert(task.id, task.clone());
        }
        for snapshot in snapshots {
            w.snapshots.insert(snapshot.id, snapshot.clone());
        }
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<ApprovalInstance>> {
        let r = self.inner.read().await;
        Ok(r.instances.get(&id).cloned())
    }

    async fn latest_instance_for(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Option<ApprovalInstance>> {
        let r = self.inner.read().await;
        Ok(r.instances
            .values()
            .filter(|i| {
                i.tenant_id == tenant_id
                    && i.entity_name == entity_name
                    && i.entity_id == entity_id
            })
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn update_instance_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        context_reason: Option<&str>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let instance = w
            .instances
            .get_mut(&id)
            .ok_or_else(|| anyhow!("approval instance not found: {id}"))?;
        if instance.status.is_terminal() {
            return Err(anyhow!(
                "approval instance {id} is terminal ({:?})",
                instance.status
            ));
        }
        instance.status = status;
        instance.context_reason = context_reason.map(str::to_string);
        Ok(())
    }

    // ── Stages ──

    async fn load_stages(&self, instance_id: Uuid) -> Result<Vec<ApprovalStage>> {
        let r = self.inner.read().await;
        let mut stages: Vec<ApprovalStage> = r
            .stages
            .values()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.stage_no);
        Ok(stages)
    }

    async fn update_stage(
        &self,
        id: Uuid,
        status: StageStatus,
        outcome: Option<StageOutcome>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let stage = w
            .stages
            .get_mut(&id)
            .ok_or_else(|| anyhow!("approval stage not found: {id}"))?;
        stage.status = status;
        stage.outcome = outcome;
        Ok(())
    }

    // ── Tasks ──

    async fn load_task(&self, id: Uuid) -> Result<Option<ApprovalTask>> {
        let r = self.inner.read().await;
        Ok(r.tasks.get(&id).cloned())
    }

    async fn load_tasks(&self, stage_id: Uuid) -> Result<Vec<ApprovalTask>> {
        let r = self.inner.read().await;
        let mut tasks: Vec<ApprovalTask> = r
            .tasks
            .values()
            .filter(|t| t.stage_id == stage_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn load_tasks_for_instance(&self, instance_id: Uuid) -> Result<Vec<ApprovalTask>> {
        let r = self.inner.read().await;
        let mut tasks: Vec<ApprovalTask> = r
            .tasks
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn decide_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        decided_by: Uuid,
        decided_at: Timestamp,
        note: Option<&str>,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let task = w
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("approval task not found: {id}"))?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = status;
        task.decided_by = Some(decided_by);
        task.decided_at = Some(decided_at);
        task.note = note.map(str::to_string);
        Ok(true)
    }

    async fn overdue_tasks(&self, now: Timestamp) -> Result<Vec<ApprovalTask>> {
        let r = self.inner.read().await;
        Ok(r.tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending && t.due_at.is_some_and(|due| due <= now)
            })
            .cloned()
            .collect())
    }
}
