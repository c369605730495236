//! Durable timers: scheduled auto-transitions with guarded fire, cancel on
//! state change, and startup rehydration.

pub mod service;

pub use service::{RecordSource, TimerService, TimerWorker};

use crate::context::Timestamp;
use crate::policy::condition::Condition;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Operation code used when a policy does not name one.
pub const OP_AUTO_TRANSITION: &str = "AUTO_TRANSITION";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerType {
    AutoClose,
    AutoCancel,
    Reminder,
    AutoTransition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayType {
    Fixed,
    FieldRelative,
    /// Business-hour SLA adjustment is an extension; scheduled as `fixed`.
    Sla,
}

/// A timer policy as authored. The schedule row freezes a snapshot of this
/// at scheduling time; later policy edits never touch live timers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerPolicy {
    pub id: Uuid,
    pub code: String,
    pub timer_type: TimerType,
    pub delay_type: DelayType,
    pub delay_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_from_field: Option<String>,
    #[serde(default)]
    pub delay_offset_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_operation_code: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub cancel_on_any_transition: bool,
    #[serde(default)]
    pub cancel_on_states: Vec<String>,
    pub is_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerStatus {
    Scheduled,
    Fired,
    Canceled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerSchedule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub entity_name: String,
    pub entity_id: Uuid,
    pub instance_id: Uuid,
    pub timer_type: TimerType,
    pub fire_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Immutable copy of the policy captured at scheduling.
    pub policy_snapshot: TimerPolicy,
    pub status: TimerStatus,
}

/// Persistence for timer policies and schedules. Status changes go through
/// compare-and-set so a timer can neither fire twice nor fire after cancel.
#[async_trait]
pub trait TimerStore: Send + Sync {
    async fn save_policy(&self, policy: &TimerPolicy) -> Result<()>;
    async fn load_policy(&self, id: Uuid) -> Result<Option<TimerPolicy>>;

    async fn save_schedule(&self, schedule: &TimerSchedule) -> Result<()>;
    async fn load_schedule(&self, id: Uuid) -> Result<Option<TimerSchedule>>;
    async fn set_job_id(&self, id: Uuid, job_id: &str) -> Result<()>;

    /// `scheduled → fired`; false when the row was not in `scheduled`.
    async fn mark_fired(&self, id: Uuid) -> Result<bool>;
    /// `scheduled → canceled`; false when the row was not in `scheduled`.
    async fn mark_canceled(&self, id: Uuid) -> Result<bool>;

    async fn scheduled_for_entity(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Vec<TimerSchedule>>;

    /// All scheduled rows for a tenant (rehydration scan).
    async fn scheduled_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<TimerSchedule>>;
}

struct Inner {
    policies: HashMap<Uuid, TimerPolicy>,
    schedules: HashMap<Uuid, TimerSchedule>,
}

pub struct MemoryTimerStore {
    inner: RwLock<Inner>,
}

impl MemoryTimerStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                policies: HashMap::new(),
                schedules: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryTimerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimerStore for MemoryTimerStore {
    async fn save_policy(&self, policy: &TimerPolicy) -> Result<()> {
        let mut w = self.inner.write().await;
        w.policies.insert(policy.id, policy.clone());
        Ok(())
    }

    async fn load_policy(&self, id: Uuid) -> Result<Option<TimerPolicy>> {
        let r = self.inner.read().await;
        Ok(r.policies.get(&id).cloned())
    }

    async fn save_schedule(&self, schedule: &TimerSchedule) -> Result<()> {
        let mut w = self.inner.write().await;
        w.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn load_schedule(&self, id: Uuid) -> Result<Option<TimerSchedule>> {
        let r = self.inner.read().await;
        Ok(r.schedules.get(&id).cloned())
    }

    async fn set_job_id(&self, id: Uuid, job_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        let schedule = w
            .schedules
            .get_mut(&id)
            .ok_or_else(|| anyhow!("timer schedule not found: {id}"))?;
        schedule.job_id = Some(job_id.to_string());
        Ok(())
    }

    async fn mark_fired(&self, id: Uuid) -> Result<bool> {
        let mut w = self.inner.write().await;
        let schedule = w
            .schedules
            .get_mut(&id)
            .ok_or_else(|| anyhow!("timer schedule not found: {id}"))?;
        if schedule.status != TimerStatus::Scheduled {
            return Ok(false);
        }
        schedule.status = TimerStatus::Fired;
        Ok(true)
    }

    async fn mark_canceled(&self, id: Uuid) -> Result<bool> {
        let mut w = self.inner.write().await;
        let schedule = w
            .schedules
            .get_mut(&id)
            .ok_or_else(|| anyhow!("timer schedule not found: {id}"))?;
        if schedule.status != TimerStatus::Scheduled {
            return Ok(false);
        }
        schedule.status = TimerStatus::Canceled;
        Ok(true)
    }

    async fn scheduled_for_entity(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Vec<TimerSchedule>> {
        let r = self.inner.read().await;
        Ok(r.schedules
            .values()
            .filter(|s| {
                s.status == TimerStatus::Scheduled
                    && s.tenant_id == tenant_id
                    && s.entity_name == entity_name
                    && s.entity_id == entity_id
            })
            .cloned()
            .collect())
    }

    async fn scheduled_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<TimerSchedule>> {
        let r = self.inner.read().await;
        Ok(r.schedules
            .values()
            .filter(|s| s.status == TimerStatus::Scheduled && s.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}
