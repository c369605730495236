use crate::context::{now_ms, RequestContext};
use crate::error::{PlatformError, PlatformResult};
use crate::jobs::{JobQueue, JobRequest, QueuedJob, JOB_LIFECYCLE_AUTO_TRANSITION};
use crate::lifecycle::manager::LifecycleManager;
use crate::lifecycle::store::LifecycleStore;
use crate::policy::condition::{self, Record};
use crate::timer::{
    DelayType, TimerSchedule, TimerStatus, TimerStore, OP_AUTO_TRANSITION,
};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Read access to current entity records, for firing-time condition checks.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Option<Record>>;
}

/// Schedules, cancels, and rehydrates timers. Firing is the worker's job.
pub struct TimerService {
    store: Arc<dyn TimerStore>,
    queue: Arc<dyn JobQueue>,
    lifecycles: Arc<dyn LifecycleStore>,
}

impl TimerService {
    pub fn new(
        store: Arc<dyn TimerStore>,
        queue: Arc<dyn JobQueue>,
        lifecycles: Arc<dyn LifecycleStore>,
    ) -> Self {
        Self {
            store,
            queue,
            lifecycles,
        }
    }

    pub fn store(&self) -> Arc<dyn TimerStore> {
        self.store.clone()
    }

    /// Schedule a timer for an entity:
    /// 1. Load the policy and freeze a snapshot.
    /// 2. Require a lifecycle instance.
    /// 3. Compute `fire_at`; a fire time in the past skips scheduling.
    /// 4. Persist the row, then enqueue the delayed job; if the enqueue
    ///    fails the row stays and rehydration reconciles it.
    pub async fn schedule_timer(
        &self,
        policy_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
        ctx: &RequestContext,
        trigger_data: Option<&Record>,
    ) -> PlatformResult<Option<TimerSchedule>> {
        let policy = self
            .store
            .load_policy(policy_id)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("timer policy {policy_id}")))?;
        if !policy.is_active {
            return Ok(None);
        }

        let instance = self
            .lifecycles
            .load_instance(ctx.tenant_id, entity_name, entity_id)
            .await?
            .ok_or_else(|| {
                PlatformError::not_found(format!(
                    "lifecycle instance for {entity_name}/{entity_id}"
                ))
            })?;

        let now = now_ms();
        let fire_at = match policy.delay_type {
            DelayType::Fixed | DelayType::Sla => now + policy.delay_ms,
            DelayType::FieldRelative => {
                let Some(base) = policy
                    .delay_from_field
                    .as_deref()
                    .and_then(|f| trigger_data.and_then(|d| d.get(f)))
                    .and_then(parse_epoch_ms)
                else {
                    tracing::warn!(policy = %policy.code,
                        "field-relative timer could not resolve its base field; skipping");
                    return Ok(None);
                };
                base + policy.delay_offset_ms
            }
        };
        if fire_at <= now {
            tracing::debug!(policy = %policy.code, "timer fire time already past; skipping");
            return Ok(None);
        }

        let mut schedule = TimerSchedule {
            id: Uuid::now_v7(),
            tenant_id: ctx.tenant_id,
            entity_name: entity_name.to_string(),
            entity_id,
            instance_id: instance.id,
            timer_type: policy.timer_type,
            fire_at,
            job_id: None,
            policy_snapshot: policy,
            status: TimerStatus::Scheduled,
        };
        self.store.save_schedule(&schedule).await?;

        match self
            .queue
            .add(&JobRequest {
                kind: JOB_LIFECYCLE_AUTO_TRANSITION.to_string(),
                payload: serde_json::json!({"scheduleId": schedule.id}),
                delay_ms: (fire_at - now) as u64,
                attempts: 1,
            })
            .await
        {
            Ok(job_id) => {
                self.store.set_job_id(schedule.id, &job_id).await?;
                schedule.job_id = Some(job_id);
            }
            Err(e) => {
                // Row stays `scheduled`; rehydrate re-enqueues it.
                tracing::warn!(schedule = %schedule.id, error = %e, "timer enqueue failed");
            }
        }
        Ok(Some(schedule))
    }

    /// Cancel every scheduled timer for an entity. Flips status first, then
    /// removes the queue job, so a canceled timer can never fire.
    pub async fn cancel_timers(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
        reason: &str,
    ) -> PlatformResult<u32> {
        let mut canceled = 0u32;
        for schedule in self
            .store
            .scheduled_for_entity(tenant_id, entity_name, entity_id)
            .await?
        {
            if self.cancel_one(&schedule, reason).await? {
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    /// Post-transition cancellation driven by each snapshot's own flags.
    pub async fn cancel_after_transition(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
        to_state_code: &str,
    ) -> PlatformResult<u32> {
        let mut canceled = 0u32;
        for schedule in self
            .store
            .scheduled_for_entity(tenant_id, entity_name, entity_id)
            .await?
        {
            let snapshot = &schedule.policy_snapshot;
            let should_cancel = snapshot.cancel_on_any_transition
                || snapshot
                    .cancel_on_states
                    .iter()
                    .any(|s| s == to_state_code);
            if should_cancel && self.cancel_one(&schedule, "state transition").await? {
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    async fn cancel_one(&self, schedule: &TimerSchedule, reason: &str) -> PlatformResult<bool> {
        if !self.store.mark_canceled(schedule.id).await? {
            return Ok(false);
        }
        if let Some(job_id) = &schedule.job_id {
            if let Err(e) = self.queue.remove_job(job_id).await {
                tracing::warn!(schedule = %schedule.id, error = %e, "queue job removal failed");
            }
        }
        tracing::debug!(schedule = %schedule.id, reason, "timer canceled");
        Ok(true)
    }

    /// Startup reconciliation: re-enqueue future timers under fresh job ids.
    /// Past-due rows are left for the worker's next pass.
    pub async fn rehydrate_timers(&self, tenant_id: Uuid) -> PlatformResult<u32> {
        let now = now_ms();
        let mut rehydrated = 0u32;
        for schedule in self.store.scheduled_for_tenant(tenant_id).await? {
            if schedule.fire_at <= now {
                continue;
            }
            let job_id = self
                .queue
                .add(&JobRequest {
                    kind: JOB_LIFECYCLE_AUTO_TRANSITION.to_string(),
                    payload: serde_json::json!({"scheduleId": schedule.id}),
                    delay_ms: (schedule.fire_at - now) as u64,
                    attempts: 1,
                })
                .await?;
            self.store.set_job_id(schedule.id, &job_id).await?;
            rehydrated += 1;
        }
        Ok(rehydrated)
    }
}

/// Consumes `lifecycle-auto-transition` jobs and drives the gated fire.
pub struct TimerWorker {
    timers: Arc<TimerService>,
    manager: Arc<LifecycleManager>,
    records: Arc<dyn RecordSource>,
    realm_id: String,
}

impl TimerWorker {
    pub fn new(
        timers: Arc<TimerService>,
        manager: Arc<LifecycleManager>,
        records: Arc<dyn RecordSource>,
        realm_id: &str,
    ) -> Self {
        Self {
            timers,
            manager,
            records,
            realm_id: realm_id.to_string(),
        }
    }

    /// Handle one queued job. Unknown or non-`scheduled` rows return without
    /// action, which makes redelivery idempotent.
    pub async fn handle(&self, job: &QueuedJob) -> PlatformResult<()> {
        let Some(schedule_id) = job
            .payload
            .get("scheduleId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            tracing::warn!(job = %job.job_id, "timer job without scheduleId; dropping");
            return Ok(());
        };
        self.process_timer(schedule_id).await
    }

    /// The guarded fire:
    /// 1. Idempotence: only a `scheduled` row proceeds.
    /// 2. `scheduled → fired` before executing, the concurrency fence.
    /// 3. Re-verify the instance and the snapshot conditions.
    /// 4. Run the transition under a system context; failures are logged,
    ///    never propagated to the scheduling business operation.
    pub async fn process_timer(&self, schedule_id: Uuid) -> PlatformResult<()> {
        let Some(schedule) = self.timers.store.load_schedule(schedule_id).await? else {
            tracing::warn!(schedule = %schedule_id, "timer schedule vanished");
            return Ok(());
        };
        if schedule.status != TimerStatus::Scheduled {
            return Ok(());
        }
        if !self.timers.store.mark_fired(schedule_id).await? {
            return Ok(());
        }

        let instance = self
            .timers
            .lifecycles
            .load_instance(schedule.tenant_id, &schedule.entity_name, schedule.entity_id)
            .await?;
        if instance.is_none() {
            tracing::info!(schedule = %schedule_id, "instance gone before fire; no-op");
            return Ok(());
        }

        let record = self
            .records
            .fetch(schedule.tenant_id, &schedule.entity_name, schedule.entity_id)
            .await?;

        let ctx = {
            let mut ctx = RequestContext::system(schedule.tenant_id, &self.realm_id, true);
            ctx.request_id = format!("timer-{schedule_id}");
            ctx
        };

        let snapshot = &schedule.policy_snapshot;
        if !snapshot.conditions.is_empty() {
            match condition::evaluate_all(&snapshot.conditions, &ctx, record.as_ref()) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(schedule = %schedule_id,
                        "timer conditions no longer hold; skipping transition");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(schedule = %schedule_id, error = %e,
                        "timer condition evaluation failed; skipping transition");
                    return Ok(());
                }
            }
        }

        let operation = snapshot
            .target_operation_code
            .as_deref()
            .unwrap_or(OP_AUTO_TRANSITION);
        match self
            .manager
            .transition(&schedule.entity_name, schedule.entity_id, operation, &ctx, None)
            .await
        {
            Ok(result) => {
                tracing::info!(schedule = %schedule_id, state = %result.state_code,
                    "auto-transition fired");
            }
            Err(e) => {
                tracing::warn!(schedule = %schedule_id, error = %e,
                    "auto-transition failed; timer stays fired");
            }
        }
        Ok(())
    }
}

fn parse_epoch_ms(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .ok(),
        _ => None,
    }
}
