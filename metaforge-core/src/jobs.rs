use crate::context::{now_ms, Timestamp};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Job kind handled by the timer worker.
pub const JOB_LIFECYCLE_AUTO_TRANSITION: &str = "lifecycle-auto-transition";
/// Job kind for the outbox drain tick.
pub const JOB_AUDIT_DRAIN: &str = "audit-drain";
/// Job kind for the daily partition maintenance tick.
pub const JOB_PARTITION_LIFECYCLE: &str = "partition-lifecycle";

/// A delayed job handed to the queue capability.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: String,
    pub payload: serde_json::Value,
    pub delay_ms: u64,
    pub attempts: u32,
}

/// A job as stored by the queue, visible to workers when due.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub due_at: Timestamp,
    pub attempts: u32,
}

/// The delayed-job queue capability: at-least-once delivery after a delay.
/// `add` returns the queue-assigned job id; `remove_job` is best-effort
/// cancellation of a not-yet-delivered job.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn add(&self, job: &JobRequest) -> Result<String>;
    async fn remove_job(&self, job_id: &str) -> Result<()>;
    /// Pop every job whose delay has elapsed, oldest first.
    async fn take_due(&self, now: Timestamp, max: usize) -> Result<Vec<QueuedJob>>;
}

struct Inner {
    jobs: HashMap<String, QueuedJob>,
}

/// In-memory queue for tests and single-process deployments.
pub struct MemoryJobQueue {
    inner: RwLock<Inner>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                jobs: HashMap::new(),
            }),
        }
    }

    /// Number of jobs currently waiting (test helper).
    pub async fn pending(&self) -> usize {
        self.inner.read().await.jobs.len()
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn add(&self, job: &JobRequest) -> Result<String> {
        let job_id = Uuid::now_v7().to_string();
        let queued = QueuedJob {
            job_id: job_id.clone(),
            kind: job.kind.clone(),
            payload: job.payload.clone(),
            due_at: now_ms() + job.delay_ms as i64,
            attempts: job.attempts,
        };
        let mut w = self.inner.write().await;
        w.jobs.insert(job_id.clone(), queued);
        Ok(job_id)
    }

    async fn remove_job(&self, job_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.jobs.remove(job_id);
        Ok(())
    }

    async fn take_due(&self, now: Timestamp, max: usize) -> Result<Vec<QueuedJob>> {
        let mut w = self.inner.write().await;
        let mut due: Vec<QueuedJob> = w
            .jobs
            .values()
            .filter(|j| j.due_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.due_at);
        due.truncate(max);
        for job in &due {
            w.jobs.remove(&job.job_id);
        }
        Ok(due)
    }
}
