//! Multi-tenant metadata-driven entity platform core.
//!
//! Two coupled engines: a schema/policy compiler producing an immutable,
//! cache-addressable IR, and a workflow runtime driving entities through
//! per-tenant lifecycle state machines gated by policies, thresholds, and
//! multi-stage approvals, with durable timers and an audit outbox.
//!
//! Transport, identity resolution, the relational store, and the delayed-job
//! queue are external capabilities consumed behind traits; in-memory
//! implementations back tests and single-process deployments, and the
//! `postgres` feature provides sqlx-backed stores.

pub mod approval;
pub mod audit;
pub mod bus;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod lifecycle;
pub mod numbering;
pub mod policy;
pub mod schema;
pub mod timer;
pub mod txn;
pub mod validation;

#[cfg(feature = "postgres")]
pub mod postgres;

use crate::approval::ApprovalEngine;
use crate::audit::{AuditOutbox, DrainWorker, MemoryAuditSink, MemoryOutboxStore};
use crate::bus::{PlatformBus, PlatformMessage};
use crate::cache::{MemoryKv, ModelCache};
use crate::compiler::ModelCompiler;
use crate::config::PlatformConfig;
use crate::data::{DataService, MemoryRecordStore};
use crate::identity::MemoryIdentityProvider;
use crate::jobs::MemoryJobQueue;
use crate::lifecycle::{LifecycleManager, MemoryLifecycleStore, RouteCompiler};
use crate::numbering::{MemoryNumberingStore, NumberingService};
use crate::policy::{MemoryDecisionLog, PolicyEngine};
use crate::schema::{MemoryOverlayStore, MemorySchemaRegistry};
use crate::timer::{MemoryTimerStore, TimerService, TimerWorker};
use crate::txn::{MemoryTxnManager, TxnManager};
use crate::validation::ValidationEngine;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// The per-process service container. Everything that was a global in the
/// source system is an explicit field here.
pub struct Platform {
    pub config: PlatformConfig,
    pub registry: Arc<MemorySchemaRegistry>,
    pub overlays: Arc<MemoryOverlayStore>,
    pub compiler: Arc<ModelCompiler>,
    pub policy: Arc<PolicyEngine>,
    pub decision_log: Arc<MemoryDecisionLog>,
    pub validation: Arc<ValidationEngine>,
    pub routes: Arc<RouteCompiler>,
    pub lifecycle_store: Arc<MemoryLifecycleStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub approval_store: Arc<approval::MemoryApprovalStore>,
    pub approvals: Arc<ApprovalEngine>,
    pub timer_store: Arc<MemoryTimerStore>,
    pub timers: Arc<TimerService>,
    pub timer_worker: Arc<TimerWorker>,
    pub queue: Arc<MemoryJobQueue>,
    pub records: Arc<MemoryRecordStore>,
    pub data: Arc<DataService>,
    pub outbox_store: Arc<MemoryOutboxStore>,
    pub outbox: Arc<AuditOutbox>,
    pub audit_sink: Arc<MemoryAuditSink>,
    pub drain: Arc<DrainWorker>,
    pub identity: Arc<MemoryIdentityProvider>,
    pub numbering_store: Arc<MemoryNumberingStore>,
    pub txn_manager: Arc<dyn TxnManager>,
    pub bus: PlatformBus,
    bus_feed: Mutex<Option<mpsc::UnboundedReceiver<PlatformMessage>>>,
}

impl Platform {
    /// Wire the full platform over in-memory capabilities.
    pub fn in_memory(config: PlatformConfig) -> Self {
        let registry = Arc::new(MemorySchemaRegistry::new());
        let overlays = Arc::new(MemoryOverlayStore::new());
        let kv = Arc::new(MemoryKv::new());
        let cache = Arc::new(ModelCache::new(&config.cache, kv.clone()));
        let compiler = Arc::new(ModelCompiler::new(
            registry.clone(),
            overlays.clone(),
            cache,
        ));

        let decision_log = Arc::new(MemoryDecisionLog::new());
        let policy = Arc::new(PolicyEngine::new(decision_log.clone()));

        let records = Arc::new(MemoryRecordStore::new());
        let validation = Arc::new(ValidationEngine::new(records.clone(), kv));

        let txn_manager: Arc<dyn TxnManager> = Arc::new(MemoryTxnManager);

        let outbox_store = Arc::new(MemoryOutboxStore::new());
        let outbox = Arc::new(AuditOutbox::new(
            outbox_store.clone(),
            txn_manager.clone(),
            config.drain.max_attempts,
        ));
        let audit_sink = Arc::new(MemoryAuditSink::new());
        let drain = Arc::new(DrainWorker::new(
            outbox_store.clone(),
            audit_sink.clone(),
            config.drain.clone(),
        ));

        let identity = Arc::new(MemoryIdentityProvider::new());
        let (bus, bus_rx) = PlatformBus::channel();
        let approval_store = Arc::new(approval::MemoryApprovalStore::new());
        let approvals = Arc::new(ApprovalEngine::new(
            approval_store.clone(),
            identity.clone(),
            outbox.clone(),
            bus.clone(),
        ));

        let lifecycle_store = Arc::new(MemoryLifecycleStore::new());
        let routes = Arc::new(RouteCompiler::new(lifecycle_store.clone()));
        let queue = Arc::new(MemoryJobQueue::new());
        let timer_store = Arc::new(MemoryTimerStore::new());
        let timers = Arc::new(TimerService::new(
            timer_store.clone(),
            queue.clone(),
            lifecycle_store.clone(),
        ));

        let lifecycle = Arc::new(LifecycleManager::new(
            lifecycle_store.clone(),
            routes.clone(),
            compiler.clone(),
            policy.clone(),
            approvals.clone(),
            timers.clone(),
            records.clone(),
            outbox.clone(),
            txn_manager.clone(),
        ));

        let timer_worker = Arc::new(TimerWorker::new(
            timers.clone(),
            lifecycle.clone(),
            records.clone(),
            "core",
        ));

        let numbering_store = Arc::new(MemoryNumberingStore::new());
        let numbering = Arc::new(NumberingService::new(numbering_store.clone()));

        let data = Arc::new(DataService::new(
            compiler.clone(),
            policy.clone(),
            validation.clone(),
            lifecycle.clone(),
            records.clone(),
            registry.clone(),
            numbering,
            outbox.clone(),
            txn_manager.clone(),
            config.query.clone(),
        ));

        Self {
            config,
            registry,
            overlays,
            compiler,
            policy,
            decision_log,
            validation,
            routes,
            lifecycle_store,
            lifecycle,
            approval_store,
            approvals,
            timer_store,
            timers,
            timer_worker,
            queue,
            records,
            data,
            outbox_store,
            outbox,
            audit_sink,
            drain,
            identity,
            numbering_store,
            txn_manager,
            bus,
            bus_feed: Mutex::new(Some(bus_rx)),
        }
    }

    /// Take the bus receiver (once); callers either spawn the worker or
    /// drain it manually in tests.
    pub async fn take_bus_feed(&self) -> Option<mpsc::UnboundedReceiver<PlatformMessage>> {
        self.bus_feed.lock().await.take()
    }

    /// Spawn the approval-completion worker on the current runtime.
    pub async fn spawn_approval_worker(&self) -> Option<tokio::task::JoinHandle<()>> {
        let rx = self.take_bus_feed().await?;
        let lifecycle = self.lifecycle.clone();
        Some(tokio::spawn(lifecycle.run(rx)))
    }
}
