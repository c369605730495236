use crate::context::Timestamp;
use crate::lifecycle::model::{
    CompiledRoute, Lifecycle, LifecycleEvent, LifecycleInstance, RoutingRule,
};
use crate::txn::TxnHandle;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for lifecycle definitions, routing rules, instances, and the
/// append-only event log. Instance and event writes go through the caller's
/// transaction so a state change commits together with its event and the
/// business mutation that caused it.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    // ── Definitions ──

    async fn save_lifecycle(&self, lifecycle: &Lifecycle) -> Result<()>;
    async fn load_lifecycle(&self, id: Uuid) -> Result<Option<Lifecycle>>;

    // ── Routing ──

    async fn save_routing_rules(&self, entity_name: &str, rules: &[RoutingRule]) -> Result<()>;
    async fn load_routing_rules(&self, entity_name: &str) -> Result<Vec<RoutingRule>>;
    async fn save_compiled_route(&self, route: &CompiledRoute) -> Result<()>;
    async fn load_compiled_route(&self, entity_name: &str) -> Result<Option<CompiledRoute>>;

    // ── Instances ──

    async fn upsert_instance(&self, txn: &mut TxnHandle, instance: &LifecycleInstance)
        -> Result<()>;
    async fn load_instance(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Option<LifecycleInstance>>;

    /// Compare-and-set transition: updates the instance only when its current
    /// state still equals `expected_state`. Returns false when the CAS lost.
    async fn transition_instance(
        &self,
        txn: &mut TxnHandle,
        instance_id: Uuid,
        expected_state: Uuid,
        new_state: Uuid,
        updated_by: Uuid,
        updated_at: Timestamp,
    ) -> Result<bool>;

    // ── Events ──

    async fn append_event(&self, txn: &mut TxnHandle, event: &LifecycleEvent) -> Result<()>;
    async fn load_events(&self, instance_id: Uuid) -> Result<Vec<LifecycleEvent>>;
}

type InstanceKey = (Uuid, String, Uuid);

struct Inner {
    lifecycles: HashMap<Uuid, Lifecycle>,
    routing: HashMap<String, Vec<RoutingRule>>,
    compiled_routes: HashMap<String, CompiledRoute>,
    instances: HashMap<InstanceKey, LifecycleInstance>,
    events: HashMap<Uuid, Vec<LifecycleEvent>>,
}

/// In-memory implementation for tests and single-process deployments.
pub struct MemoryLifecycleStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryLifecycleStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                lifecycles: HashMap::new(),
                routing: HashMap::new(),
                compiled_routes: HashMap::new(),
                instances: HashMap::new(),
                events: HashMap::new(),
            })),
        }
    }
}

impl Default for MemoryLifecycleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LifecycleStore for MemoryLifecycleStore {
    // ── Definitions ──

    async fn save_lifecycle(&self, lifecycle: &Lifecycle) -> Result<()> {
        let mut w = self.inner.write().await;
        w.lifecycles.insert(lifecycle.id, lifecycle.clone());
        Ok(())
    }

    async fn load_lifecycle(&self, id: Uuid) -> Result<Option<Lifecycle>> {
        let r = self.inner.read().await;
        Ok(r.lifecycles.get(&id).cloned())
    }

    // ── Routing ──

    async fn save_routing_rules(&self, entity_name: &str, rules: &[RoutingRule]) -> Result<()> {
        let mut w = self.inner.write().await;
        w.routing.insert(entity_name.to_string(), rules.to_vec());
        Ok(())
    }

    async fn load_routing_rules(&self, entity_name: &str) -> Result<Vec<RoutingRule>> {
        let r = self.inner.read().await;
        Ok(r.routing.get(entity_name).cloned().unwrap_or_default())
    }

    async fn save_compiled_route(&self, route: &CompiledRoute) -> Result<()> {
        let mut w = self.inner.write().await;
        w.compiled_routes
            .insert(route.entity_name.clone(), route.clone());
        Ok(())
    }

    async fn load_compiled_route(&self, entity_name: &str) -> Result<Option<CompiledRoute>> {
        let r = self.inner.read().await;
        Ok(r.compiled_routes.get(entity_name).cloned())
    }

    // ── Instances ──

    async fn upsert_instance(
        &self,
        txn: &mut TxnHandle,
        instance: &LifecycleInstance,
    ) -> Result<()> {
        let txn = txn.memory()?;
        let key = (
            instance.tenant_id,
            instance.entity_name.clone(),
            instance.entity_id,
        );

        let mut w = self.inner.write().await;
        let previous = w.instances.insert(key.clone(), instance.clone());

        let inner = self.inner.clone();
        txn.push_undo(move || async move {
            let mut w = inner.write().await;
            match previous {
                Some(previous) => {
                    w.instances.insert(key, previous);
                }
                None => {
                    w.instances.remove(&key);
                }
            }
        });
        Ok(())
    }

    async fn load_instance(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Option<LifecycleInstance>> {
        let r = self.inner.read().await;
        Ok(r.instances
            .get(&(tenant_id, entity_name.to_string(), entity_id))
            .cloned())
    }

    async fn transition_instance(
        &self,
        txn: &mut TxnHandle,
        instance_id: Uuid,
        expected_state: Uuid,
        new_state: Uuid,
        updated_by: Uuid,
        updated_at: Timestamp,
    ) -> Result<bool> {
        let txn = txn.memory()?;

        let mut w = self.inner.write().await;
        let (key, instance) = w
            .instances
            .iter_mut()
            .find(|(_, i)| i.id == instance_id)
            .map(|(k, i)| (k.clone(), i))
            .ok_or_else(|| anyhow!("lifecycle instance not found: {instance_id}"))?;
        if instance.state_id != expected_state {
            return Ok(false);
        }

        let previous = instance.clone();
        instance.state_id = new_state;
        instance.updated_by = updated_by;
        instance.updated_at = updated_at;

        let inner = self.inner.clone();
        txn.push_undo(move || async move {
            let mut w = inner.write().await;
            w.instances.insert(key, previous);
        });
        Ok(true)
    }

    // ── Events ──

    async fn append_event(&self, txn: &mut TxnHandle, event: &LifecycleEvent) -> Result<()> {
        let txn = txn.memory()?;
        let instance_id = event.instance_id;
        let event_id = event.id;

        let mut w = self.inner.write().await;
        w.events.entry(instance_id).or_default().push(event.clone());

        let inner = self.inner.clone();
        txn.push_undo(move || async move {
            let mut w = inner.write().await;
            if let Some(events) = w.events.get_mut(&instance_id) {
                events.retain(|e| e.id != event_id);
            }
        });
        Ok(())
    }

    async fn load_events(&self, instance_id: Uuid) -> Result<Vec<LifecycleEvent>> {
        let r = self.inner.read().await;
        Ok(r.events.get(&instance_id).cloned().unwrap_or_default())
    }
}
