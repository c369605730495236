use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayStatus {
    Draft,
    Published,
    Archived,
}

/// What to do when a change collides with existing schema content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    #[default]
    Fail,
    Overwrite,
    Merge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayChangeKind {
    AddField,
    ModifyField,
    RemoveField,
    TweakPolicy,
}

/// One additive modification. The payload shape depends on the kind:
/// a full field definition for `add_field`, a partial object merged by name
/// for `modify_field`/`tweak_policy`, and `{"name": ...}` for `remove_field`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlayChange {
    pub kind: OverlayChangeKind,
    pub payload: serde_json::Value,
    pub sort_order: i32,
    #[serde(default)]
    pub conflict_mode: ConflictMode,
}

/// An ordered bundle of changes layered onto a base schema version at
/// compile time. Never mutates the base.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Overlay {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: OverlayStatus,
    pub changes: Vec<OverlayChange>,
}

impl Overlay {
    /// Changes in application order.
    pub fn ordered_changes(&self) -> Vec<&OverlayChange> {
        let mut changes: Vec<&OverlayChange> = self.changes.iter().collect();
        changes.sort_by_key(|c| c.sort_order);
        changes
    }
}

/// Store of overlays. An overlay set is an ordered list of published overlay
/// ids; `resolve_set` rejects ids that are missing or not published.
#[async_trait]
pub trait OverlayStore: Send + Sync {
    async fn save(&self, overlay: &Overlay) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Overlay>>;
    async fn set_status(&self, id: Uuid, status: OverlayStatus) -> Result<()>;
    async fn resolve_set(&self, overlay_set: &[Uuid]) -> Result<Vec<Overlay>>;
    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Overlay>>;
}

pub struct MemoryOverlayStore {
    inner: RwLock<HashMap<Uuid, Overlay>>,
}

impl MemoryOverlayStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryOverlayStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OverlayStore for MemoryOverlayStore {
    async fn save(&self, overlay: &Overlay) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(existing) = w.get(&overlay.id) {
            if existing.status != OverlayStatus::Draft {
                return Err(anyhow!(
                    "cannot modify {} overlay {}",
                    match existing.status {
                        OverlayStatus::Published => "published",
                        _ => "archived",
                    },
                    overlay.id
                ));
            }
        }
        w.insert(overlay.id, overlay.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Overlay>> {
        let r = self.inner.read().await;
        Ok(r.get(&id).cloned())
    }

    async fn set_status(&self, id: Uuid, status: OverlayStatus) -> Result<()> {
        let mut w = self.inner.write().await;
        let overlay = w
            .get_mut(&id)
            .ok_or_else(|| anyhow!("overlay not found: {id}"))?;
        match (overlay.status, status) {
            (OverlayStatus::Draft, OverlayStatus::Published)
            | (OverlayStatus::Published, OverlayStatus::Archived) => {
                overlay.status = status;
                Ok(())
            }
            (from, to) => Err(anyhow!("invalid overlay transition {from:?} → {to:?} for {id}")),
        }
    }

    async fn resolve_set(&self, overlay_set: &[Uuid]) -> Result<Vec<Overlay>> {
        let r = self.inner.read().await;
        let mut resolved = Vec::with_capacity(overlay_set.len());
        for id in overlay_set {
            let overlay = r
                .get(id)
                .ok_or_else(|| anyhow!("overlay not found: {id}"))?;
            if overlay.status != OverlayStatus::Published {
                return Err(anyhow!("overlay {id} is not published"));
            }
            resolved.push(overlay.clone());
        }
        Ok(resolved)
    }

    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Overlay>> {
        let r = self.inner.read().await;
        Ok(r.values()
            .filter(|o| o.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}
