use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The identity capability: role and group resolution for principals.
/// Consumed read-only; this core never mutates identity data.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn roles_for(&self, tenant_id: Uuid, principal: Uuid) -> Result<Vec<String>>;
    async fn principals_with_role(&self, tenant_id: Uuid, role: &str) -> Result<Vec<Uuid>>;
    async fn members_of_group(&self, tenant_id: Uuid, group: &str) -> Result<Vec<Uuid>>;
}

struct Inner {
    roles: HashMap<(Uuid, Uuid), Vec<String>>,
    groups: HashMap<(Uuid, String), Vec<Uuid>>,
}

/// In-memory identity provider for tests.
pub struct MemoryIdentityProvider {
    inner: RwLock<Inner>,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                roles: HashMap::new(),
                groups: HashMap::new(),
            }),
        }
    }

    pub async fn grant_role(&self, tenant_id: Uuid, principal: Uuid, role: &str) {
        self.inner
            .write()
            .await
            .roles
            .entry((tenant_id, principal))
            .or_default()
            .push(role.to_string());
    }

    pub async fn add_to_group(&self, tenant_id: Uuid, principal: Uuid, group: &str) {
        self.inner
            .write()
            .await
            .groups
            .entry((tenant_id, group.to_string()))
            .or_default()
            .push(principal);
    }
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn roles_for(&self, tenant_id: Uuid, principal: Uuid) -> Result<Vec<String>> {
        let r = self.inner.read().await;
        Ok(r.roles
            .get(&(tenant_id, principal))
            .cloned()
            .unwrap_or_default())
    }

    async fn principals_with_role(&self, tenant_id: Uuid, role: &str) -> Result<Vec<Uuid>> {
        let r = self.inner.read().await;
        let mut principals: Vec<Uuid> = r
            .roles
            .iter()
            .filter(|((t, _), roles)| *t == tenant_id && roles.iter().any(|x| x == role))
            .map(|((_, p), _)| *p)
            .collect();
        principals.sort();
        Ok(principals)
    }

    async fn members_of_group(&self, tenant_id: Uuid, group: &str) -> Result<Vec<Uuid>> {
        let r = self.inner.read().await;
        Ok(r.groups
            .get(&(tenant_id, group.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
