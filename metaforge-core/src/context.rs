use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Metadata key set by the approval engine when a completed approval re-runs
/// the gated transition. Gates skip the approval check when it is `true`.
pub const META_APPROVAL_BYPASS: &str = "_approvalBypass";

/// Metadata key carried by system contexts created for timer execution.
pub const META_TIMER_EXECUTION: &str = "_timerExecution";

/// Immutable per-request tuple: who is acting, where, and under which
/// correlation id. Built once at the transport boundary and threaded through
/// every engine unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestContext {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub realm_id: String,
    pub roles: Vec<String>,
    pub org_key: Option<String>,
    /// Correlation id; generated when the transport did not supply one.
    pub request_id: String,
    /// Absolute deadline for I/O issued on behalf of this request.
    pub deadline_ms: Option<Timestamp>,
    /// Engine-to-engine flags (`_approvalBypass`, `_timerExecution`, ...).
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl RequestContext {
    pub fn new(user_id: Uuid, tenant_id: Uuid, realm_id: &str, roles: Vec<String>) -> Self {
        Self {
            user_id,
            tenant_id,
            realm_id: realm_id.to_string(),
            roles,
            org_key: None,
            request_id: Uuid::now_v7().to_string(),
            deadline_ms: None,
            metadata: BTreeMap::new(),
        }
    }

    /// System context used by background workers (timer fire, drain). Carries
    /// the nil user and the `_timerExecution` flag when `timer` is set.
    pub fn system(tenant_id: Uuid, realm_id: &str, timer: bool) -> Self {
        let mut ctx = Self::new(Uuid::nil(), tenant_id, realm_id, vec!["system".to_string()]);
        if timer {
            ctx.metadata
                .insert(META_TIMER_EXECUTION.to_string(), serde_json::Value::Bool(true));
        }
        ctx
    }

    /// Copy of this context with a metadata flag set. Contexts are immutable;
    /// engines derive rather than mutate.
    pub fn with_flag(&self, key: &str, value: bool) -> Self {
        let mut next = self.clone();
        next.metadata
            .insert(key.to_string(), serde_json::Value::Bool(value));
        next
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.metadata.get(key), Some(serde_json::Value::Bool(true)))
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Resolve a context attribute by name for condition evaluation.
    /// `roles` yields an array; unknown names fall through to `metadata`.
    pub fn attribute(&self, name: &str) -> Option<serde_json::Value> {
        match name {
            "userId" | "user_id" => Some(serde_json::json!(self.user_id)),
            "tenantId" | "tenant_id" => Some(serde_json::json!(self.tenant_id)),
            "realmId" | "realm_id" => Some(serde_json::json!(self.realm_id)),
            "roles" => Some(serde_json::json!(self.roles)),
            "orgKey" | "org_key" => self.org_key.as_ref().map(|v| serde_json::json!(v)),
            "requestId" | "request_id" => Some(serde_json::json!(self.request_id)),
            other => self.metadata.get(other).cloned(),
        }
    }

    /// Milliseconds left before the request deadline, if one was set.
    pub fn remaining_ms(&self, now: Timestamp) -> Option<i64> {
        self.deadline_ms.map(|d| d - now)
    }

    pub fn deadline_exceeded(&self, now: Timestamp) -> bool {
        matches!(self.remaining_ms(now), Some(rem) if rem <= 0)
    }
}
