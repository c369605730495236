use crate::compiler::hash_canonical;
use crate::context::{now_ms, RequestContext};
use crate::error::PlatformResult;
use crate::lifecycle::model::{CompiledRoute, RoutingRule};
use crate::lifecycle::store::LifecycleStore;
use crate::policy::condition::{self, Record};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Resolves (entity, context) → lifecycle id through priority-ordered
/// conditional rules. Compiled routes are cached in process and persisted
/// keyed by their content hash.
pub struct RouteCompiler {
    store: Arc<dyn LifecycleStore>,
    compiled: Mutex<HashMap<String, Arc<CompiledRoute>>>,
}

impl RouteCompiler {
    pub fn new(store: Arc<dyn LifecycleStore>) -> Self {
        Self {
            store,
            compiled: Mutex::new(HashMap::new()),
        }
    }

    /// Load and compile the routing table for an entity: rules sorted by
    /// priority ascending (lower wins). Persists the compiled form when the
    /// hash changed.
    pub async fn compile(&self, entity_name: &str) -> PlatformResult<Arc<CompiledRoute>> {
        if let Ok(compiled) = self.compiled.lock() {
            if let Some(route) = compiled.get(entity_name) {
                return Ok(route.clone());
            }
        }

        let mut rules = self.store.load_routing_rules(entity_name).await?;
        rules.sort_by_key(|r| r.priority);
        let compiled_hash = hash_canonical(&rules)?;

        let route = Arc::new(CompiledRoute {
            entity_name: entity_name.to_string(),
            rules,
            compiled_hash: compiled_hash.clone(),
            compiled_at: now_ms(),
        });

        let persisted = self.store.load_compiled_route(entity_name).await?;
        if persisted.is_none_or(|p| p.compiled_hash != compiled_hash) {
            self.store.save_compiled_route(&route).await?;
        }

        if let Ok(mut compiled) = self.compiled.lock() {
            compiled.insert(entity_name.to_string(), route.clone());
        }
        Ok(route)
    }

    /// First rule whose conditions match wins; otherwise the default (first
    /// rule without conditions); otherwise none.
    pub async fn resolve(
        &self,
        entity_name: &str,
        ctx: &RequestContext,
        record: Option<&Record>,
    ) -> PlatformResult<Option<Uuid>> {
        let route = self.compile(entity_name).await?;

        let mut default: Option<&RoutingRule> = None;
        for rule in &route.rules {
            if rule.conditions.is_empty() {
                if default.is_none() {
                    default = Some(rule);
                }
                continue;
            }
            match condition::evaluate_all(&rule.conditions, ctx, record) {
                Ok(true) => return Ok(Some(rule.lifecycle_id)),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(entity = entity_name, rule = %rule.id, error = %e,
                        "routing rule evaluation failed; skipping");
                }
            }
        }
        Ok(default.map(|r| r.lifecycle_id))
    }

    /// Drop the in-process compilation for an entity (rules changed).
    pub fn invalidate(&self, entity_name: &str) {
        if let Ok(mut compiled) = self.compiled.lock() {
            compiled.remove(entity_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::store::MemoryLifecycleStore;
    use crate::policy::condition::{Condition, ConditionOp};
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext::new(Uuid::now_v7(), Uuid::now_v7(), "core", vec!["user".into()])
    }

    async fn compiler_with_rules(rules: Vec<RoutingRule>) -> (RouteCompiler, Arc<MemoryLifecycleStore>) {
        let store = Arc::new(MemoryLifecycleStore::new());
        store.save_routing_rules("Invoice", &rules).await.unwrap();
        (RouteCompiler::new(store.clone()), store)
    }

    fn rule(priority: i32, conditions: Vec<Condition>, lifecycle_id: Uuid) -> RoutingRule {
        RoutingRule {
            id: Uuid::now_v7(),
            priority,
            conditions,
            lifecycle_id,
        }
    }

    #[tokio::test]
    async fn lower_priority_conditional_rule_wins() {
        let special = Uuid::now_v7();
        let fallback = Uuid::now_v7();
        let (compiler, _) = compiler_with_rules(vec![
            rule(100, vec![], fallback),
            rule(
                10,
                vec![Condition::new(
                    "record.kind",
                    ConditionOp::Eq,
                    json!("EXPENSE"),
                )],
                special,
            ),
        ])
        .await;

        let mut record = Record::new();
        record.insert("kind".to_string(), json!("EXPENSE"));
        let resolved = compiler
            .resolve("Invoice", &ctx(), Some(&record))
            .await
            .unwrap();
        assert_eq!(resolved, Some(special));

        record.insert("kind".to_string(), json!("SALES"));
        let resolved = compiler
            .resolve("Invoice", &ctx(), Some(&record))
            .await
            .unwrap();
        assert_eq!(resolved, Some(fallback));
    }

    #[tokio::test]
    async fn no_rules_resolves_none() {
        let (compiler, _) = compiler_with_rules(vec![]).await;
        let resolved = compiler.resolve("Invoice", &ctx(), None).await.unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn compiled_route_is_persisted_with_hash() {
        let lifecycle = Uuid::now_v7();
        let (compiler, store) = compiler_with_rules(vec![rule(0, vec![], lifecycle)]).await;
        compiler.compile("Invoice").await.unwrap();

        let persisted = store.load_compiled_route("Invoice").await.unwrap().unwrap();
        assert!(!persisted.compiled_hash.is_empty());
        assert_eq!(persisted.rules.len(), 1);
    }
}
