use crate::compiler::ir::CompiledModel;
use crate::compiler::snake_case;
use crate::context::{now_ms, Timestamp};
use crate::data::query::{FilterOp, Query, QueryFilter};
use crate::policy::condition::Record;
use crate::timer::service::RecordSource;
use crate::txn::TxnHandle;
use crate::validation::RecordLookup;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Tenant-isolated record persistence over IR-described tables. Table and
/// column names always come from the IR, never from caller input. Writes go
/// through the caller's transaction so a record mutation commits together
/// with its lifecycle and outbox rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(
        &self,
        txn: &mut TxnHandle,
        model: &CompiledModel,
        tenant_id: Uuid,
        record: &Record,
    ) -> Result<()>;

    async fn get(
        &self,
        model: &CompiledModel,
        tenant_id: Uuid,
        id: Uuid,
        include_deleted: bool,
        as_of: Option<Timestamp>,
    ) -> Result<Option<Record>>;

    async fn query(
        &self,
        model: &CompiledModel,
        tenant_id: Uuid,
        query: &Query,
    ) -> Result<Vec<Record>>;

    /// Full-record replacement guarded by the optimistic `version` column.
    /// Returns false when the stored version no longer matches.
    async fn update_cas(
        &self,
        txn: &mut TxnHandle,
        model: &CompiledModel,
        tenant_id: Uuid,
        id: Uuid,
        expected_version: i64,
        record: &Record,
    ) -> Result<bool>;

    /// Rows of `model` whose `field` references `target_id` and are not
    /// soft-deleted.
    async fn referencing_records(
        &self,
        model: &CompiledModel,
        tenant_id: Uuid,
        field_api_name: &str,
        target_id: Uuid,
    ) -> Result<Vec<Record>>;

    /// Null out `field` on every active row referencing `target_id`.
    async fn null_references(
        &self,
        txn: &mut TxnHandle,
        model: &CompiledModel,
        tenant_id: Uuid,
        field_api_name: &str,
        target_id: Uuid,
    ) -> Result<u64>;
}

type TableKey = (Uuid, String);

struct Inner {
    tables: HashMap<TableKey, HashMap<Uuid, Record>>,
}

/// In-memory record store. Also serves as the record lookup for the
/// validation engine and the record source for timers.
pub struct MemoryRecordStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                tables: HashMap::new(),
            })),
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn record_id(record: &Record) -> Result<Uuid> {
    record
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| anyhow!("record has no uuid `id`"))
}

fn is_deleted(record: &Record) -> bool {
    record
        .get("deleted_at")
        .is_some_and(|v| !v.is_null())
}

fn effective_at(record: &Record, as_of: Timestamp) -> bool {
    let from_ok = match record.get("effective_from").and_then(|v| v.as_i64()) {
        Some(from) => from <= as_of,
        None => true,
    };
    let to_ok = match record.get("effective_to").and_then(|v| v.as_i64()) {
        Some(to) => to > as_of,
        None => true,
    };
    from_ok && to_ok
}

fn filter_matches(record: &Record, filter: &QueryFilter) -> bool {
    let value = record
        .get(&filter.field)
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    match filter.op {
        FilterOp::IsNull => value.is_null(),
        FilterOp::Eq => loose_eq(&value, &filter.value),
        FilterOp::Ne => !loose_eq(&value, &filter.value),
        FilterOp::Gt => ordering(&value, &filter.value) == Some(std::cmp::Ordering::Greater),
        FilterOp::Gte => matches!(
            ordering(&value, &filter.value),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
        FilterOp::Lt => ordering(&value, &filter.value) == Some(std::cmp::Ordering::Less),
        FilterOp::Lte => matches!(
            ordering(&value, &filter.value),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
        FilterOp::Contains => match (value.as_str(), filter.value.as_str()) {
            (Some(s), Some(sub)) => s.contains(sub),
            _ => false,
        },
        FilterOp::StartsWith => match (value.as_str(), filter.value.as_str()) {
            (Some(s), Some(prefix)) => s.starts_with(prefix),
            _ => false,
        },
        FilterOp::EndsWith => match (value.as_str(), filter.value.as_str()) {
            (Some(s), Some(suffix)) => s.ends_with(suffix),
            _ => false,
        },
        FilterOp::In => filter
            .value
            .as_array()
            .is_some_and(|items| items.iter().any(|v| loose_eq(&value, v))),
    }
}

fn loose_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    if a == b {
        return true;
    }
    matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x == y)
}

fn ordering(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(
        &self,
        txn: &mut TxnHandle,
        model: &CompiledModel,
        tenant_id: Uuid,
        record: &Record,
    ) -> Result<()> {
        let id = record_id(record)?;
        let txn = txn.memory()?;
        let key = (tenant_id, model.table_name.clone());

        let mut w = self.inner.write().await;
        let table = w.tables.entry(key.clone()).or_default();
        if table.contains_key(&id) {
            return Err(anyhow!("duplicate id {id} in {}", model.table_name));
        }
        table.insert(id, record.clone());

        let inner = self.inner.clone();
        txn.push_undo(move || async move {
            let mut w = inner.write().await;
            if let Some(table) = w.tables.get_mut(&key) {
                table.remove(&id);
            }
        });
        Ok(())
    }

    async fn get(
        &self,
        model: &CompiledModel,
        tenant_id: Uuid,
        id: Uuid,
        include_deleted: bool,
        as_of: Option<Timestamp>,
    ) -> Result<Option<Record>> {
        let r = self.inner.read().await;
        let Some(record) = r
            .tables
            .get(&(tenant_id, model.table_name.clone()))
            .and_then(|t| t.get(&id))
        else {
            return Ok(None);
        };
        if !include_deleted && is_deleted(record) {
            return Ok(None);
        }
        if model.effective_dated() {
            let at = as_of.unwrap_or_else(now_ms);
            if !effective_at(record, at) {
                return Ok(None);
            }
        }
        Ok(Some(record.clone()))
    }

    async fn query(
        &self,
        model: &CompiledModel,
        tenant_id: Uuid,
        query: &Query,
    ) -> Result<Vec<Record>> {
        let r = self.inner.read().await;
        let Some(table) = r.tables.get(&(tenant_id, model.table_name.clone())) else {
            return Ok(Vec::new());
        };

        let as_of = query.as_of.unwrap_or_else(now_ms);
        let mut rows: Vec<Record> = table
            .values()
            .filter(|record| query.include_deleted || !is_deleted(record))
            .filter(|record| !model.effective_dated() || effective_at(record, as_of))
            .filter(|record| query.filters.iter().all(|f| filter_matches(record, f)))
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            for sort in &query.sort {
                let left = a.get(&sort.field).cloned().unwrap_or(serde_json::Value::Null);
                let right = b.get(&sort.field).cloned().unwrap_or(serde_json::Value::Null);
                let ord = ordering(&left, &right)
                    .unwrap_or(std::cmp::Ordering::Equal);
                let ord = if sort.descending { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            // Stable fallback: id order.
            let ai = a.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let bi = b.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            ai.cmp(bi)
        });

        let start = (query.page - 1).saturating_mul(query.page_size);
        Ok(rows.into_iter().skip(start).take(query.page_size).collect())
    }

    async fn update_cas(
        &self,
        txn: &mut TxnHandle,
        model: &CompiledModel,
        tenant_id: Uuid,
        id: Uuid,
        expected_version: i64,
        record: &Record,
    ) -> Result<bool> {
        let txn = txn.memory()?;
        let key = (tenant_id, model.table_name.clone());

        let mut w = self.inner.write().await;
        let table = w.tables.entry(key.clone()).or_default();
        let Some(existing) = table.get_mut(&id) else {
            return Err(anyhow!("record {id} not found in {}", model.table_name));
        };
        let current = existing
            .get("version")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if current != expected_version {
            return Ok(false);
        }

        let previous = existing.clone();
        *existing = record.clone();

        let inner = self.inner.clone();
        txn.push_undo(move || async move {
            let mut w = inner.write().await;
            if let Some(table) = w.tables.get_mut(&key) {
                table.insert(id, previous);
            }
        });
        Ok(true)
    }

    async fn referencing_records(
        &self,
        model: &CompiledModel,
        tenant_id: Uuid,
        field_api_name: &str,
        target_id: Uuid,
    ) -> Result<Vec<Record>> {
        let r = self.inner.read().await;
        let Some(table) = r.tables.get(&(tenant_id, model.table_name.clone())) else {
            return Ok(Vec::new());
        };
        let target = target_id.to_string();
        Ok(table
            .values()
            .filter(|record| !is_deleted(record))
            .filter(|record| {
                record
                    .get(field_api_name)
                    .and_then(|v| v.as_str())
                    .is_some_and(|s| s == target)
            })
            .cloned()
            .collect())
    }

    async fn null_references(
        &self,
        txn: &mut TxnHandle,
        model: &CompiledModel,
        tenant_id: Uuid,
        field_api_name: &str,
        target_id: Uuid,
    ) -> Result<u64> {
        let txn = txn.memory()?;
        let key = (tenant_id, model.table_name.clone());

        let mut w = self.inner.write().await;
        let Some(table) = w.tables.get_mut(&key) else {
            return Ok(0);
        };
        let target = target_id.to_string();
        let field = field_api_name.to_string();
        let mut previous: Vec<(Uuid, serde_json::Value)> = Vec::new();
        for (id, record) in table.iter_mut() {
            if is_deleted(record) {
                continue;
            }
            let matches = record
                .get(&field)
                .and_then(|v| v.as_str())
                .is_some_and(|s| s == target);
            if matches {
                previous.push((*id, record.get(&field).cloned().unwrap_or_default()));
                record.insert(field.clone(), serde_json::Value::Null);
            }
        }
        let updated = previous.len() as u64;

        let inner = self.inner.clone();
        txn.push_undo(move || async move {
            let mut w = inner.write().await;
            if let Some(table) = w.tables.get_mut(&key) {
                for (id, value) in previous {
                    if let Some(record) = table.get_mut(&id) {
                        record.insert(field.clone(), value);
                    }
                }
            }
        });
        Ok(updated)
    }
}

// The memory store doubles as the validation lookup and the timer record
// source. Table names derive from the same IR naming rule.
fn table_of(entity_name: &str) -> String {
    format!("ent_{}", snake_case(entity_name))
}

#[async_trait]
impl RecordLookup for MemoryRecordStore {
    async fn reference_exists(
        &self,
        tenant_id: Uuid,
        target_entity: &str,
        id: &serde_json::Value,
    ) -> Result<Option<bool>> {
        let r = self.inner.read().await;
        let Some(table) = r.tables.get(&(tenant_id, table_of(target_entity))) else {
            return Ok(None);
        };
        let Some(id) = id.as_str().and_then(|s| Uuid::parse_str(s).ok()) else {
            return Ok(Some(false));
        };
        Ok(Some(table.get(&id).is_some_and(|rec| !is_deleted(rec))))
    }

    async fn duplicate_exists(
        &self,
        tenant_id: Uuid,
        entity: &str,
        field: &str,
        value: &serde_json::Value,
        scope: &[(String, serde_json::Value)],
        exclude_id: Option<Uuid>,
    ) -> Result<bool> {
        let r = self.inner.read().await;
        let Some(table) = r.tables.get(&(tenant_id, table_of(entity))) else {
            return Ok(false);
        };
        Ok(table.iter().any(|(id, record)| {
            if exclude_id.is_some_and(|x| x == *id) || is_deleted(record) {
                return false;
            }
            let field_matches = record
                .get(field)
                .is_some_and(|v| loose_eq(v, value));
            let scope_matches = scope.iter().all(|(name, expected)| {
                let actual = record.get(name).cloned().unwrap_or(serde_json::Value::Null);
                loose_eq(&actual, expected)
            });
            field_matches && scope_matches
        }))
    }
}

#[async_trait]
impl RecordSource for MemoryRecordStore {
    async fn fetch(
        &self,
        tenant_id: Uuid,
        entity_name: &str,
        entity_id: Uuid,
    ) -> Result<Option<Record>> {
        let r = self.inner.read().await;
        Ok(r.tables
            .get(&(tenant_id, table_of(entity_name)))
            .and_then(|t| t.get(&entity_id))
            .filter(|record| !is_deleted(record))
            .cloned())
    }
}
