use crate::compiler::ir::{CompiledField, CompiledModel};
use crate::context::{now_ms, Timestamp};
use crate::data::query::{FilterOp, Query};
use crate::data::store::RecordStore;
use crate::policy::condition::Record;
use crate::postgres::{datetime_to_epoch_ms, epoch_ms_to_datetime};
use crate::schema::model::FieldType;
use crate::txn::TxnHandle;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::postgres::PgArguments;
use sqlx::query::Query as SqlxQuery;
use sqlx::{Postgres, Row};
use uuid::Uuid;

/// PostgreSQL-backed `RecordStore` over IR-described tables.
///
/// Every identifier in generated SQL (table and columns) is read from the
/// compiled model; caller strings only ever travel as bind parameters. The
/// query validator has already confirmed fields and operators upstream.
pub struct PostgresRecordStore {
    pool: sqlx::PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

/// Bind one JSON value under the column's declared type.
fn bind_field<'q>(
    query: SqlxQuery<'q, Postgres, PgArguments>,
    field: &CompiledField,
    value: &serde_json::Value,
) -> Result<SqlxQuery<'q, Postgres, PgArguments>> {
    if value.is_null() {
        // Typed NULLs so postgres can infer the parameter.
        return Ok(match field.field_type {
            FieldType::String | FieldType::Enum => query.bind(None::<String>),
            FieldType::Number => query.bind(None::<f64>),
            FieldType::Boolean => query.bind(None::<bool>),
            FieldType::Date | FieldType::DateTime => {
                query.bind(None::<chrono::DateTime<chrono::Utc>>)
            }
            FieldType::Reference | FieldType::Uuid => query.bind(None::<Uuid>),
            FieldType::Json => query.bind(None::<serde_json::Value>),
        });
    }
    Ok(match field.field_type {
        FieldType::String | FieldType::Enum => query.bind(
            value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("{} expects a string", field.api_name))?,
        ),
        FieldType::Number => query.bind(
            value
                .as_f64()
                .ok_or_else(|| anyhow!("{} expects a number", field.api_name))?,
        ),
        FieldType::Boolean => query.bind(
            value
                .as_bool()
                .ok_or_else(|| anyhow!("{} expects a boolean", field.api_name))?,
        ),
        FieldType::Date | FieldType::DateTime => {
            let ms = value
                .as_i64()
                .or_else(|| {
                    value.as_str().and_then(|s| {
                        chrono::DateTime::parse_from_rfc3339(s)
                            .map(|dt| dt.timestamp_millis())
                            .ok()
                    })
                })
                .ok_or_else(|| anyhow!("{} expects a datetime", field.api_name))?;
            query.bind(epoch_ms_to_datetime(ms))
        }
        FieldType::Reference | FieldType::Uuid => query.bind(
            value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| anyhow!("{} expects a uuid", field.api_name))?,
        ),
        FieldType::Json => query.bind(value.clone()),
    })
}

/// Read one row back into a record keyed by API names. The select fragment
/// aliased each column to its API name already.
fn row_to_record(model: &CompiledModel, row: &sqlx::postgres::PgRow) -> Result<Record> {
    let mut record = Record::new();
    for field in &model.fields {
        let name = field.api_name.as_str();
        let value = match field.field_type {
            FieldType::String | FieldType::Enum => {
                let v: Option<String> = row.try_get(name)?;
                v.map(serde_json::Value::from)
            }
            FieldType::Number => {
                let v: Option<f64> = row.try_get(name)?;
                v.and_then(|n| serde_json::Number::from_f64(n).map(serde_json::Value::Number))
            }
            FieldType::Boolean => {
                let v: Option<bool> = row.try_get(name)?;
                v.map(serde_json::Value::from)
            }
            FieldType::Date | FieldType::DateTime => {
                let v: Option<chrono::DateTime<chrono::Utc>> = row.try_get(name)?;
                v.map(|dt| serde_json::Value::from(datetime_to_epoch_ms(dt)))
            }
            FieldType::Reference | FieldType::Uuid => {
                let v: Option<Uuid> = row.try_get(name)?;
                v.map(|u| serde_json::Value::from(u.to_string()))
            }
            FieldType::Json => {
                let v: Option<serde_json::Value> = row.try_get(name)?;
                v
            }
        };
        record.insert(name.to_string(), value.unwrap_or(serde_json::Value::Null));
    }
    Ok(record)
}

fn filter_sql(op: FilterOp, column: &str, param: usize) -> String {
    match op {
        FilterOp::Eq => format!("{column} = ${param}"),
        FilterOp::Ne => format!("{column} <> ${param}"),
        FilterOp::Gt => format!("{column} > ${param}"),
        FilterOp::Gte => format!("{column} >= ${param}"),
        FilterOp::Lt => format!("{column} < ${param}"),
        FilterOp::Lte => format!("{column} <= ${param}"),
        FilterOp::Contains => format!("{column} LIKE '%' || ${param} || '%'"),
        FilterOp::StartsWith => format!("{column} LIKE ${param} || '%'"),
        FilterOp::EndsWith => format!("{column} LIKE '%' || ${param}"),
        FilterOp::In => format!("{column} = ANY(${param})"),
        FilterOp::IsNull => format!("{column} IS NULL"),
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn insert(
        &self,
        txn: &mut TxnHandle,
        model: &CompiledModel,
        tenant_id: Uuid,
        record: &Record,
    ) -> Result<()> {
        let columns: Vec<&str> = model.fields.iter().map(|f| f.column_name.as_str()).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("${n}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            model.table_name,
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for field in &model.fields {
            let value = if field.column_name == "tenant_id" {
                serde_json::json!(tenant_id)
            } else {
                record
                    .get(&field.api_name)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null)
            };
            query = bind_field(query, field, &value)?;
        }
        let tx = txn.postgres()?;
        query.execute(&mut **tx).await?;
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
        let mut sql = format!(
            "SELECT {} FROM {} WHERE tenant_id = $1 AND id = $2",
            model.select_fragment, model.from_fragment
        );
        if !include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if model.effective_dated() {
            sql.push_str(
                " AND effective_from <= $3 AND (effective_to IS NULL OR effective_to > $3)",
            );
        }

        let mut query = sqlx::query(&sql).bind(tenant_id).bind(id);
        if model.effective_dated() {
            query = query.bind(epoch_ms_to_datetime(as_of.unwrap_or_else(now_ms)));
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.map(|row| row_to_record(model, &row)).transpose()
    }

    async fn query(
        &self,
        model: &CompiledModel,
        tenant_id: Uuid,
        query: &Query,
    ) -> Result<Vec<Record>> {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE tenant_id = $1",
            model.select_fragment, model.from_fragment
        );
        if !query.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }

        let mut param = 1usize;
        let mut filter_fields: Vec<(&CompiledField, &serde_json::Value, FilterOp)> = Vec::new();
        for filter in &query.filters {
            let field = model
                .field(&filter.field)
                .ok_or_else(|| anyhow!("filter field {} not in IR", filter.field))?;
            if filter.op == FilterOp::IsNull {
                sql.push_str(&format!(" AND {} IS NULL", field.column_name));
            } else {
                param += 1;
                sql.push_str(&format!(
                    " AND {}",
                    filter_sql(filter.op, &field.column_name, param)
                ));
                filter_fields.push((field, &filter.value, filter.op));
            }
        }

        if model.effective_dated() {
            param += 1;
            sql.push_str(&format!(
                " AND effective_from <= ${param} AND (effective_to IS NULL OR effective_to > ${param})"
            ));
        }

        if !query.sort.is_empty() {
            let clauses: Vec<String> = query
                .sort
                .iter()
                .filter_map(|s| {
                    model.column_of(&s.field).map(|column| {
                        format!("{column} {}", if s.descending { "DESC" } else { "ASC" })
                    })
                })
                .collect();
            if !clauses.is_empty() {
                sql.push_str(&format!(" ORDER BY {}", clauses.join(", ")));
            }
        } else {
            sql.push_str(" ORDER BY id");
        }
        sql.push_str(&format!(
            " LIMIT {} OFFSET {}",
            query.page_size,
            (query.page - 1).saturating_mul(query.page_size)
        ));

        let mut q = sqlx::query(&sql).bind(tenant_id);
        for (field, value, op) in filter_fields {
            if op == FilterOp::In {
                // Arrays bind as typed vectors.
                let items = value
                    .as_array()
                    .ok_or_else(|| anyhow!("`in` filter expects an array"))?;
                match field.field_type {
                    FieldType::Reference | FieldType::Uuid => {
                        let ids: Vec<Uuid> = items
                            .iter()
                            .filter_map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
                            .collect();
                        q = q.bind(ids);
                    }
                    FieldType::Number => {
                        let nums: Vec<f64> = items.iter().filter_map(|v| v.as_f64()).collect();
                        q = q.bind(nums);
                    }
                    _ => {
                        let strings: Vec<String> = items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect();
                        q = q.bind(strings);
                    }
                }
            } else {
                q = bind_field(q, field, value)?;
            }
        }
        if model.effective_dated() {
            q = q.bind(epoch_ms_to_datetime(query.as_of.unwrap_or_else(now_ms)));
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(|row| row_to_record(model, row)).collect()
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
        let mut assignments = Vec::new();
        let mut fields = Vec::new();
        let mut param = 3usize; // $1 tenant, $2 id, $3 expected version
        for field in &model.fields {
            if matches!(field.column_name.as_str(), "id" | "tenant_id" | "created_at" | "created_by")
            {
                continue;
            }
            param += 1;
            assignments.push(format!("{} = ${param}", field.column_name));
            fields.push(field);
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE tenant_id = $1 AND id = $2 AND version = $3",
            model.table_name,
            assignments.join(", ")
        );

        let mut query = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(id)
            .bind(expected_version);
        for field in fields {
            let value = record
                .get(&field.api_name)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            query = bind_field(query, field, &value)?;
        }
        let tx = txn.postgres()?;
        let result = query.execute(&mut **tx).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn referencing_records(
        &self,
        model: &CompiledModel,
        tenant_id: Uuid,
        field_api_name: &str,
        target_id: Uuid,
    ) -> Result<Vec<Record>> {
        let column = model
            .column_of(field_api_name)
            .ok_or_else(|| anyhow!("reference field {field_api_name} not in IR"))?;
        let sql = format!(
            "SELECT {} FROM {} WHERE tenant_id = $1 AND {column} = $2 AND deleted_at IS NULL",
            model.select_fragment, model.from_fragment
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(target_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| row_to_record(model, row)).collect()
    }

    async fn null_references(
        &self,
        txn: &mut TxnHandle,
        model: &CompiledModel,
        tenant_id: Uuid,
        field_api_name: &str,
        target_id: Uuid,
    ) -> Result<u64> {
        let column = model
            .column_of(field_api_name)
            .ok_or_else(|| anyhow!("reference field {field_api_name} not in IR"))?;
        let sql = format!(
            "UPDATE {} SET {column} = NULL \
             WHERE tenant_id = $1 AND {column} = $2 AND deleted_at IS NULL",
            model.table_name
        );
        let tx = txn.postgres()?;
        let result = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(target_id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}
