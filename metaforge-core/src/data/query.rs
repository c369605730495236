use crate::compiler::ir::CompiledModel;
use crate::config::QueryLimits;
use crate::context::Timestamp;
use crate::error::{FieldViolation, PlatformError, PlatformResult};
use crate::schema::model::FieldType;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    In,
    IsNull,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryFilter {
    pub field: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// A validated list query. Page numbers are 1-based.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub include_deleted: bool,
    /// Effective-dating point-in-time; defaults to now for dated entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<Timestamp>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    25
}

impl Default for Query {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            sort: Vec::new(),
            page: default_page(),
            page_size: default_page_size(),
            include_deleted: false,
            as_of: None,
        }
    }
}

/// Operators legal for a field type. String fields take the text operators,
/// numeric and date fields take range operators, json is `is_null` only.
fn allowed_ops(field_type: FieldType) -> &'static [FilterOp] {
    use FilterOp::*;
    match field_type {
        FieldType::String => &[Eq, Ne, Contains, StartsWith, EndsWith, In, IsNull],
        FieldType::Number => &[Eq, Ne, Gt, Gte, Lt, Lte, In, IsNull],
        FieldType::Boolean => &[Eq, Ne, IsNull],
        FieldType::Date | FieldType::DateTime => &[Eq, Ne, Gt, Gte, Lt, Lte, IsNull],
        FieldType::Reference | FieldType::Uuid => &[Eq, Ne, In, IsNull],
        FieldType::Enum => &[Eq, Ne, In, IsNull],
        FieldType::Json => &[IsNull],
    }
}

fn value_matches_type(value: &serde_json::Value, field_type: FieldType) -> bool {
    match field_type {
        FieldType::String | FieldType::Enum => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Date | FieldType::DateTime => value.is_string() || value.is_number(),
        FieldType::Reference | FieldType::Uuid => value
            .as_str()
            .is_some_and(|s| uuid::Uuid::parse_str(s).is_ok()),
        FieldType::Json => true,
    }
}

/// Validate a query against the IR and the configured limits. Field and sort
/// names must name IR fields; callers never reach physical columns with
/// their own strings.
pub fn validate_query(
    model: &CompiledModel,
    query: &Query,
    limits: &QueryLimits,
) -> PlatformResult<()> {
    let mut violations = Vec::new();

    if query.filters.len() > limits.max_filters {
        violations.push(FieldViolation {
            rule_id: "query.max_filters".to_string(),
            field: "filters".to_string(),
            message: format!(
                "{} filters exceed the limit of {}",
                query.filters.len(),
                limits.max_filters
            ),
        });
    }
    if query.page_size == 0 || query.page_size > limits.max_page_size {
        violations.push(FieldViolation {
            rule_id: "query.page_size".to_string(),
            field: "pageSize".to_string(),
            message: format!(
                "page size must be between 1 and {}",
                limits.max_page_size
            ),
        });
    }
    if query.page == 0 {
        violations.push(FieldViolation {
            rule_id: "query.page".to_string(),
            field: "page".to_string(),
            message: "page numbers start at 1".to_string(),
        });
    }
    if query.sort.len() > limits.max_sort_fields {
        violations.push(FieldViolation {
            rule_id: "query.max_sort".to_string(),
            field: "sort".to_string(),
            message: format!(
                "{} sort fields exceed the limit of {}",
                query.sort.len(),
                limits.max_sort_fields
            ),
        });
    }

    for filter in &query.filters {
        let Some(field) = model.field(&filter.field) else {
            violations.push(FieldViolation {
                rule_id: "query.unknown_field".to_string(),
                field: filter.field.clone(),
                message: format!("unknown field `{}`", filter.field),
            });
            continue;
        };
        if !allowed_ops(field.field_type).contains(&filter.op) {
            violations.push(FieldViolation {
                rule_id: "query.operator".to_string(),
                field: filter.field.clone(),
                message: format!(
                    "operator {:?} is not allowed for {:?} fields",
                    filter.op, field.field_type
                ),
            });
            continue;
        }
        match filter.op {
            FilterOp::IsNull => {}
            FilterOp::In => {
                let ok = filter.value.as_array().is_some_and(|items| {
                    !items.is_empty()
                        && items.iter().all(|v| value_matches_type(v, field.field_type))
                });
                if !ok {
                    violations.push(FieldViolation {
                        rule_id: "query.value_type".to_string(),
                        field: filter.field.clone(),
                        message: "`in` expects a non-empty array of matching values".to_string(),
                    });
                }
            }
            _ => {
                if !value_matches_type(&filter.value, field.field_type) {
                    violations.push(FieldViolation {
                        rule_id: "query.value_type".to_string(),
                        field: filter.field.clone(),
                        message: format!(
                            "value {} does not match {:?}",
                            filter.value, field.field_type
                        ),
                    });
                }
            }
        }
    }

    for sort in &query.sort {
        if model.field(&sort.field).is_none() {
            violations.push(FieldViolation {
                rule_id: "query.unknown_field".to_string(),
                field: sort.field.clone(),
                message: format!("unknown sort field `{}`", sort.field),
            });
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(PlatformError::Validation(violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{CompiledField, FieldConstraints};
    use crate::context::now_ms;
    use crate::schema::model::OnDelete;
    use serde_json::json;
    use uuid::Uuid;

    fn field(api_name: &str, field_type: FieldType) -> CompiledField {
        CompiledField {
            api_name: api_name.to_string(),
            column_name: api_name.to_string(),
            select_as: format!("{api_name} as {api_name}"),
            field_type,
            required: false,
            reference_to: None,
            on_delete: OnDelete::None,
            enum_values: vec![],
            constraints: FieldConstraints::default(),
            default_value: None,
            indexed: false,
            unique: false,
        }
    }

    fn model() -> CompiledModel {
        CompiledModel {
            entity_name: "Invoice".to_string(),
            version: 1,
            table_name: "ent_invoice".to_string(),
            fields: vec![
                field("memo", FieldType::String),
                field("amount", FieldType::Number),
                field("payload", FieldType::Json),
                field("customerId", FieldType::Reference),
            ],
            policies: vec![],
            select_fragment: String::new(),
            from_fragment: "ent_invoice".to_string(),
            tenant_filter_fragment: String::new(),
            indexes: vec![],
            metadata: Default::default(),
            compiled_at: now_ms(),
            compiled_by: Uuid::nil(),
            input_hash: String::new(),
            output_hash: String::new(),
            diagnostics: vec![],
        }
    }

    fn limits() -> QueryLimits {
        QueryLimits {
            max_filters: 3,
            max_page_size: 100,
            max_sort_fields: 2,
        }
    }

    fn query_with(filters: Vec<QueryFilter>) -> Query {
        Query {
            filters,
            ..Query::default()
        }
    }

    #[test]
    fn operator_per_type_enforced() {
        let m = model();
        // contains on string: fine.
        assert!(validate_query(
            &m,
            &query_with(vec![QueryFilter {
                field: "memo".to_string(),
                op: FilterOp::Contains,
                value: json!("inv"),
            }]),
            &limits()
        )
        .is_ok());

        // gt on string: rejected.
        assert!(validate_query(
            &m,
            &query_with(vec![QueryFilter {
                field: "memo".to_string(),
                op: FilterOp::Gt,
                value: json!("inv"),
            }]),
            &limits()
        )
        .is_err());

        // json accepts is_null only.
        assert!(validate_query(
            &m,
            &query_with(vec![QueryFilter {
                field: "payload".to_string(),
                op: FilterOp::IsNull,
                value: json!(null),
            }]),
            &limits()
        )
        .is_ok());
        assert!(validate_query(
            &m,
            &query_with(vec![QueryFilter {
                field: "payload".to_string(),
                op: FilterOp::Eq,
                value: json!({}),
            }]),
            &limits()
        )
        .is_err());
    }

    #[test]
    fn value_type_must_match_field_type() {
        let m = model();
        assert!(validate_query(
            &m,
            &query_with(vec![QueryFilter {
                field: "amount".to_string(),
                op: FilterOp::Gt,
                value: json!("large"),
            }]),
            &limits()
        )
        .is_err());

        // Reference values must be UUIDs.
        assert!(validate_query(
            &m,
            &query_with(vec![QueryFilter {
                field: "customerId".to_string(),
                op: FilterOp::Eq,
                value: json!("not-a-uuid"),
            }]),
            &limits()
        )
        .is_err());
        assert!(validate_query(
            &m,
            &query_with(vec![QueryFilter {
                field: "customerId".to_string(),
                op: FilterOp::Eq,
                value: json!(Uuid::now_v7()),
            }]),
            &limits()
        )
        .is_ok());
    }

    #[test]
    fn limits_enforced() {
        let m = model();
        let too_many: Vec<QueryFilter> = (0..4)
            .map(|_| QueryFilter {
                field: "memo".to_string(),
                op: FilterOp::Eq,
                value: json!("x"),
            })
            .collect();
        assert!(validate_query(&m, &query_with(too_many), &limits()).is_err());

        let mut q = Query::default();
        q.page_size = 500;
        assert!(validate_query(&m, &q, &limits()).is_err());

        let mut q = Query::default();
        q.sort = vec![
            SortSpec { field: "memo".to_string(), descending: false },
            SortSpec { field: "amount".to_string(), descending: true },
            SortSpec { field: "memo".to_string(), descending: true },
        ];
        assert!(validate_query(&m, &q, &limits()).is_err());
    }

    #[test]
    fn unknown_fields_rejected() {
        let m = model();
        assert!(validate_query(
            &m,
            &query_with(vec![QueryFilter {
                field: "ghost".to_string(),
                op: FilterOp::Eq,
                value: json!("x"),
            }]),
            &limits()
        )
        .is_err());
    }
}
