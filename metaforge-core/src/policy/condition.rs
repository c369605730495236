use crate::context::RequestContext;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A data record as seen by condition evaluation: field name → JSON value.
pub type Record = BTreeMap<String, serde_json::Value>;

/// Comparison operators as a closed sum type. Dynamic operator dispatch from
/// the source system is deliberately replaced by this enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
}

/// One predicate over the request context and (optionally) the record.
///
/// Path resolution: `ctx.<name>` reads from the context, `record.<name>` from
/// the supplied record, and a bare path reads from the context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub path: String,
    pub op: ConditionOp,
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(path: &str, op: ConditionOp, value: serde_json::Value) -> Self {
        Self {
            path: path.to_string(),
            op,
            value,
        }
    }
}

/// Resolve a condition path against context or record.
fn resolve(path: &str, ctx: &RequestContext, record: Option<&Record>) -> serde_json::Value {
    if let Some(name) = path.strip_prefix("record.") {
        return record
            .and_then(|r| r.get(name).cloned())
            .unwrap_or(serde_json::Value::Null);
    }
    let name = path.strip_prefix("ctx.").unwrap_or(path);
    ctx.attribute(name).unwrap_or(serde_json::Value::Null)
}

fn as_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_f64()
}

/// Ordering comparison: numeric when both sides are numbers, lexicographic
/// when both are strings (ISO dates order correctly), otherwise no match.
fn ordering(
    actual: &serde_json::Value,
    target: &serde_json::Value,
) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (as_f64(actual), as_f64(target)) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (actual.as_str(), target.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

fn loose_eq(actual: &serde_json::Value, target: &serde_json::Value) -> bool {
    if actual == target {
        return true;
    }
    // 3 and 3.0 are the same number.
    matches!((as_f64(actual), as_f64(target)), (Some(a), Some(b)) if a == b)
}

/// Membership with array-vs-scalar semantics: when the resolved value is an
/// array (e.g. `ctx.roles`), the condition matches if any element is in the
/// target list.
fn membership(actual: &serde_json::Value, target: &serde_json::Value) -> Result<bool> {
    let list = target
        .as_array()
        .ok_or_else(|| anyhow!("in/not_in target must be an array, got {target}"))?;
    match actual {
        serde_json::Value::Array(elements) => Ok(elements
            .iter()
            .any(|e| list.iter().any(|t| loose_eq(e, t)))),
        scalar => Ok(list.iter().any(|t| loose_eq(scalar, t))),
    }
}

/// Compare two resolved values under an operator. Shared by policy
/// conditions and cross-field validation rules.
pub fn compare_values(
    op: ConditionOp,
    actual: &serde_json::Value,
    target: &serde_json::Value,
) -> Result<bool> {
    let matched = match op {
        ConditionOp::Eq => loose_eq(actual, target),
        ConditionOp::Ne => !loose_eq(actual, target),
        ConditionOp::In => membership(actual, target)?,
        ConditionOp::NotIn => !membership(actual, target)?,
        ConditionOp::Gt => matches!(ordering(actual, target), Some(std::cmp::Ordering::Greater)),
        ConditionOp::Gte => matches!(
            ordering(actual, target),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
        ConditionOp::Lt => matches!(ordering(actual, target), Some(std::cmp::Ordering::Less)),
        ConditionOp::Lte => matches!(
            ordering(actual, target),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
        ConditionOp::Contains => match (actual, target) {
            (serde_json::Value::String(s), serde_json::Value::String(sub)) => s.contains(sub),
            (serde_json::Value::Array(elements), t) => elements.iter().any(|e| loose_eq(e, t)),
            _ => false,
        },
        ConditionOp::StartsWith => match (actual.as_str(), target.as_str()) {
            (Some(s), Some(prefix)) => s.starts_with(prefix),
            _ => false,
        },
        ConditionOp::EndsWith => match (actual.as_str(), target.as_str()) {
            (Some(s), Some(suffix)) => s.ends_with(suffix),
            _ => false,
        },
    };
    Ok(matched)
}

/// Evaluate one condition. Errors are reserved for malformed rules
/// (e.g. a non-array `in` target); the policy engine treats them as deny.
pub fn evaluate(
    condition: &Condition,
    ctx: &RequestContext,
    record: Option<&Record>,
) -> Result<bool> {
    let actual = resolve(&condition.path, ctx, record);
    compare_values(condition.op, &actual, &condition.value)
}

/// Evaluate an AND-joined condition group. Empty groups always match.
pub fn evaluate_all(
    conditions: &[Condition],
    ctx: &RequestContext,
    record: Option<&Record>,
) -> Result<bool> {
    for condition in conditions {
        if !evaluate(condition, ctx, record)? {
            return Ok(false);
        }
    }
    Ok(true)
}
