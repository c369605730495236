use crate::compiler::ir::Diagnostic;
use crate::schema::model::{EntitySchema, FieldType, SYSTEM_FIELDS};
use std::collections::HashSet;

/// Validate a schema after overlay application. Returns every diagnostic
/// found; callers treat any ERROR as blocking.
pub fn validate_schema(schema: &EntitySchema) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    // System-field invariant: all present, correctly typed.
    for (name, expected) in SYSTEM_FIELDS {
        match schema.field(name) {
            None => diagnostics.push(Diagnostic::error(
                "SYS_FIELD",
                format!("system field `{name}` is missing"),
                Some(name),
            )),
            Some(f) if f.field_type != *expected => diagnostics.push(Diagnostic::error(
                "SYS_FIELD",
                format!(
                    "system field `{name}` must be {:?}, found {:?}",
                    expected, f.field_type
                ),
                Some(name),
            )),
            Some(_) => {}
        }
    }

    let name_pattern = field_name_pattern();
    let mut seen: HashSet<&str> = HashSet::new();

    for field in &schema.fields {
        if !seen.insert(field.name.as_str()) {
            diagnostics.push(Diagnostic::error(
                "DUP_FIELD",
                format!("duplicate field name `{}`", field.name),
                Some(&field.name),
            ));
        }

        if !name_pattern.is_match(&field.name) {
            diagnostics.push(Diagnostic::error(
                "FIELD_NAME",
                format!("field name `{}` must match ^[A-Za-z][A-Za-z0-9_]*$", field.name),
                Some(&field.name),
            ));
        }

        if field.field_type == FieldType::Reference && field.reference_to.is_none() {
            diagnostics.push(Diagnostic::error(
                "REF_TARGET",
                format!("reference field `{}` has no referenceTo", field.name),
                Some(&field.name),
            ));
        }

        if field.field_type == FieldType::Enum && field.enum_values.is_empty() {
            diagnostics.push(Diagnostic::error(
                "ENUM_VALUES",
                format!("enum field `{}` has no values", field.name),
                Some(&field.name),
            ));
        }

        if let (Some(lo), Some(hi)) = (field.min_length, field.max_length) {
            if lo > hi {
                diagnostics.push(Diagnostic::error(
                    "LEN_RANGE",
                    format!("field `{}`: minLength {lo} > maxLength {hi}", field.name),
                    Some(&field.name),
                ));
            }
        }

        if let (Some(lo), Some(hi)) = (field.min, field.max) {
            if lo > hi {
                diagnostics.push(Diagnostic::error(
                    "NUM_RANGE",
                    format!("field `{}`: min {lo} > max {hi}", field.name),
                    Some(&field.name),
                ));
            }
        }

        if let Some(pattern) = &field.pattern {
            if regex::Regex::new(pattern).is_err() {
                diagnostics.push(Diagnostic::error(
                    "BAD_PATTERN",
                    format!("field `{}`: invalid pattern `{pattern}`", field.name),
                    Some(&field.name),
                ));
            }
        }
    }

    let field_names: HashSet<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();

    for policy in &schema.policies {
        if policy.name.trim().is_empty() {
            diagnostics.push(Diagnostic::error(
                "POLICY_NAME",
                "policy has an empty name",
                None,
            ));
        }

        if let Some(fields) = &policy.fields {
            for name in fields {
                if name != "*" && !field_names.contains(name.as_str()) {
                    diagnostics.push(Diagnostic::error(
                        "POLICY_FIELD",
                        format!(
                            "policy `{}` references unknown field `{name}`",
                            policy.name
                        ),
                        Some(name),
                    ));
                }
            }
        }

        for condition in &policy.conditions {
            if let Some(name) = condition.path.strip_prefix("record.") {
                if !field_names.contains(name) {
                    diagnostics.push(Diagnostic::warn(
                        "POLICY_COND",
                        format!(
                            "policy `{}` condition reads unknown record field `{name}`",
                            policy.name
                        ),
                        Some(name),
                    ));
                }
            }
        }
    }

    diagnostics
}

fn field_name_pattern() -> regex::Regex {
    // The pattern is a literal; construction cannot fail.
    regex::Regex::new("^[A-Za-z][A-Za-z0-9_]*$").unwrap()
}
