use crate::compiler::ir::Diagnostic;
use crate::schema::model::{EntitySchema, FieldDef, PolicyDef};
use crate::schema::overlay::{ConflictMode, Overlay, OverlayChange, OverlayChangeKind};

/// Apply an overlay set to a deep copy of the base schema. Overlays apply in
/// list order; within one overlay, changes apply in `sort_order`. The base is
/// never mutated. Returns the modified schema or the diagnostics that
/// aborted application.
pub fn apply_overlay_set(
    base: &EntitySchema,
    overlays: &[Overlay],
) -> Result<EntitySchema, Vec<Diagnostic>> {
    let mut schema = base.clone();
    let mut diagnostics = Vec::new();

    for overlay in overlays {
        for change in overlay.ordered_changes() {
            if let Err(diag) = apply_change(&mut schema, overlay, change) {
                diagnostics.push(diag);
            }
        }
    }

    if diagnostics.is_empty() {
        Ok(schema)
    } else {
        Err(diagnostics)
    }
}

fn apply_change(
    schema: &mut EntitySchema,
    overlay: &Overlay,
    change: &OverlayChange,
) -> Result<(), Diagnostic> {
    match change.kind {
        OverlayChangeKind::AddField => add_field(schema, overlay, change),
        OverlayChangeKind::ModifyField => modify_field(schema, overlay, change),
        OverlayChangeKind::RemoveField => remove_field(schema, overlay, change),
        OverlayChangeKind::TweakPolicy => tweak_policy(schema, overlay, change),
    }
}

fn payload_name(change: &OverlayChange) -> Result<String, Diagnostic> {
    change
        .payload
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Diagnostic::error(
                "OVL_PAYLOAD",
                format!("{:?} payload has no string `name`", change.kind),
                None,
            )
        })
}

fn parse_field(change: &OverlayChange, overlay: &Overlay) -> Result<FieldDef, Diagnostic> {
    serde_json::from_value(change.payload.clone()).map_err(|e| {
        Diagnostic::error(
            "OVL_PAYLOAD",
            format!("overlay {} field payload invalid: {e}", overlay.name),
            None,
        )
    })
}

fn add_field(
    schema: &mut EntitySchema,
    overlay: &Overlay,
    change: &OverlayChange,
) -> Result<(), Diagnostic> {
    let field = parse_field(change, overlay)?;
    match schema.fields.iter().position(|f| f.name == field.name) {
        None => {
            schema.fields.push(field);
            Ok(())
        }
        Some(idx) => match change.conflict_mode {
            ConflictMode::Fail => Err(Diagnostic::error(
                "OVL_CONFLICT",
                format!(
                    "overlay {} adds field `{}` which already exists",
                    overlay.name, field.name
                ),
                Some(&field.name),
            )),
            ConflictMode::Overwrite => {
                schema.fields[idx] = field;
                Ok(())
            }
            ConflictMode::Merge => {
                merge_field(&mut schema.fields[idx], &change.payload);
                Ok(())
            }
        },
    }
}

fn modify_field(
    schema: &mut EntitySchema,
    overlay: &Overlay,
    change: &OverlayChange,
) -> Result<(), Diagnostic> {
    let name = payload_name(change)?;
    match schema.fields.iter().position(|f| f.name == name) {
        Some(idx) => {
            match change.conflict_mode {
                ConflictMode::Overwrite => {
                    schema.fields[idx] = parse_field(change, overlay)?;
                }
                _ => merge_field(&mut schema.fields[idx], &change.payload),
            }
            Ok(())
        }
        // `fail` aborts on a missing target; the lenient modes create it.
        None => match change.conflict_mode {
            ConflictMode::Fail => Err(Diagnostic::error(
                "OVL_MISSING",
                format!(
                    "overlay {} modifies field `{name}` which does not exist",
                    overlay.name
                ),
                Some(&name),
            )),
            ConflictMode::Overwrite | ConflictMode::Merge => {
                schema.fields.push(parse_field(change, overlay)?);
                Ok(())
            }
        },
    }
}

fn remove_field(
    schema: &mut EntitySchema,
    overlay: &Overlay,
    change: &OverlayChange,
) -> Result<(), Diagnostic> {
    let name = payload_name(change)?;
    let before = schema.fields.len();
    schema.fields.retain(|f| f.name != name);
    if schema.fields.len() == before && change.conflict_mode == ConflictMode::Fail {
        return Err(Diagnostic::error(
            "OVL_MISSING",
            format!(
                "overlay {} removes field `{name}` which does not exist",
                overlay.name
            ),
            Some(&name),
        ));
    }
    Ok(())
}

fn tweak_policy(
    schema: &mut EntitySchema,
    overlay: &Overlay,
    change: &OverlayChange,
) -> Result<(), Diagnostic> {
    let name = payload_name(change)?;
    match schema.policies.iter().position(|p| p.name == name) {
        Some(idx) => {
            match change.conflict_mode {
                ConflictMode::Overwrite => {
                    schema.policies[idx] = parse_policy(change, overlay)?;
                }
                _ => merge_policy(&mut schema.policies[idx], &change.payload),
            }
            Ok(())
        }
        None => match change.conflict_mode {
            ConflictMode::Fail => Err(Diagnostic::error(
                "OVL_MISSING",
                format!(
                    "overlay {} tweaks policy `{name}` which does not exist",
                    overlay.name
                ),
                None,
            )),
            ConflictMode::Overwrite | ConflictMode::Merge => {
                schema.policies.push(parse_policy(change, overlay)?);
                Ok(())
            }
        },
    }
}

fn parse_policy(change: &OverlayChange, overlay: &Overlay) -> Result<PolicyDef, Diagnostic> {
    serde_json::from_value(change.payload.clone()).map_err(|e| {
        Diagnostic::error(
            "OVL_PAYLOAD",
            format!("overlay {} policy payload invalid: {e}", overlay.name),
            None,
        )
    })
}

/// Shallow JSON merge: serialize the target, overlay the payload's keys,
/// deserialize back. Keys absent from the payload are preserved.
fn merge_field(target: &mut FieldDef, payload: &serde_json::Value) {
    if let Ok(serde_json::Value::Object(mut base)) = serde_json::to_value(&*target) {
        if let serde_json::Value::Object(updates) = payload {
            for (k, v) in updates {
                base.insert(k.clone(), v.clone());
            }
        }
        if let Ok(merged) = serde_json::from_value(serde_json::Value::Object(base)) {
            *target = merged;
        }
    }
}

fn merge_policy(target: &mut PolicyDef, payload: &serde_json::Value) {
    if let Ok(serde_json::Value::Object(mut base)) = serde_json::to_value(&*target) {
        if let serde_json::Value::Object(updates) = payload {
            for (k, v) in updates {
                base.insert(k.clone(), v.clone());
            }
        }
        if let Ok(merged) = serde_json::from_value(serde_json::Value::Object(base)) {
            *target = merged;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{FieldType, PolicyAction, PolicyEffect};
    use crate::schema::overlay::OverlayStatus;
    use serde_json::json;
    use uuid::Uuid;

    fn base() -> EntitySchema {
        let mut s = EntitySchema::new("Invoice", 1).with_system_fields();
        s.fields.push(FieldDef::new("amount", FieldType::Number));
        s.policies.push(PolicyDef {
            name: "read_all".to_string(),
            effect: PolicyEffect::Allow,
            action: PolicyAction::Read,
            resource: "Invoice".to_string(),
            conditions: vec![],
            fields: None,
            priority: 0,
        });
        s
    }

    fn overlay_with(changes: Vec<OverlayChange>) -> Overlay {
        Overlay {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            name: "tweaks".to_string(),
            status: OverlayStatus::Published,
            changes,
        }
    }

    #[test]
    fn add_field_appends() {
        let o = overlay_with(vec![OverlayChange {
            kind: OverlayChangeKind::AddField,
            payload: json!({"name": "memo", "type": "string", "max_length": 200}),
            sort_order: 0,
            conflict_mode: ConflictMode::Fail,
        }]);
        let out = apply_overlay_set(&base(), &[o]).unwrap();
        let memo = out.field("memo").unwrap();
        assert_eq!(memo.field_type, FieldType::String);
        assert_eq!(memo.max_length, Some(200));
    }

    #[test]
    fn add_existing_field_fail_mode_aborts() {
        let o = overlay_with(vec![OverlayChange {
            kind: OverlayChangeKind::AddField,
            payload: json!({"name": "amount", "type": "number"}),
            sort_order: 0,
            conflict_mode: ConflictMode::Fail,
        }]);
        let diags = apply_overlay_set(&base(), &[o]).unwrap_err();
        assert_eq!(diags[0].code, "OVL_CONFLICT");
    }

    #[test]
    fn modify_field_merges_only_named_keys() {
        let o = overlay_with(vec![OverlayChange {
            kind: OverlayChangeKind::ModifyField,
            payload: json!({"name": "amount", "required": true}),
            sort_order: 0,
            conflict_mode: ConflictMode::Merge,
        }]);
        let out = apply_overlay_set(&base(), &[o]).unwrap();
        let amount = out.field("amount").unwrap();
        assert!(amount.required);
        assert_eq!(amount.field_type, FieldType::Number);
    }

    #[test]
    fn modify_missing_field_merge_creates_it() {
        let o = overlay_with(vec![OverlayChange {
            kind: OverlayChangeKind::ModifyField,
            payload: json!({"name": "memo", "type": "string"}),
            sort_order: 0,
            conflict_mode: ConflictMode::Merge,
        }]);
        let out = apply_overlay_set(&base(), &[o]).unwrap();
        assert!(out.field("memo").is_some());
    }

    #[test]
    fn remove_missing_field_fail_vs_lenient() {
        let fail = overlay_with(vec![OverlayChange {
            kind: OverlayChangeKind::RemoveField,
            payload: json!({"name": "ghost"}),
            sort_order: 0,
            conflict_mode: ConflictMode::Fail,
        }]);
        assert!(apply_overlay_set(&base(), &[fail]).is_err());

        let lenient = overlay_with(vec![OverlayChange {
            kind: OverlayChangeKind::RemoveField,
            payload: json!({"name": "ghost"}),
            sort_order: 0,
            conflict_mode: ConflictMode::Overwrite,
        }]);
        assert!(apply_overlay_set(&base(), &[lenient]).is_ok());
    }

    #[test]
    fn tweak_policy_by_name() {
        let o = overlay_with(vec![OverlayChange {
            kind: OverlayChangeKind::TweakPolicy,
            payload: json!({"name": "read_all", "priority": 50}),
            sort_order: 0,
            conflict_mode: ConflictMode::Merge,
        }]);
        let out = apply_overlay_set(&base(), &[o]).unwrap();
        assert_eq!(out.policies[0].priority, 50);
        assert_eq!(out.policies[0].effect, PolicyEffect::Allow);
    }

    #[test]
    fn changes_apply_in_sort_order_across_list_order() {
        // First overlay adds the field; second (later in list) removes it.
        let add = overlay_with(vec![OverlayChange {
            kind: OverlayChangeKind::AddField,
            payload: json!({"name": "memo", "type": "string"}),
            sort_order: 0,
            conflict_mode: ConflictMode::Fail,
        }]);
        let remove = overlay_with(vec![OverlayChange {
            kind: OverlayChangeKind::RemoveField,
            payload: json!({"name": "memo"}),
            sort_order: 0,
            conflict_mode: ConflictMode::Fail,
        }]);
        let out = apply_overlay_set(&base(), &[add, remove]).unwrap();
        assert!(out.field("memo").is_none());
    }

    #[test]
    fn base_is_never_mutated() {
        let b = base();
        let o = overlay_with(vec![OverlayChange {
            kind: OverlayChangeKind::RemoveField,
            payload: json!({"name": "amount"}),
            sort_order: 0,
            conflict_mode: ConflictMode::Fail,
        }]);
        let _ = apply_overlay_set(&b, &[o]).unwrap();
        assert!(b.field("amount").is_some());
    }
}
