use crate::policy::condition::Condition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Field definitions ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    DateTime,
    Reference,
    Enum,
    Json,
    Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnDelete {
    Cascade,
    SetNull,
    Restrict,
    #[default]
    None,
}

/// One declared field of an entity schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Target entity for `reference` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_to: Option<String>,
    #[serde(default)]
    pub on_delete: OnDelete,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub unique: bool,
}

impl FieldDef {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: false,
            reference_to: None,
            on_delete: OnDelete::None,
            enum_values: Vec::new(),
            min_length: None,
            max_length: None,
            min: None,
            max: None,
            pattern: None,
            default_value: None,
            indexed: false,
            unique: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn reference(name: &str, target: &str, on_delete: OnDelete) -> Self {
        let mut f = Self::new(name, FieldType::Reference);
        f.reference_to = Some(target.to_string());
        f.on_delete = on_delete;
        f
    }
}

// ─── Policy definitions ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Create,
    Read,
    Update,
    Delete,
    #[serde(rename = "*")]
    All,
}

impl PolicyAction {
    /// Does a policy declared for `self` cover a request for `requested`?
    pub fn covers(&self, requested: PolicyAction) -> bool {
        *self == PolicyAction::All || *self == requested
    }
}

/// One declared policy. Conditions are AND-joined; an empty list always
/// matches. `fields` limits the policy to a field subset; `None` means the
/// whole record and `["*"]` means every field explicitly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyDef {
    pub name: String,
    pub effect: PolicyEffect,
    pub action: PolicyAction,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub priority: i32,
}

// ─── Entity schema ────────────────────────────────────────────

/// A declarative entity schema at one version. Published versions are frozen
/// by the registry; the compiler works on deep copies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity_name: String,
    pub version: u32,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub policies: Vec<PolicyDef>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// The system columns every entity carries, with their required types.
pub const SYSTEM_FIELDS: &[(&str, FieldType)] = &[
    ("id", FieldType::Uuid),
    ("tenant_id", FieldType::Uuid),
    ("realm_id", FieldType::String),
    ("created_at", FieldType::DateTime),
    ("created_by", FieldType::Uuid),
    ("updated_at", FieldType::DateTime),
    ("updated_by", FieldType::Uuid),
    ("deleted_at", FieldType::DateTime),
    ("deleted_by", FieldType::Uuid),
    ("version", FieldType::Number),
];

impl EntitySchema {
    pub fn new(entity_name: &str, version: u32) -> Self {
        Self {
            entity_name: entity_name.to_string(),
            version,
            fields: Vec::new(),
            policies: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Prepend the standard system fields. Authoring convenience only; the
    /// compiler still verifies their presence and types.
    pub fn with_system_fields(mut self) -> Self {
        let mut fields: Vec<FieldDef> = SYSTEM_FIELDS
            .iter()
            .map(|(name, ty)| {
                let mut f = FieldDef::new(name, *ty);
                f.required = matches!(*name, "id" | "tenant_id" | "realm_id" | "version");
                f
            })
            .collect();
        fields.append(&mut self.fields);
        self.fields = fields;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wildcard_covers_everything() {
        assert!(PolicyAction::All.covers(PolicyAction::Read));
        assert!(PolicyAction::Read.covers(PolicyAction::Read));
        assert!(!PolicyAction::Read.covers(PolicyAction::Update));
    }

    #[test]
    fn wildcard_action_serializes_as_star() {
        let json = serde_json::to_string(&PolicyAction::All).unwrap();
        assert_eq!(json, "\"*\"");
        let back: PolicyAction = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(back, PolicyAction::All);
    }

    #[test]
    fn with_system_fields_prepends_all_ten() {
        let schema = EntitySchema::new("Invoice", 1).with_system_fields();
        assert_eq!(schema.fields.len(), SYSTEM_FIELDS.len());
        assert_eq!(schema.fields[0].name, "id");
        assert!(schema.field("version").is_some());
    }
}
