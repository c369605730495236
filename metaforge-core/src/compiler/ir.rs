use crate::context::Timestamp;
use crate::policy::condition::Condition;
use crate::schema::model::{FieldType, OnDelete, PolicyAction, PolicyEffect};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Diagnostics ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warn,
    Info,
}

/// One compiler diagnostic. ERROR blocks caching and publication.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl Diagnostic {
    pub fn error(code: &str, message: impl Into<String>, field: Option<&str>) -> Self {
        Self {
            severity: Severity::Error,
            code: code.to_string(),
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn warn(code: &str, message: impl Into<String>, field: Option<&str>) -> Self {
        Self {
            severity: Severity::Warn,
            code: code.to_string(),
            message: message.into(),
            field: field.map(str::to_string),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(
                f,
                "{:?} [{}] {}: {}",
                self.severity, self.code, field, self.message
            ),
            None => write!(f, "{:?} [{}] {}", self.severity, self.code, self.message),
        }
    }
}

// ─── Compiled artifacts ───────────────────────────────────────

/// Value-range constraints carried into the IR verbatim from the schema.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraints {
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
}

/// One field after compilation: API name plus the physical column mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledField {
    pub api_name: String,
    pub column_name: String,
    /// `"<column> as <apiName>"` select fragment.
    pub select_as: String,
    pub field_type: FieldType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_to: Option<String>,
    pub on_delete: OnDelete,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub constraints: FieldConstraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    pub indexed: bool,
    pub unique: bool,
}

/// One policy after compilation, ready for indexing by the policy engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledPolicy {
    pub name: String,
    pub effect: PolicyEffect,
    pub action: PolicyAction,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    pub priority: i32,
}

/// A secondary index the DDL emitter should materialize.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub column_name: String,
    pub unique: bool,
}

/// The Compiled Model IR; the immutable, cache-addressable output of the
/// compiler. Everything downstream (authorization, validation, data access)
/// reads shapes from here, never from caller input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompiledModel {
    pub entity_name: String,
    pub version: u32,
    pub table_name: String,
    pub fields: Vec<CompiledField>,
    pub policies: Vec<CompiledPolicy>,
    /// Precomputed `SELECT` column list.
    pub select_fragment: String,
    pub from_fragment: String,
    /// Parameterized tenant isolation predicate.
    pub tenant_filter_fragment: String,
    pub indexes: Vec<IndexSpec>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub compiled_at: Timestamp,
    pub compiled_by: Uuid,
    /// Hash of the canonicalized compiler inputs; the cache address.
    pub input_hash: String,
    /// Hash of the canonicalized IR minus both hash fields.
    pub output_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl CompiledModel {
    pub fn field(&self, api_name: &str) -> Option<&CompiledField> {
        self.fields.iter().find(|f| f.api_name == api_name)
    }

    pub fn column_of(&self, api_name: &str) -> Option<&str> {
        self.field(api_name).map(|f| f.column_name.as_str())
    }

    /// Reference fields pointing at `target` (used by delete cascade).
    pub fn references_to<'a>(&'a self, target: &str) -> Vec<&'a CompiledField> {
        self.fields
            .iter()
            .filter(|f| {
                f.field_type == FieldType::Reference && f.reference_to.as_deref() == Some(target)
            })
            .collect()
    }

    /// Whether effective dating is enabled for this entity.
    pub fn effective_dated(&self) -> bool {
        matches!(
            self.metadata.get("effectiveDating"),
            Some(serde_json::Value::Bool(true))
        )
    }
}

/// Outcome of a compile call: either a model or the blocking diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompilationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<CompiledModel>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompilationResult {
    pub fn failure(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            success: false,
            model: None,
            diagnostics,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }

    /// `"<n> errors, <m> warnings"`; persisted on publish artifacts.
    pub fn summary(&self) -> String {
        let errors = self.errors().count();
        let warnings = self
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warn)
            .count();
        format!("{errors} errors, {warnings} warnings")
    }
}
