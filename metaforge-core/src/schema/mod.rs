//! Entity schemas, the versioned registry, and tenant overlays.

pub mod model;
pub mod overlay;
pub mod registry;

pub use model::{
    EntitySchema, FieldDef, FieldType, OnDelete, PolicyAction, PolicyDef, PolicyEffect,
    SYSTEM_FIELDS,
};
pub use overlay::{
    ConflictMode, MemoryOverlayStore, Overlay, OverlayChange, OverlayChangeKind, OverlayStatus,
    OverlayStore,
};
pub use registry::{
    MemorySchemaRegistry, PublishArtifact, SchemaRecord, SchemaRegistry, SchemaStatus,
};
