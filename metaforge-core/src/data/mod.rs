//! The generic data service: tenant-isolated CRUD over IR-described tables,
//! enforcing policy, validation, and lifecycle on every operation.

pub mod query;
pub mod service;
pub mod store;

pub use query::{validate_query, FilterOp, Query, QueryFilter, SortSpec};
pub use service::{BulkItemResult, DataService};
pub use store::{MemoryRecordStore, RecordStore};
