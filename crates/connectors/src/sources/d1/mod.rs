//! Cloudflare D1: SQLite databases reached over the account REST API.

pub mod client;
pub mod introspect;
pub mod scan;
pub mod schema;
pub mod types;

pub use client::{BatchResult, D1Client, DatabaseInfo};
pub use introspect::{
    is_internal_table, looks_like_database_id, ColumnDescriptor, TableDescriptor, TableKind,
};
pub use scan::{D1ScanExec, D1TableProvider, ScanBinding, ScanState, SortKey};
pub use schema::D1SchemaProvider;
pub use types::map_type;
