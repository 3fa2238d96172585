//! Remote HTTP SQL sources.
//!
//! - `wire`: authenticated JSON round trips with a fixed timeout
//! - `response`: envelope parsing into ordered text rows
//! - `d1`: D1 databases as DataFusion tables
//! - `r2_sql`: R2 SQL raw queries
pub mod d1;
pub mod r2_sql;
pub mod response;
pub mod wire;

pub use response::{QueryMeta, QueryResult};
pub use wire::{HttpTransport, Transport};
