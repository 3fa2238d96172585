//! # Error Contexts
//!
//! Structured metadata attached to errors so callers can inspect the failing
//! request, statement or catalog object without parsing messages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// An HTTP round trip. `url` never carries credentials.
    Request {
        method: String,
        url: String,
        status: Option<u16>,
    },

    /// A single remote SQL statement.
    Sql { sql: String },

    /// One statement inside a batch commit. `index` is 1-based.
    Statement {
        index: usize,
        total: usize,
        sql: String,
    },

    /// An attached catalog object.
    Catalog {
        alias: String,
        table: Option<String>,
    },

    /// A credential lookup.
    Credential { secret: Option<String> },

    /// Transaction bookkeeping.
    Transaction { id: u64 },
}
