//! Remote catalog discovery through SQLite PRAGMAs and the database listing.

use cirrus_common::credentials::EndpointIdentity;
use cirrus_error::{CirrusError, ErrorCode, Result};
use cirrus_sql::{affinity, quote_identifier, Affinity};
use datafusion::arrow::datatypes::DataType;

use super::client::{D1Client, DatabaseInfo};
use super::types::map_type;

pub const DEFAULT_SCHEMA: &str = "main";

/// Name prefixes of tables that belong to the platform or SQLite itself.
const INTERNAL_PREFIXES: &[&str] = &["_", "sqlite_"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableKind {
    Table,
    View,
    Other(String),
}

impl TableKind {
    fn parse(kind: &str) -> Self {
        match kind {
            "table" => TableKind::Table,
            "view" => TableKind::View,
            other => TableKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TableKind::Table => "table",
            TableKind::View => "view",
            TableKind::Other(kind) => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub kind: TableKind,
    pub column_count: i64,
    /// The `wr` flag of `PRAGMA table_list`.
    pub writable: bool,
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub position: usize,
    pub name: String,
    pub declared_type: String,
    pub data_type: DataType,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

impl ColumnDescriptor {
    /// Whether SQLite compares this column's values the way DataFusion compares
    /// the mapped Arrow values. A NUMERIC-affinity column surfaced as Utf8 is
    /// compared numerically remotely (`'10.0' = 10`) and lexically locally.
    pub fn compares_like_remote(&self) -> bool {
        !(affinity(&self.declared_type) == Affinity::Numeric && self.data_type == DataType::Utf8)
    }
}

pub fn is_internal_table(name: &str) -> bool {
    INTERNAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Whether `reference` has the shape of a database id: 36 characters with
/// hyphens at offsets 8 and 13. A name shaped like that is misread as an id.
pub fn looks_like_database_id(reference: &str) -> bool {
    let bytes = reference.as_bytes();
    bytes.len() == 36 && bytes[8] == b'-' && bytes[13] == b'-'
}

impl D1Client {
    /// User tables of the default schema, in remote order.
    pub async fn list_tables(&self, identity: &EndpointIdentity) -> Result<Vec<TableDescriptor>> {
        let result = self.execute(identity, "PRAGMA table_list").await?;
        let mut tables = Vec::new();
        for row in 0..result.len() {
            let Some(name) = result.value(row, "name") else {
                continue;
            };
            let schema = result.value(row, "schema").unwrap_or(DEFAULT_SCHEMA);
            if schema != DEFAULT_SCHEMA || is_internal_table(name) {
                continue;
            }
            tables.push(TableDescriptor {
                schema: schema.to_string(),
                name: name.to_string(),
                kind: TableKind::parse(result.value(row, "type").unwrap_or("table")),
                column_count: result
                    .value(row, "ncol")
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0),
                writable: result.value(row, "wr") == Some("1"),
                strict: result.value(row, "strict") == Some("1"),
            });
        }
        Ok(tables)
    }

    /// Columns of `table` in declaration order. Empty when the table does not exist.
    pub async fn list_columns(
        &self,
        identity: &EndpointIdentity,
        table: &str,
    ) -> Result<Vec<ColumnDescriptor>> {
        let sql = format!("PRAGMA table_info({})", quote_identifier(table));
        let result = self.execute(identity, &sql).await?;
        let mut columns = Vec::with_capacity(result.len());
        for row in 0..result.len() {
            let Some(name) = result.value(row, "name") else {
                continue;
            };
            let declared_type = result.value(row, "type").unwrap_or("").to_string();
            columns.push(ColumnDescriptor {
                position: result
                    .value(row, "cid")
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(row),
                name: name.to_string(),
                data_type: map_type(&declared_type),
                declared_type,
                not_null: result.value(row, "notnull") == Some("1"),
                default_value: result.value(row, "dflt_value").map(str::to_string),
                primary_key: result.value(row, "pk").is_some_and(|pk| pk != "0"),
            });
        }
        Ok(columns)
    }

    /// Id of the database named exactly `name`.
    pub async fn resolve_database_id(
        &self,
        identity: &EndpointIdentity,
        name: &str,
    ) -> Result<String> {
        self.list_databases(identity)
            .await?
            .into_iter()
            .find(|db| db.name == name)
            .map(|db| db.uuid)
            .ok_or_else(|| {
                CirrusError::new(
                    ErrorCode::DatabaseNotFound,
                    format!("D1 database '{}' not found", name),
                )
                .with_hint("run d1_databases() to list the databases of this account")
            })
    }

    pub async fn find_database(
        &self,
        identity: &EndpointIdentity,
        database_id: &str,
    ) -> Result<Option<DatabaseInfo>> {
        Ok(self
            .list_databases(identity)
            .await?
            .into_iter()
            .find(|db| db.uuid == database_id))
    }
}
