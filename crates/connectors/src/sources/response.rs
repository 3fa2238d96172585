//! Response envelope parsing.
//!
//! Two shapes are accepted: statement results nested in `result` (a list for
//! batches, a single object otherwise), or rows directly under a top-level
//! `results` key. Rows come back as text in the order the remote produced their
//! keys; the column list is the union of keys across rows in first-seen order.
//! JSON null stays `None`, which is distinct from an empty string.

use cirrus_error::{CirrusError, ErrorCode, Result};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Execution metadata reported alongside a statement result.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueryMeta {
    pub served_by_primary: Option<bool>,
    pub served_by_region: Option<String>,
    pub duration: Option<f64>,
    #[serde(deserialize_with = "null_as_default")]
    pub changes: u64,
    pub last_row_id: Option<i64>,
    #[serde(deserialize_with = "null_as_default")]
    pub changed_db: bool,
    pub size_after: Option<u64>,
    #[serde(deserialize_with = "null_as_default")]
    pub rows_read: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub rows_written: u64,
}

/// Counters reported as JSON null read as zero.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Rows of one statement, ready for conversion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    /// Row values aligned with `columns`.
    pub rows: Vec<Vec<Option<String>>>,
    pub meta: QueryMeta,
}

impl QueryResult {
    fn from_rows(rows: OrderedRows, meta: QueryMeta) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for row in &rows.0 {
            for (key, _) in row {
                if !index.contains_key(key) {
                    index.insert(key.clone(), columns.len());
                    columns.push(key.clone());
                }
            }
        }

        let rows = rows
            .0
            .into_iter()
            .map(|row| {
                let mut values = vec![None; columns.len()];
                for (key, value) in row {
                    if let Some(&i) = index.get(&key) {
                        values[i] = render_value(value);
                    }
                }
                values
            })
            .collect();

        Self {
            columns,
            rows,
            meta,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let i = self.column_index(column)?;
        self.rows.get(row)?.get(i)?.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One statement's outcome inside an envelope.
#[derive(Debug, Clone, Default)]
pub struct StatementOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub result: QueryResult,
}

fn render_value(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        nested => Some(nested.to_string()),
    }
}

#[derive(Debug, Default, PartialEq)]
struct OrderedRows(Vec<Vec<(String, Value)>>);

struct OrderedRow(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for OrderedRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = OrderedRow;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a row object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<OrderedRow, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, Value>()? {
                    entries.push((key, value));
                }
                Ok(OrderedRow(entries))
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

impl<'de> Deserialize<'de> for OrderedRows {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RowsVisitor;

        impl<'de> Visitor<'de> for RowsVisitor {
            type Value = OrderedRows;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a list of row objects")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<OrderedRows, E> {
                Ok(OrderedRows::default())
            }

            fn visit_none<E: de::Error>(self) -> std::result::Result<OrderedRows, E> {
                Ok(OrderedRows::default())
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<OrderedRows, A::Error> {
                let mut rows = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(row) = seq.next_element::<OrderedRow>()? {
                    rows.push(row.0);
                }
                Ok(OrderedRows(rows))
            }
        }

        deserializer.deserialize_any(RowsVisitor)
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementEnvelope {
    #[serde(default)]
    results: OrderedRows,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    meta: QueryMeta,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResultField {
    Statements(Vec<StatementEnvelope>),
    Single(StatementEnvelope),
}

#[derive(Debug, Deserialize)]
struct QueryEnvelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    #[serde(default)]
    result: Option<ResultField>,
    #[serde(default)]
    results: Option<OrderedRows>,
    #[serde(default)]
    meta: QueryMeta,
}

/// Pagination block of list endpoints.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResultInfo {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
    pub count: Option<u64>,
    pub total_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ListEnvelope<T> {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    #[serde(default = "Option::default")]
    result: Option<Vec<T>>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

fn malformed(err: serde_json::Error) -> CirrusError {
    CirrusError::new(
        ErrorCode::MalformedResponse,
        format!("Unexpected response shape: {}", err),
    )
}

fn rejected(errors: &[ApiMessage]) -> CirrusError {
    let message = errors
        .iter()
        .find_map(|e| e.message.clone())
        .unwrap_or_else(|| "Remote reported failure without an error message".to_string());
    CirrusError::new(ErrorCode::RemoteRejected, message)
}

/// First `errors[].message` of an envelope, if the body is one.
pub fn first_error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Errors {
        #[serde(default)]
        errors: Vec<ApiMessage>,
    }
    serde_json::from_str::<Errors>(body)
        .ok()?
        .errors
        .into_iter()
        .find_map(|e| e.message)
}

/// Every statement outcome in the body, in order.
pub fn parse_statements(body: &str) -> Result<Vec<StatementOutcome>> {
    let envelope: QueryEnvelope = serde_json::from_str(body).map_err(malformed)?;
    if envelope.success == Some(false) {
        return Err(rejected(&envelope.errors));
    }

    let statements = match (envelope.result, envelope.results) {
        (Some(ResultField::Statements(list)), _) => list,
        (Some(ResultField::Single(single)), _) => vec![single],
        (None, Some(rows)) => vec![StatementEnvelope {
            results: rows,
            success: envelope.success,
            error: None,
            meta: envelope.meta,
        }],
        (None, None) => vec![],
    };

    Ok(statements
        .into_iter()
        .map(|s| StatementOutcome {
            success: s.success.unwrap_or(true),
            error: s.error,
            result: QueryResult::from_rows(s.results, s.meta),
        })
        .collect())
}

/// The first statement's rows. A body without statements yields an empty result.
pub fn parse_query(body: &str) -> Result<QueryResult> {
    let first = parse_statements(body)?.into_iter().next();
    match first {
        Some(outcome) if !outcome.success => Err(CirrusError::new(
            ErrorCode::RemoteRejected,
            outcome
                .error
                .unwrap_or_else(|| "Statement failed without an error message".to_string()),
        )),
        Some(outcome) => Ok(outcome.result),
        None => Ok(QueryResult::default()),
    }
}

/// Items of a list endpoint plus its pagination block.
pub fn parse_list<T: for<'de> Deserialize<'de>>(body: &str) -> Result<(Vec<T>, Option<ResultInfo>)> {
    let envelope: ListEnvelope<T> = serde_json::from_str(body).map_err(malformed)?;
    if envelope.success == Some(false) {
        return Err(rejected(&envelope.errors));
    }
    Ok((envelope.result.unwrap_or_default(), envelope.result_info))
}
