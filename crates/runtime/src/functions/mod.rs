//! Table functions over the remote services.
//!
//! Arguments are positional literals. Each function performs its remote call
//! while the statement is planned, because the output schema depends on the
//! answer, and returns the rows as an in-memory table.

pub mod d1;
pub mod r2_sql;

use cirrus_connectors::sources::QueryResult;
use cirrus_error::{CirrusError, ErrorCode, Result};
use datafusion::arrow::array::{ArrayRef, StringArray};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::TableProvider;
use datafusion::common::ScalarValue;
use datafusion::datasource::MemTable;
use datafusion::logical_expr::Expr;
use datafusion::prelude::SessionContext;
use std::sync::Arc;

use crate::services::RemoteServices;

pub fn register_all(context: &SessionContext, services: &Arc<RemoteServices>) {
    d1::register(context, services);
    r2_sql::register(context, services);
}

/// Literal arguments of one call.
pub(crate) struct FunctionArgs<'a> {
    function: &'static str,
    usage: &'static str,
    args: &'a [Expr],
}

impl<'a> FunctionArgs<'a> {
    pub(crate) fn new(
        function: &'static str,
        usage: &'static str,
        args: &'a [Expr],
        min: usize,
        max: usize,
    ) -> Result<Self> {
        if args.len() < min || args.len() > max {
            return Err(CirrusError::new(
                ErrorCode::InvalidArgument,
                format!(
                    "{} takes {} to {} arguments, got {}",
                    function,
                    min,
                    max,
                    args.len()
                ),
            )
            .with_hint(usage));
        }
        Ok(Self {
            function,
            usage,
            args,
        })
    }

    fn invalid(&self, index: usize, expected: &str) -> CirrusError {
        CirrusError::new(
            ErrorCode::InvalidArgument,
            format!(
                "Argument {} of {} must be {}",
                index + 1,
                self.function,
                expected
            ),
        )
        .with_hint(self.usage)
    }

    /// `None` when the argument is absent, NULL or empty.
    pub(crate) fn string(&self, index: usize) -> Result<Option<String>> {
        let Some(expr) = self.args.get(index) else {
            return Ok(None);
        };
        match literal(expr) {
            Some(ScalarValue::Utf8(v) | ScalarValue::LargeUtf8(v) | ScalarValue::Utf8View(v)) => {
                Ok(v.clone().filter(|s| !s.is_empty()))
            }
            Some(ScalarValue::Null) => Ok(None),
            _ => Err(self.invalid(index, "a string literal")),
        }
    }

    pub(crate) fn required(&self, index: usize, name: &str) -> Result<String> {
        self.string(index)?.ok_or_else(|| {
            CirrusError::new(
                ErrorCode::InvalidArgument,
                format!("{} requires a non-empty {}", self.function, name),
            )
            .with_hint(self.usage)
        })
    }

    pub(crate) fn boolean(&self, index: usize) -> Result<Option<bool>> {
        let Some(expr) = self.args.get(index) else {
            return Ok(None);
        };
        match literal(expr) {
            Some(ScalarValue::Boolean(v)) => Ok(*v),
            Some(ScalarValue::Null) => Ok(None),
            _ => Err(self.invalid(index, "a boolean literal")),
        }
    }
}

fn literal(expr: &Expr) -> Option<&ScalarValue> {
    match expr {
        Expr::Literal(value, _) => Some(value),
        Expr::Alias(alias) => literal(&alias.expr),
        _ => None,
    }
}

/// One batch as a table.
pub(crate) fn batch_table(batch: RecordBatch) -> Result<Arc<dyn TableProvider>> {
    let table = MemTable::try_new(batch.schema(), vec![vec![batch]])?;
    Ok(Arc::new(table))
}

/// Remote rows as nullable text columns in their remote order. A result
/// without columns becomes a single empty `empty_column`.
pub(crate) fn text_table(result: &QueryResult, empty_column: &str) -> Result<Arc<dyn TableProvider>> {
    if result.columns.is_empty() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            empty_column,
            DataType::Utf8,
            true,
        )]));
        let empty: ArrayRef = Arc::new(StringArray::from(Vec::<Option<&str>>::new()));
        return batch_table(RecordBatch::try_new(schema, vec![empty])?);
    }

    let fields: Vec<Field> = result
        .columns
        .iter()
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect();
    let arrays: Vec<ArrayRef> = (0..result.columns.len())
        .map(|i| {
            let values: StringArray = result
                .rows
                .iter()
                .map(|row| row.get(i).and_then(|v| v.as_deref()))
                .collect();
            Arc::new(values) as ArrayRef
        })
        .collect();
    batch_table(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::prelude::lit;

    const USAGE: &str = "f(name [, flag])";

    #[test]
    fn test_arity_is_checked() {
        let err = FunctionArgs::new("f", USAGE, &[], 1, 2).err().unwrap();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        assert_eq!(err.hint.as_deref(), Some(USAGE));
    }

    #[test]
    fn test_literal_arguments() {
        let args = [lit("demo"), lit(true), lit(ScalarValue::Null), lit("")];
        let args = FunctionArgs::new("f", USAGE, &args, 1, 4).unwrap();
        assert_eq!(args.required(0, "name").unwrap(), "demo");
        assert_eq!(args.boolean(1).unwrap(), Some(true));
        assert_eq!(args.string(2).unwrap(), None);
        assert!(args.required(3, "alias").is_err());
        assert_eq!(args.string(9).unwrap(), None);
        assert!(args.string(1).is_err());
        assert!(args.boolean(0).is_err());
    }

    #[test]
    fn test_text_table_keeps_remote_column_order() {
        let result = QueryResult {
            columns: vec!["name".to_string(), "id".to_string()],
            rows: vec![
                vec![Some("Al".to_string()), Some("1".to_string())],
                vec![None, Some("2".to_string())],
            ],
            ..Default::default()
        };
        let table = text_table(&result, "result").unwrap();
        let names: Vec<String> = table
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["name", "id"]);

        let empty = text_table(&QueryResult::default(), "result").unwrap();
        assert_eq!(empty.schema().field(0).name(), "result");
    }
}
