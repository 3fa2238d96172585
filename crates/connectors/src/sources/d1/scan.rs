//! Remote table scans.
//!
//! A [`ScanBinding`] moves through `Bound -> PushdownMutable -> Executing ->
//! Streaming -> Exhausted`. Filters and the row cap may only change before the
//! first pull. The first pull issues `SELECT * FROM t [WHERE ..] [ORDER BY ..]
//! [LIMIT n]` once and memoizes the result; later pulls slice batches out of it.
//! ORDER BY is only sent together with a row cap taken from a top-N.

use async_trait::async_trait;
use cirrus_common::credentials::EndpointIdentity;
use cirrus_error::{CirrusError, ErrorCode, ErrorContext, Result};
use cirrus_sql::{join_conjuncts, push_down_filters, quote_identifier, translate_with};
use datafusion::arrow::array::{new_null_array, ArrayRef};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use datafusion::catalog::Session;
use datafusion::datasource::TableProvider;
use datafusion::error::DataFusionError;
use datafusion::execution::{SendableRecordBatchStream, TaskContext};
use datafusion::logical_expr::dml::InsertOp;
use datafusion::logical_expr::{Expr, TableProviderFilterPushDown, TableType};
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties,
};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::client::D1Client;
use super::introspect::ColumnDescriptor;
use super::types::convert_column;
use crate::sources::response::QueryResult;

/// Name given to projected column ids past the end of the known columns.
pub const ROWID_COLUMN: &str = "rowid";

/// One remote ORDER BY key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn to_sql(&self) -> String {
        format!(
            "{} {} NULLS {}",
            quote_identifier(&self.column),
            if self.descending { "DESC" } else { "ASC" },
            if self.nulls_first { "FIRST" } else { "LAST" }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Bound,
    PushdownMutable,
    Executing,
    Streaming { offset: usize },
    Exhausted,
}

/// Per-reference scan state over one remote table.
#[derive(Debug, Clone)]
pub struct ScanBinding {
    identity: EndpointIdentity,
    table: String,
    columns: Arc<Vec<ColumnDescriptor>>,
    column_ids: Vec<usize>,
    where_clauses: Vec<String>,
    order_by: Vec<String>,
    limit: Option<usize>,
    batch_size: usize,
    state: ScanState,
    // Shared by clones so re-executing a plan reuses the first response.
    memo: Arc<OnceCell<Arc<QueryResult>>>,
}

impl ScanBinding {
    pub fn new(
        identity: EndpointIdentity,
        table: impl Into<String>,
        columns: Arc<Vec<ColumnDescriptor>>,
        column_ids: Vec<usize>,
        batch_size: usize,
    ) -> Self {
        Self {
            identity,
            table: table.into(),
            columns,
            column_ids,
            where_clauses: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            batch_size: batch_size.max(1),
            state: ScanState::Bound,
            memo: Arc::new(OnceCell::new()),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn where_clauses(&self) -> &[String] {
        &self.where_clauses
    }

    fn ensure_mutable(&mut self, what: &str) -> Result<()> {
        match self.state {
            ScanState::Bound | ScanState::PushdownMutable => {
                self.state = ScanState::PushdownMutable;
                Ok(())
            }
            state => Err(CirrusError::new(
                ErrorCode::Internal,
                format!(
                    "Cannot push {} into scan of '{}' in state {:?}",
                    what, self.table, state
                ),
            )),
        }
    }

    /// Moves every translatable filter into the WHERE accumulator and returns the rest.
    /// Filters reading a column SQLite compares differently always stay local.
    pub fn push_filters(&mut self, filters: Vec<Expr>) -> Result<Vec<Expr>> {
        self.ensure_mutable("filters")?;
        let (comparable, mut residual): (Vec<Expr>, Vec<Expr>) =
            filters.into_iter().partition(|f| {
                f.column_refs()
                    .iter()
                    .all(|c| compares_like_remote(&self.columns, &c.name))
            });
        residual.extend(push_down_filters(comparable, &mut self.where_clauses));
        Ok(residual)
    }

    /// Caps the rows fetched remotely. A tighter earlier cap is kept.
    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        self.ensure_mutable("a limit")?;
        self.limit = Some(self.limit.map_or(limit, |l| l.min(limit)));
        Ok(())
    }

    pub fn set_ordering(&mut self, keys: &[SortKey]) -> Result<()> {
        self.ensure_mutable("an ordering")?;
        self.order_by = keys.iter().map(SortKey::to_sql).collect();
        Ok(())
    }

    pub fn query_sql(&self) -> String {
        let mut sql = format!("SELECT * FROM {}", quote_identifier(&self.table));
        if let Some(predicate) = join_conjuncts(&self.where_clauses) {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        sql
    }

    /// Schema of the batches this binding produces, in projection order.
    pub fn output_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .column_ids
            .iter()
            .map(|&id| match self.columns.get(id) {
                Some(column) => Field::new(&column.name, column.data_type.clone(), true),
                None => Field::new(ROWID_COLUMN, DataType::Int64, true),
            })
            .collect();
        Arc::new(Schema::new(fields))
    }

    /// The next batch, or `None` once the memoized result is consumed.
    pub async fn next_batch(&mut self, client: &D1Client) -> Result<Option<RecordBatch>> {
        loop {
            match self.state {
                ScanState::Bound | ScanState::PushdownMutable => {
                    if self.limit == Some(0) {
                        self.state = ScanState::Exhausted;
                        continue;
                    }
                    self.state = ScanState::Executing;
                }
                ScanState::Executing => {
                    let sql = self.query_sql();
                    let identity = &self.identity;
                    let fetched = self
                        .memo
                        .get_or_try_init(|| async move {
                            client.execute(identity, &sql).await.map(Arc::new)
                        })
                        .await;
                    match fetched {
                        Ok(result) => {
                            tracing::debug!(
                                table = %self.table,
                                rows = result.len(),
                                "Remote scan materialized"
                            );
                            self.state = ScanState::Streaming { offset: 0 };
                        }
                        Err(e) => {
                            self.state = ScanState::Exhausted;
                            return Err(e);
                        }
                    }
                }
                ScanState::Streaming { offset } => {
                    let result = match self.memo.get() {
                        Some(result) => Arc::clone(result),
                        None => {
                            self.state = ScanState::Executing;
                            continue;
                        }
                    };
                    let end = self.limit.map_or(result.len(), |l| l.min(result.len()));
                    if offset >= end {
                        self.state = ScanState::Exhausted;
                        continue;
                    }
                    let stop = (offset + self.batch_size).min(end);
                    let batch = self.materialize(&result, offset, stop)?;
                    self.state = ScanState::Streaming { offset: stop };
                    return Ok(Some(batch));
                }
                ScanState::Exhausted => return Ok(None),
            }
        }
    }

    fn materialize(&self, result: &QueryResult, start: usize, stop: usize) -> Result<RecordBatch> {
        let rows = &result.rows[start..stop];
        let schema = self.output_schema();
        let arrays: Vec<ArrayRef> = self
            .column_ids
            .iter()
            .map(|&id| match self.columns.get(id) {
                Some(column) => {
                    let index = result.column_index(&column.name);
                    let values = rows
                        .iter()
                        .map(|row| index.and_then(|i| row.get(i)).and_then(|v| v.as_deref()));
                    convert_column(values, &column.data_type, &column.name)
                }
                None => new_null_array(&DataType::Int64, rows.len()),
            })
            .collect();

        let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
        RecordBatch::try_new_with_options(schema, arrays, &options).map_err(|e| {
            CirrusError::new(
                ErrorCode::ConversionFailed,
                format!("Failed to assemble batch for '{}': {}", self.table, e),
            )
        })
    }
}

/// A remote D1 table as a DataFusion table.
#[derive(Debug)]
pub struct D1TableProvider {
    client: Arc<D1Client>,
    identity: EndpointIdentity,
    table: String,
    columns: Arc<Vec<ColumnDescriptor>>,
    schema: SchemaRef,
    batch_size: usize,
    ordering: Vec<SortKey>,
}

impl D1TableProvider {
    /// Introspects `table`. Fails with `TableNotFound` when the remote reports no columns.
    pub async fn try_new(
        client: Arc<D1Client>,
        identity: EndpointIdentity,
        table: &str,
        batch_size: usize,
    ) -> Result<Self> {
        let columns = client.list_columns(&identity, table).await?;
        if columns.is_empty() {
            return Err(CirrusError::new(
                ErrorCode::TableNotFound,
                format!("Table '{}' not found or has no columns", table),
            )
            .with_context(ErrorContext::Catalog {
                alias: identity.target.clone().unwrap_or_default(),
                table: Some(table.to_string()),
            }));
        }
        Ok(Self::with_columns(client, identity, table, columns, batch_size))
    }

    pub fn with_columns(
        client: Arc<D1Client>,
        identity: EndpointIdentity,
        table: &str,
        columns: Vec<ColumnDescriptor>,
        batch_size: usize,
    ) -> Self {
        let fields: Vec<Field> = columns
            .iter()
            .map(|c| Field::new(&c.name, c.data_type.clone(), true))
            .collect();
        Self {
            client,
            identity,
            table: table.to_string(),
            columns: Arc::new(columns),
            schema: Arc::new(Schema::new(fields)),
            batch_size,
            ordering: Vec::new(),
        }
    }

    /// The same table, scanned remotely in `ordering`.
    pub fn with_ordering(&self, ordering: Vec<SortKey>) -> Self {
        Self {
            client: Arc::clone(&self.client),
            identity: self.identity.clone(),
            table: self.table.clone(),
            columns: Arc::clone(&self.columns),
            schema: Arc::clone(&self.schema),
            batch_size: self.batch_size,
            ordering,
        }
    }

    pub fn ordering(&self) -> &[SortKey] {
        &self.ordering
    }

    /// Whether `name` is a column whose remote ordering and comparisons
    /// agree with DataFusion's.
    pub fn compares_like_remote(&self, name: &str) -> bool {
        compares_like_remote(&self.columns, name)
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn binding(&self, projection: Option<&Vec<usize>>) -> ScanBinding {
        let column_ids = match projection {
            Some(p) => p.clone(),
            None => (0..self.columns.len()).collect(),
        };
        ScanBinding::new(
            self.identity.clone(),
            self.table.clone(),
            Arc::clone(&self.columns),
            column_ids,
            self.batch_size,
        )
    }
}

fn compares_like_remote(columns: &[ColumnDescriptor], name: &str) -> bool {
    columns
        .iter()
        .find(|c| c.name == name)
        .is_some_and(ColumnDescriptor::compares_like_remote)
}

#[async_trait]
impl TableProvider for D1TableProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    fn supports_filters_pushdown(
        &self,
        filters: &[&Expr],
    ) -> datafusion::error::Result<Vec<TableProviderFilterPushDown>> {
        Ok(filters
            .iter()
            .map(|f| match translate_with(f, |name| self.compares_like_remote(name)) {
                Some(_) => TableProviderFilterPushDown::Exact,
                None => TableProviderFilterPushDown::Unsupported,
            })
            .collect())
    }

    async fn scan(
        &self,
        _state: &dyn Session,
        projection: Option<&Vec<usize>>,
        filters: &[Expr],
        limit: Option<usize>,
    ) -> datafusion::error::Result<Arc<dyn ExecutionPlan>> {
        let mut binding = self.binding(projection);
        let residual = binding.push_filters(filters.to_vec())?;
        if !residual.is_empty() {
            return Err(DataFusionError::Internal(format!(
                "{} filters were offered to the scan of '{}' but cannot be sent remotely",
                residual.len(),
                self.table
            )));
        }
        if let Some(limit) = limit {
            if !self.ordering.is_empty() {
                binding.set_ordering(&self.ordering)?;
            }
            binding.set_limit(limit)?;
        }
        Ok(Arc::new(D1ScanExec::new(Arc::clone(&self.client), binding)))
    }

    async fn insert_into(
        &self,
        _state: &dyn Session,
        _input: Arc<dyn ExecutionPlan>,
        _insert_op: InsertOp,
    ) -> datafusion::error::Result<Arc<dyn ExecutionPlan>> {
        Err(CirrusError::unsupported(format!(
            "INSERT into remote table '{}' is not supported",
            self.table
        ))
        .into())
    }
}

/// Single-partition physical scan over a [`ScanBinding`].
#[derive(Debug)]
pub struct D1ScanExec {
    client: Arc<D1Client>,
    binding: ScanBinding,
    cache: PlanProperties,
}

impl D1ScanExec {
    pub fn new(client: Arc<D1Client>, binding: ScanBinding) -> Self {
        let cache = PlanProperties::new(
            EquivalenceProperties::new(binding.output_schema()),
            Partitioning::UnknownPartitioning(1),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );
        Self {
            client,
            binding,
            cache,
        }
    }

    pub fn binding(&self) -> &ScanBinding {
        &self.binding
    }
}

impl DisplayAs for D1ScanExec {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "D1ScanExec: sql={}", self.binding.query_sql())
    }
}

impl ExecutionPlan for D1ScanExec {
    fn name(&self) -> &str {
        "D1ScanExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn properties(&self) -> &PlanProperties {
        &self.cache
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        _: Vec<Arc<dyn ExecutionPlan>>,
    ) -> datafusion::error::Result<Arc<dyn ExecutionPlan>> {
        Ok(self)
    }

    fn execute(
        &self,
        partition: usize,
        _context: Arc<TaskContext>,
    ) -> datafusion::error::Result<SendableRecordBatchStream> {
        if partition != 0 {
            return Err(DataFusionError::Internal(format!(
                "D1ScanExec has one partition, got {}",
                partition
            )));
        }
        let schema = self.binding.output_schema();
        let stream = futures::stream::try_unfold(
            (self.binding.clone(), Arc::clone(&self.client)),
            |(mut binding, client)| async move {
                match binding.next_batch(&client).await {
                    Ok(Some(batch)) => Ok(Some((batch, (binding, client)))),
                    Ok(None) => Ok(None),
                    Err(e) => Err(DataFusionError::from(e)),
                }
            },
        );
        Ok(Box::pin(RecordBatchStreamAdapter::new(schema, stream)))
    }
}
