use cirrus_common::credentials::{CredentialRequest, ServiceKind};
use cirrus_connectors::sources::d1::D1TableProvider;
use datafusion::arrow::array::{ArrayRef, BooleanArray, Int64Array, StringArray};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::{TableFunctionImpl, TableProvider};
use datafusion::error::Result;
use datafusion::logical_expr::Expr;
use datafusion::prelude::SessionContext;
use std::sync::Arc;

use super::{batch_table, text_table, FunctionArgs};
use crate::attach::AttachRequest;
use crate::bridge::block_on_remote;
use crate::services::RemoteServices;

const SCAN_USAGE: &str = "d1_scan(table, secret, database_id)";
const ATTACH_USAGE: &str = "d1_attach(database, secret [, overwrite [, alias]])";
const DETACH_USAGE: &str = "d1_detach(alias)";
const QUERY_USAGE: &str = "d1_query(sql [, secret [, database]])";
const EXECUTE_USAGE: &str = "d1_execute(sql, secret, database_id)";
const DATABASES_USAGE: &str = "d1_databases([secret])";
const TABLES_USAGE: &str = "d1_tables([secret [, database]])";

pub fn register(context: &SessionContext, services: &Arc<RemoteServices>) {
    let services = || Arc::clone(services);
    context.register_udtf("d1_scan", Arc::new(D1ScanFunction::new(services())));
    context.register_udtf("d1_attach", Arc::new(D1AttachFunction::new(services())));
    context.register_udtf("d1_detach", Arc::new(D1DetachFunction::new(services())));
    context.register_udtf("d1_query", Arc::new(D1QueryFunction::new(services())));
    context.register_udtf("d1_execute", Arc::new(D1ExecuteFunction::new(services())));
    context.register_udtf("d1_databases", Arc::new(D1DatabasesFunction::new(services())));
    context.register_udtf("d1_tables", Arc::new(D1TablesFunction::new(services())));
}

fn secret_request(secret: Option<String>) -> CredentialRequest {
    CredentialRequest {
        secret,
        ..Default::default()
    }
}

fn string_column(values: Vec<Option<String>>) -> ArrayRef {
    Arc::new(StringArray::from(values))
}

/// A remote table as a pushdown-capable scan.
#[derive(Debug)]
pub struct D1ScanFunction {
    services: Arc<RemoteServices>,
}

impl D1ScanFunction {
    pub fn new(services: Arc<RemoteServices>) -> Self {
        Self { services }
    }
}

impl TableFunctionImpl for D1ScanFunction {
    fn call(&self, args: &[Expr]) -> Result<Arc<dyn TableProvider>> {
        let args = FunctionArgs::new("d1_scan", SCAN_USAGE, args, 1, 3)?;
        let table = args.required(0, "table")?;
        let request = CredentialRequest {
            secret: args.string(1)?,
            target: args.string(2)?,
            ..Default::default()
        };
        let identity = self.services.resolve(&request, ServiceKind::D1)?;
        identity.require_target("d1_scan")?;

        let client = Arc::clone(self.services.d1());
        let batch_size = self.services.batch_size();
        let provider = block_on_remote(D1TableProvider::try_new(
            client, identity, &table, batch_size,
        ))?;
        Ok(Arc::new(provider))
    }
}

/// Attaches a database and reports `(database, alias, tables)`.
#[derive(Debug)]
pub struct D1AttachFunction {
    services: Arc<RemoteServices>,
}

impl D1AttachFunction {
    pub fn new(services: Arc<RemoteServices>) -> Self {
        Self { services }
    }
}

impl TableFunctionImpl for D1AttachFunction {
    fn call(&self, args: &[Expr]) -> Result<Arc<dyn TableProvider>> {
        let args = FunctionArgs::new("d1_attach", ATTACH_USAGE, args, 1, 4)?;
        let database = args.required(0, "database")?;
        let secret = args.string(1)?;
        let overwrite = args.boolean(2)?.unwrap_or(true);
        let alias = args.string(3)?;

        let identity = self
            .services
            .resolve(&secret_request(secret.clone()), ServiceKind::D1)?;
        let mut request = AttachRequest::new(database, identity).with_overwrite(overwrite);
        if let Some(secret) = secret {
            request = request.with_secret(secret);
        }
        if let Some(alias) = alias {
            request = request.with_alias(alias);
        }

        let catalog = Arc::clone(self.services.catalog());
        let entry = block_on_remote(async move { catalog.attach(request).await })?;

        let schema = Arc::new(Schema::new(vec![
            Field::new("database", DataType::Utf8, false),
            Field::new("alias", DataType::Utf8, false),
            Field::new("tables", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![entry.database_name.clone()])),
                Arc::new(StringArray::from(vec![entry.alias.clone()])),
                Arc::new(Int64Array::from(vec![entry.tables.len() as i64])),
            ],
        )?;
        Ok(batch_table(batch)?)
    }
}

#[derive(Debug)]
pub struct D1DetachFunction {
    services: Arc<RemoteServices>,
}

impl D1DetachFunction {
    pub fn new(services: Arc<RemoteServices>) -> Self {
        Self { services }
    }
}

impl TableFunctionImpl for D1DetachFunction {
    fn call(&self, args: &[Expr]) -> Result<Arc<dyn TableProvider>> {
        let args = FunctionArgs::new("d1_detach", DETACH_USAGE, args, 1, 1)?;
        let alias = args.required(0, "alias")?;
        let detached = self.services.catalog().detach(&alias)?;

        let schema = Arc::new(Schema::new(vec![Field::new(
            "detached",
            DataType::Boolean,
            false,
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(BooleanArray::from(vec![detached]))],
        )?;
        Ok(batch_table(batch)?)
    }
}

/// Runs SQL remotely and returns the rows as text.
#[derive(Debug)]
pub struct D1QueryFunction {
    services: Arc<RemoteServices>,
}

impl D1QueryFunction {
    pub fn new(services: Arc<RemoteServices>) -> Self {
        Self { services }
    }
}

impl TableFunctionImpl for D1QueryFunction {
    fn call(&self, args: &[Expr]) -> Result<Arc<dyn TableProvider>> {
        let args = FunctionArgs::new("d1_query", QUERY_USAGE, args, 1, 3)?;
        let sql = args.required(0, "sql")?;
        let request = secret_request(args.string(1)?);
        let database = args.string(2)?;

        let services = Arc::clone(&self.services);
        let result = block_on_remote(async move {
            let identity = services.d1_identity(&request, database.as_deref()).await?;
            identity.require_target("d1_query")?;
            services.d1().execute(&identity, &sql).await
        })?;
        Ok(text_table(&result, "result")?)
    }
}

/// Runs one write remotely and reports `(changes)`.
#[derive(Debug)]
pub struct D1ExecuteFunction {
    services: Arc<RemoteServices>,
}

impl D1ExecuteFunction {
    pub fn new(services: Arc<RemoteServices>) -> Self {
        Self { services }
    }
}

impl TableFunctionImpl for D1ExecuteFunction {
    fn call(&self, args: &[Expr]) -> Result<Arc<dyn TableProvider>> {
        let args = FunctionArgs::new("d1_execute", EXECUTE_USAGE, args, 1, 3)?;
        let sql = args.required(0, "sql")?;
        let request = CredentialRequest {
            secret: args.string(1)?,
            target: args.string(2)?,
            ..Default::default()
        };
        let identity = self.services.resolve(&request, ServiceKind::D1)?;
        identity.require_target("d1_execute")?;

        let client = Arc::clone(self.services.d1());
        let result = block_on_remote(async move { client.execute(&identity, &sql).await })?;
        tracing::info!(changes = result.meta.changes, "Remote statement executed");

        let schema = Arc::new(Schema::new(vec![Field::new(
            "changes",
            DataType::Int64,
            false,
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![result.meta.changes as i64]))],
        )?;
        Ok(batch_table(batch)?)
    }
}

#[derive(Debug)]
pub struct D1DatabasesFunction {
    services: Arc<RemoteServices>,
}

impl D1DatabasesFunction {
    pub fn new(services: Arc<RemoteServices>) -> Self {
        Self { services }
    }
}

impl TableFunctionImpl for D1DatabasesFunction {
    fn call(&self, args: &[Expr]) -> Result<Arc<dyn TableProvider>> {
        let args = FunctionArgs::new("d1_databases", DATABASES_USAGE, args, 0, 1)?;
        let identity = self
            .services
            .resolve(&secret_request(args.string(0)?), ServiceKind::D1)?;

        let client = Arc::clone(self.services.d1());
        let databases = block_on_remote(async move { client.list_databases(&identity).await })?;

        let schema = Arc::new(Schema::new(vec![
            Field::new("uuid", DataType::Utf8, false),
            Field::new("name", DataType::Utf8, false),
            Field::new("created_at", DataType::Utf8, true),
            Field::new("version", DataType::Utf8, true),
            Field::new("file_size", DataType::Int64, true),
            Field::new("num_tables", DataType::Int64, true),
            Field::new("region", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                string_column(databases.iter().map(|d| Some(d.uuid.clone())).collect()),
                string_column(databases.iter().map(|d| Some(d.name.clone())).collect()),
                string_column(databases.iter().map(|d| d.created_at.clone()).collect()),
                string_column(databases.iter().map(|d| d.version.clone()).collect()),
                Arc::new(Int64Array::from_iter(databases.iter().map(|d| d.file_size))),
                Arc::new(Int64Array::from_iter(databases.iter().map(|d| d.num_tables))),
                string_column(
                    databases
                        .iter()
                        .map(|d| d.created_in_region.clone())
                        .collect(),
                ),
            ],
        )?;
        Ok(batch_table(batch)?)
    }
}

#[derive(Debug)]
pub struct D1TablesFunction {
    services: Arc<RemoteServices>,
}

impl D1TablesFunction {
    pub fn new(services: Arc<RemoteServices>) -> Self {
        Self { services }
    }
}

impl TableFunctionImpl for D1TablesFunction {
    fn call(&self, args: &[Expr]) -> Result<Arc<dyn TableProvider>> {
        let args = FunctionArgs::new("d1_tables", TABLES_USAGE, args, 0, 2)?;
        let request = secret_request(args.string(0)?);
        let database = args.string(1)?;

        let services = Arc::clone(&self.services);
        let tables = block_on_remote(async move {
            let identity = services.d1_identity(&request, database.as_deref()).await?;
            identity.require_target("d1_tables")?;
            services.d1().list_tables(&identity).await
        })?;

        let schema = Arc::new(Schema::new(vec![
            Field::new("schema", DataType::Utf8, false),
            Field::new("name", DataType::Utf8, false),
            Field::new("type", DataType::Utf8, false),
            Field::new("ncol", DataType::Int64, false),
            Field::new("writable", DataType::Boolean, false),
            Field::new("strict", DataType::Boolean, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                string_column(tables.iter().map(|t| Some(t.schema.clone())).collect()),
                string_column(tables.iter().map(|t| Some(t.name.clone())).collect()),
                string_column(
                    tables
                        .iter()
                        .map(|t| Some(t.kind.as_str().to_string()))
                        .collect(),
                ),
                Arc::new(Int64Array::from_iter_values(
                    tables.iter().map(|t| t.column_count),
                )),
                Arc::new(BooleanArray::from(
                    tables.iter().map(|t| t.writable).collect::<Vec<_>>(),
                )),
                Arc::new(BooleanArray::from(
                    tables.iter().map(|t| t.strict).collect::<Vec<_>>(),
                )),
            ],
        )?;
        Ok(batch_table(batch)?)
    }
}
