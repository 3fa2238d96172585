use cirrus_common::credentials::{CredentialRequest, EndpointIdentity, ServiceKind};
use cirrus_connectors::sources::r2_sql::R2SqlClient;
use cirrus_connectors::sources::QueryResult;
use cirrus_error::Result as CirrusResult;
use datafusion::catalog::{TableFunctionImpl, TableProvider};
use datafusion::error::Result;
use datafusion::logical_expr::Expr;
use datafusion::prelude::SessionContext;
use std::sync::Arc;

use super::{text_table, FunctionArgs};
use crate::bridge::block_on_remote;
use crate::services::RemoteServices;

pub fn register(context: &SessionContext, services: &Arc<RemoteServices>) {
    for kind in [
        R2SqlCall::Query,
        R2SqlCall::Databases,
        R2SqlCall::Tables,
        R2SqlCall::Describe,
    ] {
        context.register_udtf(
            kind.name(),
            Arc::new(R2SqlFunction::new(kind, Arc::clone(services))),
        );
    }
}

/// Which R2 SQL helper a function runs. Every variant takes `(secret, bucket, ..)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum R2SqlCall {
    Query,
    Databases,
    Tables,
    Describe,
}

impl R2SqlCall {
    pub fn name(self) -> &'static str {
        match self {
            R2SqlCall::Query => "r2_sql_query",
            R2SqlCall::Databases => "r2_sql_databases",
            R2SqlCall::Tables => "r2_sql_tables",
            R2SqlCall::Describe => "r2_sql_describe",
        }
    }

    fn usage(self) -> &'static str {
        match self {
            R2SqlCall::Query => "r2_sql_query(secret, bucket, sql)",
            R2SqlCall::Databases => "r2_sql_databases(secret, bucket)",
            R2SqlCall::Tables => "r2_sql_tables(secret, bucket [, namespace])",
            R2SqlCall::Describe => "r2_sql_describe(secret, bucket, table)",
        }
    }

    /// Accepted argument counts.
    fn arity(self) -> (usize, usize) {
        match self {
            R2SqlCall::Query | R2SqlCall::Describe => (3, 3),
            R2SqlCall::Databases => (2, 2),
            R2SqlCall::Tables => (2, 3),
        }
    }

    /// Column name used when the answer has no rows.
    fn empty_column(self) -> &'static str {
        match self {
            R2SqlCall::Query => "result",
            R2SqlCall::Databases => "namespace",
            R2SqlCall::Tables => "table_name",
            R2SqlCall::Describe => "column_name",
        }
    }
}

#[derive(Debug)]
pub struct R2SqlFunction {
    call: R2SqlCall,
    services: Arc<RemoteServices>,
}

impl R2SqlFunction {
    pub fn new(call: R2SqlCall, services: Arc<RemoteServices>) -> Self {
        Self { call, services }
    }
}

async fn run(
    client: &R2SqlClient,
    identity: &EndpointIdentity,
    call: R2SqlCall,
    argument: Option<&str>,
) -> CirrusResult<QueryResult> {
    match call {
        R2SqlCall::Query => client.query(identity, argument.unwrap_or_default()).await,
        R2SqlCall::Databases => client.list_namespaces(identity).await,
        R2SqlCall::Tables => client.list_tables(identity, argument).await,
        R2SqlCall::Describe => client.describe(identity, argument.unwrap_or_default()).await,
    }
}

impl TableFunctionImpl for R2SqlFunction {
    fn call(&self, args: &[Expr]) -> Result<Arc<dyn TableProvider>> {
        let (min, max) = self.call.arity();
        let args = FunctionArgs::new(self.call.name(), self.call.usage(), args, min, max)?;
        let request = CredentialRequest {
            secret: args.string(0)?,
            target: Some(args.required(1, "bucket")?),
            ..Default::default()
        };
        let argument = match self.call {
            R2SqlCall::Query => Some(args.required(2, "sql")?),
            R2SqlCall::Describe => Some(args.required(2, "table")?),
            R2SqlCall::Tables => args.string(2)?,
            R2SqlCall::Databases => None,
        };

        let identity = self.services.resolve(&request, ServiceKind::R2Sql)?;
        let client = Arc::clone(self.services.r2_sql());
        let call = self.call;
        let result = block_on_remote(async move {
            run(&client, &identity, call, argument.as_deref()).await
        })?;
        Ok(text_table(&result, call.empty_column())?)
    }
}
