//! Statement routing for one client session.
//!
//! Transaction control (`BEGIN`, `START TRANSACTION`, `COMMIT`, `END`,
//! `ROLLBACK`) is recognised on the parsed statement and handled here. Every
//! other statement is planned by DataFusion: writes aimed at `alias.table` of
//! an attached database are buffered into that alias' remote transaction, DDL
//! against an attached alias is refused, and the rest runs through DataFusion.
//!
//! Dropping a session with an open transaction discards its buffered writes.

use cirrus_error::{CirrusError, ErrorCode, ErrorContext, Result};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::logical_expr::{DdlStatement, DmlStatement, LogicalPlan, WriteOp};
use datafusion::prelude::SessionContext;
use datafusion::sql::parser::{DFParser, Statement as DFStatement};
use datafusion::sql::sqlparser::ast::{
    visit_expressions_mut, visit_relations_mut, Expr as SqlExpr, ObjectName,
    Statement as SqlStatement,
};
use datafusion::sql::sqlparser::dialect::GenericDialect;
use std::convert::Infallible;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::attach::normalize_alias;
use crate::registry::AttachmentEntry;
use crate::services::RemoteServices;
use crate::transaction::{CommitOutcome, TransactionId};

/// What one statement produced.
#[derive(Debug)]
pub enum StatementResult {
    Rows(Vec<RecordBatch>),
    /// A write held for commit.
    Buffered {
        alias: String,
        transaction: TransactionId,
        pending: usize,
    },
    Begin,
    Committed(Vec<(String, CommitOutcome)>),
    RolledBack {
        statements: usize,
    },
}

pub struct RemoteSession {
    context: SessionContext,
    services: Arc<RemoteServices>,
    /// Remote transactions of the open host transaction, in first-write order.
    open: Option<Vec<(String, TransactionId)>>,
}

impl RemoteSession {
    pub fn new(context: SessionContext, services: Arc<RemoteServices>) -> Self {
        Self {
            context,
            services,
            open: None,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.open.is_some()
    }

    /// Per-alias remote transactions opened inside the current host transaction.
    pub fn transactions(&self) -> Vec<(String, TransactionId)> {
        self.open.clone().unwrap_or_default()
    }

    /// Runs every statement in `sql` in order, stopping at the first failure.
    pub async fn execute(&mut self, sql: &str) -> Result<Vec<StatementResult>> {
        let statements = DFParser::parse_sql_with_dialect(sql, &GenericDialect {}).map_err(|e| {
            CirrusError::new(
                ErrorCode::InvalidArgument,
                format!("Failed to parse SQL: {}", e),
            )
        })?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            results.push(self.execute_statement(statement).await?);
        }
        Ok(results)
    }

    /// Rows of the last statement in `sql`.
    pub async fn query(&mut self, sql: &str) -> Result<Vec<RecordBatch>> {
        match self.execute(sql).await?.pop() {
            Some(StatementResult::Rows(batches)) => Ok(batches),
            _ => Ok(Vec::new()),
        }
    }

    async fn execute_statement(&mut self, statement: DFStatement) -> Result<StatementResult> {
        let source = match &statement {
            DFStatement::Statement(inner) => Some(inner.as_ref().clone()),
            _ => None,
        };
        if let Some(control) = &source {
            match control {
                SqlStatement::StartTransaction { .. } => return self.begin(),
                SqlStatement::Commit { chain: false, .. } => return self.commit().await,
                SqlStatement::Rollback {
                    chain: false,
                    savepoint: None,
                } => return self.rollback(),
                SqlStatement::Commit { .. } | SqlStatement::Rollback { .. } => {
                    return Err(CirrusError::new(
                        ErrorCode::UnsupportedOperation,
                        format!("'{}' is not supported", control),
                    )
                    .with_hint("use BEGIN, then COMMIT or ROLLBACK"));
                }
                _ => {}
            }
        }

        let plan = self.context.state().statement_to_plan(statement).await?;

        match plan {
            LogicalPlan::Dml(dml) => match self.attached(dml.table_name.schema()) {
                Some(entry) => self.route_write(dml, entry, source),
                None => self.run(LogicalPlan::Dml(dml)).await,
            },
            LogicalPlan::Ddl(ddl) => {
                if let Some(entry) = self.attached(ddl_target(&ddl)) {
                    return Err(CirrusError::unsupported(format!(
                        "{} is not allowed on attached database '{}'",
                        ddl.name(),
                        entry.alias
                    ))
                    .with_context(ErrorContext::Catalog {
                        alias: entry.alias.clone(),
                        table: None,
                    }));
                }
                self.run(LogicalPlan::Ddl(ddl)).await
            }
            other => self.run(other).await,
        }
    }

    fn attached(&self, schema: Option<&str>) -> Option<Arc<AttachmentEntry>> {
        self.services.catalog().lookup(schema?)
    }

    async fn run(&self, plan: LogicalPlan) -> Result<StatementResult> {
        let frame = self.context.execute_logical_plan(plan).await?;
        Ok(StatementResult::Rows(frame.collect().await?))
    }

    fn begin(&mut self) -> Result<StatementResult> {
        if self.open.is_some() {
            return Err(CirrusError::new(
                ErrorCode::InvalidTransactionState,
                "A transaction is already open",
            ));
        }
        self.open = Some(Vec::new());
        tracing::debug!("Host transaction started");
        Ok(StatementResult::Begin)
    }

    /// Commits each alias' transaction in turn. A transaction leaves the open
    /// list only once it committed, so on failure, or when this future is
    /// dropped, the failed and not yet committed transactions stay open.
    async fn commit(&mut self) -> Result<StatementResult> {
        let Some(open) = self.open.as_mut() else {
            tracing::warn!("COMMIT without an open transaction");
            return Ok(StatementResult::Committed(Vec::new()));
        };

        let mut committed = Vec::with_capacity(open.len());
        while let Some((alias, id)) = open.first().cloned() {
            let outcome = self.services.transactions().commit(id).await?;
            open.remove(0);
            committed.push((alias, outcome));
        }
        self.open = None;
        Ok(StatementResult::Committed(committed))
    }

    /// Discards every open transaction, also when one of them fails to roll
    /// back. The first failure is returned.
    fn rollback(&mut self) -> Result<StatementResult> {
        let Some(open) = self.open.take() else {
            tracing::warn!("ROLLBACK without an open transaction");
            return Ok(StatementResult::RolledBack { statements: 0 });
        };
        let mut statements = 0;
        let mut first_error = None;
        for (alias, id) in open {
            match self.services.transactions().rollback(id) {
                Ok(dropped) => statements += dropped,
                Err(e) => {
                    tracing::warn!(alias = %alias, transaction = id, error = %e, "Rollback failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(StatementResult::RolledBack { statements }),
        }
    }

    fn route_write(
        &mut self,
        dml: DmlStatement,
        entry: Arc<AttachmentEntry>,
        source: Option<SqlStatement>,
    ) -> Result<StatementResult> {
        let table = dml.table_name.table().to_string();
        let context = ErrorContext::Catalog {
            alias: entry.alias.clone(),
            table: Some(table.clone()),
        };
        if !matches!(dml.op, WriteOp::Insert(_) | WriteOp::Update | WriteOp::Delete) {
            return Err(CirrusError::unsupported(format!(
                "{} is not allowed on '{}.{}'",
                dml.op.name(),
                entry.alias,
                table
            ))
            .with_context(context));
        }
        let Some(open) = self.open.as_mut() else {
            return Err(CirrusError::unsupported(format!(
                "{} on '{}.{}' outside a transaction",
                dml.op.name(),
                entry.alias,
                table
            ))
            .with_context(context));
        };
        let Some(mut statement) = source else {
            return Err(CirrusError::new(
                ErrorCode::Internal,
                "Write statement has no SQL text to send",
            )
            .with_context(context));
        };

        strip_alias(&mut statement, &entry.alias);
        let sql = statement.to_string();

        let transactions = self.services.transactions();
        let existing = open
            .iter()
            .find(|(alias, _)| *alias == entry.alias)
            .map(|(_, id)| *id);
        let id = transactions.buffer_or_start(existing, &entry.identity, &entry.alias, sql)?;
        if existing != Some(id) {
            open.retain(|(alias, _)| *alias != entry.alias);
            open.push((entry.alias.clone(), id));
        }
        let pending = transactions.pending(id)?.len();
        tracing::debug!(alias = %entry.alias, transaction = id, pending, "Write buffered");

        Ok(StatementResult::Buffered {
            alias: entry.alias.clone(),
            transaction: id,
            pending,
        })
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if self.open.is_none() {
            return;
        }
        tracing::warn!("Session closed inside a transaction; buffered writes are discarded");
        if let Err(e) = self.rollback() {
            tracing::warn!(error = %e, "Failed to discard transactions of a closed session");
        }
    }
}

/// Drops the `alias.` qualifier from every relation in `statement` and from
/// `alias.table.column` references.
fn strip_alias(statement: &mut SqlStatement, alias: &str) {
    let ControlFlow::Continue(()) =
        visit_relations_mut(statement, |name: &mut ObjectName| -> ControlFlow<Infallible> {
            if name.0.len() == 2 && normalize_alias(unquote(&name.0[0].to_string())) == alias {
                name.0.remove(0);
            }
            ControlFlow::Continue(())
        });
    let ControlFlow::Continue(()) =
        visit_expressions_mut(statement, |expr: &mut SqlExpr| -> ControlFlow<Infallible> {
            if let SqlExpr::CompoundIdentifier(idents) = expr {
                if idents.len() == 3 && normalize_alias(&idents[0].value) == alias {
                    idents.remove(0);
                }
            }
            ControlFlow::Continue(())
        });
}

fn unquote(ident: &str) -> &str {
    ident.trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
}

/// Schema a DDL statement creates or drops objects in.
fn ddl_target(ddl: &DdlStatement) -> Option<&str> {
    match ddl {
        DdlStatement::CreateExternalTable(c) => c.name.schema(),
        DdlStatement::CreateMemoryTable(c) => c.name.schema(),
        DdlStatement::CreateView(c) => c.name.schema(),
        DdlStatement::CreateIndex(c) => c.table.schema(),
        DdlStatement::DropTable(d) => d.name.schema(),
        DdlStatement::DropView(d) => d.name.schema(),
        DdlStatement::CreateCatalogSchema(c) => c.schema_name.rsplit('.').next(),
        DdlStatement::DropCatalogSchema(d) => Some(d.name.schema_name()),
        _ => None,
    }
}
