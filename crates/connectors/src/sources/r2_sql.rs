//! R2 SQL: read-only SQL over Iceberg tables in an R2 bucket.
//!
//! Queries are posted as `{"query": sql}` to the bucket's query endpoint; the
//! answer carries rows under a top-level `results` array.

use cirrus_common::config::RemoteSettings;
use cirrus_common::credentials::EndpointIdentity;
use cirrus_error::{CirrusError, ErrorCode, ErrorContext, Result};
use cirrus_sql::quote_identifier;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::response::{parse_query, QueryResult};
use super::wire::{endpoint, parse_base, HttpTransport, Transport};

#[derive(Debug, Clone)]
pub struct R2SqlClient {
    transport: Arc<dyn Transport>,
    api_base: Url,
}

impl R2SqlClient {
    pub fn new(transport: Arc<dyn Transport>, api_base: &str) -> Result<Self> {
        Ok(Self {
            transport,
            api_base: parse_base(api_base)?,
        })
    }

    pub fn from_settings(settings: &RemoteSettings) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(settings.request_timeout_secs))?;
        Self::new(Arc::new(transport), &settings.r2_sql_api_base)
    }

    fn query_url(&self, identity: &EndpointIdentity) -> Result<Url> {
        let bucket = identity.target.as_deref().ok_or_else(|| {
            CirrusError::new(ErrorCode::InvalidArgument, "R2 SQL requires a bucket name")
        })?;
        endpoint(
            &self.api_base,
            &["accounts", &identity.account_id, "r2-sql", "query", bucket],
        )
    }

    /// Runs `sql` against the bucket named by the identity's target.
    pub async fn query(&self, identity: &EndpointIdentity, sql: &str) -> Result<QueryResult> {
        let url = self.query_url(identity)?;
        tracing::debug!(target: "remote", %sql, "Executing R2 SQL query");
        self.transport
            .post(&url, &identity.api_token, &json!({ "query": sql }))
            .await
            .and_then(|text| parse_query(&text))
            .map_err(|e| {
                let message = format!("R2 SQL query failed: {}", e.message);
                CirrusError { message, ..e }.with_context(ErrorContext::Sql {
                    sql: sql.to_string(),
                })
            })
    }

    pub async fn list_namespaces(&self, identity: &EndpointIdentity) -> Result<QueryResult> {
        self.query(identity, "SHOW DATABASES").await
    }

    pub async fn list_tables(
        &self,
        identity: &EndpointIdentity,
        namespace: Option<&str>,
    ) -> Result<QueryResult> {
        let sql = match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => format!("SHOW TABLES IN {}", quote_identifier(ns)),
            None => "SHOW TABLES".to_string(),
        };
        self.query(identity, &sql).await
    }

    /// `table` may be namespace-qualified; each dot-separated part is quoted.
    pub async fn describe(&self, identity: &EndpointIdentity, table: &str) -> Result<QueryResult> {
        self.query(identity, &format!("DESCRIBE {}", qualified_name(table))).await
    }
}

fn qualified_name(name: &str) -> String {
    name.split('.')
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(".")
}
