use cirrus_common::config::RemoteSettings;
use cirrus_common::credentials::EndpointIdentity;
use cirrus_error::{CirrusError, ErrorCode, ErrorContext, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::sources::response::{parse_list, parse_query, parse_statements, QueryResult};
use crate::sources::wire::{endpoint, parse_base, HttpTransport, Transport};

const MAX_LIST_PAGES: u64 = 50;

/// A database as reported by the account-level listing.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DatabaseInfo {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub num_tables: Option<i64>,
    #[serde(default)]
    pub created_in_region: Option<String>,
}

/// Outcome of a batch whose statements all succeeded.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub results: Vec<QueryResult>,
}

impl BatchResult {
    pub fn total_changes(&self) -> u64 {
        self.results.iter().map(|r| r.meta.changes).sum()
    }
}

/// SQL over HTTPS against D1 databases of one account.
#[derive(Debug, Clone)]
pub struct D1Client {
    transport: Arc<dyn Transport>,
    api_base: Url,
    page_size: usize,
}

impl D1Client {
    pub fn new(transport: Arc<dyn Transport>, api_base: &str, page_size: usize) -> Result<Self> {
        Ok(Self {
            transport,
            api_base: parse_base(api_base)?,
            page_size: page_size.max(1),
        })
    }

    pub fn from_settings(settings: &RemoteSettings) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(settings.request_timeout_secs))?;
        Self::new(
            Arc::new(transport),
            &settings.d1_api_base,
            settings.list_page_size,
        )
    }

    fn query_url(&self, identity: &EndpointIdentity, operation: &str) -> Result<Url> {
        let database_id = identity.require_target(operation)?;
        endpoint(
            &self.api_base,
            &[
                "accounts",
                &identity.account_id,
                "d1",
                "database",
                database_id,
                "query",
            ],
        )
    }

    fn databases_url(&self, identity: &EndpointIdentity) -> Result<Url> {
        endpoint(
            &self.api_base,
            &["accounts", &identity.account_id, "d1", "database"],
        )
    }

    /// Runs one statement and returns its rows.
    pub async fn execute(&self, identity: &EndpointIdentity, sql: &str) -> Result<QueryResult> {
        self.execute_with_params(identity, sql, &[]).await
    }

    pub async fn execute_with_params(
        &self,
        identity: &EndpointIdentity,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult> {
        let url = self.query_url(identity, "query")?;
        let body = json!({ "sql": sql, "params": params });
        tracing::debug!(target: "remote", %sql, params = params.len(), "Executing remote statement");

        let text = self
            .transport
            .post(&url, &identity.api_token, &body)
            .await
            .map_err(|e| with_sql(e, sql))?;
        parse_query(&text).map_err(|e| with_sql(e, sql))
    }

    /// Sends every statement in one round trip. A failed statement is reported
    /// with its 1-based position and text.
    pub async fn execute_batch(
        &self,
        identity: &EndpointIdentity,
        statements: &[String],
    ) -> Result<BatchResult> {
        let url = self.query_url(identity, "batch")?;
        let batch: Vec<Value> = statements.iter().map(|sql| json!({ "sql": sql })).collect();
        let body = json!({ "batch": batch });
        tracing::debug!(target: "remote", statements = statements.len(), "Executing remote batch");

        let text = self
            .transport
            .post(&url, &identity.api_token, &body)
            .await
            .map_err(batch_failed)?;
        let outcomes = parse_statements(&text).map_err(batch_failed)?;

        let total = statements.len();
        let mut results = Vec::with_capacity(outcomes.len());
        for (i, outcome) in outcomes.into_iter().enumerate() {
            if !outcome.success {
                let sql = statements.get(i).cloned().unwrap_or_default();
                let detail = outcome
                    .error
                    .unwrap_or_else(|| "no error message".to_string());
                return Err(CirrusError::new(
                    ErrorCode::StatementFailed,
                    format!("Statement {} of {} failed: {}", i + 1, total, detail),
                )
                .with_context(ErrorContext::Statement {
                    index: i + 1,
                    total,
                    sql,
                }));
            }
            results.push(outcome.result);
        }
        Ok(BatchResult { results })
    }

    /// Every database in the account, following pagination.
    pub async fn list_databases(&self, identity: &EndpointIdentity) -> Result<Vec<DatabaseInfo>> {
        let base = self.databases_url(identity)?;
        let mut databases = Vec::new();

        for page in 1..=MAX_LIST_PAGES {
            let mut url = base.clone();
            url.query_pairs_mut()
                .append_pair("page", &page.to_string())
                .append_pair("per_page", &self.page_size.to_string());

            let text = self.transport.get(&url, &identity.api_token).await?;
            let (items, info) = parse_list::<DatabaseInfo>(&text)?;
            let received = items.len();
            databases.extend(items);

            let total = info.and_then(|i| i.total_count).map(|t| t as usize);
            let done = received < self.page_size
                || total.is_some_and(|t| databases.len() >= t)
                || info.is_none();
            if done {
                return Ok(databases);
            }
        }

        tracing::warn!(
            pages = MAX_LIST_PAGES,
            "Hit max pages limit while listing databases"
        );
        Ok(databases)
    }
}

fn with_sql(err: CirrusError, sql: &str) -> CirrusError {
    let err = if err.context.is_none() {
        err.with_context(ErrorContext::Sql {
            sql: sql.to_string(),
        })
    } else {
        err
    };
    CirrusError {
        message: format!("{} (sql: {})", err.message, sql),
        ..err
    }
}

fn batch_failed(err: CirrusError) -> CirrusError {
    CirrusError {
        message: format!("Batch commit failed: {}", err.message),
        ..err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn identity() -> EndpointIdentity {
        EndpointIdentity::new("acct", "tok").with_target("db-1")
    }

    fn client(server: &MockServer, page_size: usize) -> D1Client {
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        D1Client::new(Arc::new(transport), &server.uri(), page_size).unwrap()
    }

    #[tokio::test]
    async fn test_execute_posts_sql_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/acct/d1/database/db-1/query"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(json!({"sql": "SELECT 1 AS one", "params": []})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [{"results": [{"one": 1}], "success": true, "meta": {}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server, 100)
            .execute(&identity(), "SELECT 1 AS one")
            .await
            .unwrap();
        assert_eq!(result.value(0, "one"), Some("1"));
    }

    #[tokio::test]
    async fn test_remote_rejection_carries_sql() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "errors": [{"message": "no such table: nope"}]
            })))
            .mount(&server)
            .await;

        let err = client(&server, 100)
            .execute(&identity(), "SELECT * FROM nope")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteRejected);
        assert!(err.message.contains("no such table: nope"));
        assert!(err.message.contains("SELECT * FROM nope"));
    }

    #[tokio::test]
    async fn test_execute_without_database_is_config_error() {
        let server = MockServer::start().await;
        let err = client(&server, 100)
            .execute(&EndpointIdentity::new("acct", "tok"), "SELECT 1")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingDatabase);
    }

    #[tokio::test]
    async fn test_batch_reports_failing_statement() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({"batch": [
                {"sql": "INSERT INTO t VALUES (1)"},
                {"sql": "INSERT INTO t VALUES (1)"},
                {"sql": "INSERT INTO t VALUES (2)"}
            ]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [
                    {"results": [], "success": true, "meta": {"changes": 1}},
                    {"results": [], "success": false, "error": "UNIQUE constraint failed: t.id"},
                    {"results": [], "success": true, "meta": {"changes": 1}}
                ]
            })))
            .mount(&server)
            .await;

        let statements = vec![
            "INSERT INTO t VALUES (1)".to_string(),
            "INSERT INTO t VALUES (1)".to_string(),
            "INSERT INTO t VALUES (2)".to_string(),
        ];
        let err = client(&server, 100)
            .execute_batch(&identity(), &statements)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::StatementFailed);
        assert!(err.message.contains("UNIQUE constraint failed"));
        match err.context {
            Some(ErrorContext::Statement { index, total, .. }) => {
                assert_eq!(index, 2);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected context {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_success_sums_changes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [
                    {"results": [], "success": true, "meta": {"changes": 1}},
                    {"results": [], "success": true, "meta": {"changes": 2}}
                ]
            })))
            .mount(&server)
            .await;

        let result = client(&server, 100)
            .execute_batch(&identity(), &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert_eq!(result.total_changes(), 3);
    }

    #[tokio::test]
    async fn test_list_databases_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/acct/d1/database"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [
                    {"uuid": "u1", "name": "demo", "version": "production", "num_tables": 2},
                    {"uuid": "u2", "name": "other"}
                ],
                "result_info": {"page": 1, "per_page": 2, "count": 2, "total_count": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/accounts/acct/d1/database"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [{"uuid": "u3", "name": "third"}],
                "result_info": {"page": 2, "per_page": 2, "count": 1, "total_count": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let databases = client(&server, 2)
            .list_databases(&EndpointIdentity::new("acct", "tok"))
            .await
            .unwrap();
        let names: Vec<&str> = databases.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["demo", "other", "third"]);
        assert_eq!(databases[0].num_tables, Some(2));
    }
}
