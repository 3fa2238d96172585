//! Attaching remote databases as DataFusion schemas.
//!
//! Attach resolves the database reference to an id, lists its tables and
//! registers a [`D1SchemaProvider`] under the alias in the default catalog, so
//! `alias.table` resolves to a remote scan. Bare table names are never matched
//! against attachments.

use cirrus_common::credentials::EndpointIdentity;
use cirrus_connectors::sources::d1::{looks_like_database_id, D1Client, D1SchemaProvider};
use cirrus_error::{CirrusError, ErrorCode, ErrorContext, Result};
use datafusion::catalog::CatalogProvider;
use std::sync::Arc;

use crate::registry::{AttachmentEntry, AttachmentRegistry};

#[derive(Debug, Clone)]
pub struct AttachRequest {
    /// Database name or id.
    pub database: String,
    pub identity: EndpointIdentity,
    pub secret: Option<String>,
    pub alias: Option<String>,
    pub overwrite: bool,
}

impl AttachRequest {
    pub fn new(database: impl Into<String>, identity: EndpointIdentity) -> Self {
        Self {
            database: database.into(),
            identity,
            secret: None,
            alias: None,
            overwrite: true,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Attached databases and the catalog their schemas live in.
#[derive(Debug)]
pub struct RemoteCatalog {
    client: Arc<D1Client>,
    registry: Arc<AttachmentRegistry>,
    catalog: Arc<dyn CatalogProvider>,
    batch_size: usize,
}

impl RemoteCatalog {
    pub fn new(
        client: Arc<D1Client>,
        registry: Arc<AttachmentRegistry>,
        catalog: Arc<dyn CatalogProvider>,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            registry,
            catalog,
            batch_size,
        }
    }

    pub fn registry(&self) -> &AttachmentRegistry {
        &self.registry
    }

    pub fn lookup(&self, alias: &str) -> Option<Arc<AttachmentEntry>> {
        self.registry.lookup(&normalize_alias(alias))
    }

    pub async fn attach(&self, request: AttachRequest) -> Result<Arc<AttachmentEntry>> {
        let reference = request.database.trim();
        if reference.is_empty() {
            return Err(CirrusError::new(
                ErrorCode::InvalidArgument,
                "d1_attach requires a database name or id",
            ));
        }

        let explicit_alias = request
            .alias
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(normalize_alias);
        if let Some(alias) = &explicit_alias {
            self.reject_existing(alias, request.overwrite)?;
        }

        let (database_id, database_name) = if looks_like_database_id(reference) {
            let name = self
                .client
                .find_database(&request.identity, reference)
                .await?
                .map(|db| db.name)
                .unwrap_or_else(|| reference.to_string());
            (reference.to_string(), name)
        } else {
            let id = self
                .client
                .resolve_database_id(&request.identity, reference)
                .await?;
            (id, reference.to_string())
        };

        // A defaulted alias follows the human name once it is known.
        let alias = match explicit_alias {
            Some(alias) if alias != normalize_alias(&database_id) => alias,
            _ => normalize_alias(&database_name),
        };
        self.reject_existing(&alias, request.overwrite)?;

        let identity = request.identity.clone().with_target(database_id.clone());
        let tables = self.client.list_tables(&identity).await?;

        let schema = Arc::new(D1SchemaProvider::new(
            Arc::clone(&self.client),
            identity.clone(),
            alias.clone(),
            tables.clone(),
            self.batch_size,
        ));
        self.catalog.register_schema(&alias, schema).map_err(|e| {
            CirrusError::from(e).with_context(ErrorContext::Catalog {
                alias: alias.clone(),
                table: None,
            })
        })?;

        tracing::info!(
            alias = %alias,
            database = %database_name,
            tables = tables.len(),
            "Attached D1 database"
        );

        let entry = AttachmentEntry {
            alias: alias.clone(),
            database_name,
            database_id,
            identity,
            secret: request.secret,
            tables,
        };
        self.registry.register(entry);
        self.registry.lookup(&alias).ok_or_else(|| {
            CirrusError::new(
                ErrorCode::Internal,
                format!("Attachment '{}' vanished after registration", alias),
            )
        })
    }

    /// Removes the attachment and its schema. `false` when nothing was attached under `alias`.
    pub fn detach(&self, alias: &str) -> Result<bool> {
        let alias = normalize_alias(alias);
        let Some(entry) = self.registry.unregister(&alias) else {
            return Ok(false);
        };
        self.catalog.deregister_schema(&alias, true)?;
        tracing::info!(alias = %alias, database = %entry.database_name, "Detached D1 database");
        Ok(true)
    }

    fn reject_existing(&self, alias: &str, overwrite: bool) -> Result<()> {
        if !overwrite && self.registry.contains(alias) {
            return Err(CirrusError::new(
                ErrorCode::AlreadyAttached,
                format!("A database is already attached as '{}'", alias),
            )
            .with_hint("pass overwrite = true or choose another alias")
            .with_context(ErrorContext::Catalog {
                alias: alias.to_string(),
                table: None,
            }));
        }
        Ok(())
    }
}

/// Unquoted identifiers reach DataFusion lowercased, so aliases are stored that way.
pub fn normalize_alias(alias: &str) -> String {
    alias.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_connectors::sources::HttpTransport;
    use datafusion::catalog::MemoryCatalogProvider;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DB_ID: &str = "4f7b3c2a-1234-4abc-9def-0123456789ab";

    async fn server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [{"uuid": DB_ID, "name": "demo"}],
                "result_info": {"page": 1, "per_page": 100, "count": 1, "total_count": 1}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"sql": "PRAGMA table_list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [{"results": [
                    {"schema": "main", "name": "users", "type": "table", "ncol": 2, "wr": 0, "strict": 0}
                ]}]
            })))
            .mount(&server)
            .await;
        server
    }

    fn remote_catalog(server: &MockServer) -> (RemoteCatalog, Arc<MemoryCatalogProvider>) {
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let client = D1Client::new(Arc::new(transport), &server.uri(), 100).unwrap();
        let catalog = Arc::new(MemoryCatalogProvider::new());
        let remote = RemoteCatalog::new(
            Arc::new(client),
            Arc::new(AttachmentRegistry::new()),
            catalog.clone(),
            1024,
        );
        (remote, catalog)
    }

    fn identity() -> EndpointIdentity {
        EndpointIdentity::new("acct", "tok")
    }

    #[tokio::test]
    async fn test_attach_by_name_registers_schema() {
        let server = server().await;
        let (remote, catalog) = remote_catalog(&server);

        let entry = remote
            .attach(AttachRequest::new("demo", identity()).with_secret("cred1"))
            .await
            .unwrap();
        assert_eq!(entry.alias, "demo");
        assert_eq!(entry.database_id, DB_ID);
        assert_eq!(entry.identity.target.as_deref(), Some(DB_ID));
        assert_eq!(entry.tables.len(), 1);
        assert_eq!(catalog.schema_names(), vec!["demo"]);
        assert!(catalog.schema("demo").unwrap().table_exist("users"));
    }

    #[tokio::test]
    async fn test_attach_by_id_takes_the_human_name_as_alias() {
        let server = server().await;
        let (remote, _) = remote_catalog(&server);

        let entry = remote
            .attach(AttachRequest::new(DB_ID, identity()))
            .await
            .unwrap();
        assert_eq!(entry.alias, "demo");
        assert_eq!(entry.database_name, "demo");

        let entry = remote
            .attach(AttachRequest::new(DB_ID, identity()).with_alias("Prod"))
            .await
            .unwrap();
        assert_eq!(entry.alias, "prod");
    }

    #[tokio::test]
    async fn test_overwrite_false_rejects_existing_alias() {
        let server = server().await;
        let (remote, _) = remote_catalog(&server);
        remote
            .attach(AttachRequest::new("demo", identity()))
            .await
            .unwrap();

        let err = remote
            .attach(AttachRequest::new("demo", identity()).with_overwrite(false))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyAttached);

        remote
            .attach(AttachRequest::new("demo", identity()))
            .await
            .unwrap();
        assert_eq!(remote.registry().aliases(), vec!["demo"]);
    }

    #[tokio::test]
    async fn test_unknown_name_fails() {
        let server = server().await;
        let (remote, catalog) = remote_catalog(&server);
        let err = remote
            .attach(AttachRequest::new("nope", identity()))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DatabaseNotFound);
        assert!(catalog.schema_names().is_empty());
    }

    #[tokio::test]
    async fn test_detach_removes_schema() {
        let server = server().await;
        let (remote, catalog) = remote_catalog(&server);
        remote
            .attach(AttachRequest::new("demo", identity()))
            .await
            .unwrap();

        assert!(remote.detach("DEMO").unwrap());
        assert!(catalog.schema_names().is_empty());
        assert!(remote.lookup("demo").is_none());
        assert!(!remote.detach("demo").unwrap());
    }
}
