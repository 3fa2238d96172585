//! The remote query engine.
//!
//! `RemoteEngine` owns one DataFusion `SessionContext` with the remote limit
//! rule installed and the `d1_*`/`r2_sql_*` table functions registered.
//! Databases attached through it appear as schemas of the default catalog.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use cirrus_common::config::AppConfig;
//! use cirrus_runtime::engine::{RemoteEngine, RemoteEngineOptions};
//!
//! let engine = RemoteEngine::new(RemoteEngineOptions::new(AppConfig::default())).await?;
//! let mut session = engine.session();
//! session.execute("SELECT * FROM d1_databases('cred1')").await?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use cirrus_common::config::{AppConfig, AttachmentConfig};
use cirrus_common::credentials::{CredentialRequest, SecretStore, ServiceKind};
use cirrus_connectors::sources::d1::D1Client;
use cirrus_connectors::sources::r2_sql::R2SqlClient;
use cirrus_connectors::sources::QueryResult;
use datafusion::execution::session_state::SessionStateBuilder;
use datafusion::prelude::{SessionConfig, SessionContext};
use std::sync::Arc;
use tracing::{debug, info};

use crate::attach::{AttachRequest, RemoteCatalog};
use crate::functions;
use crate::optimizer::RemoteLimitPushdown;
use crate::registry::{AttachmentEntry, AttachmentRegistry};
use crate::services::{process_env, EnvLookup, RemoteServices};
use crate::session::RemoteSession;
use crate::transaction::TransactionManager;

pub struct RemoteEngineOptions {
    pub config: AppConfig,
    /// Credential fallback lookup, the process environment by default.
    pub env: EnvLookup,
}

impl RemoteEngineOptions {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            env: process_env(),
        }
    }

    pub fn with_env<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(env);
        self
    }
}

pub struct RemoteEngine {
    context: SessionContext,
    services: Arc<RemoteServices>,
}

impl RemoteEngine {
    pub async fn new(options: RemoteEngineOptions) -> Result<Self> {
        let config = options.config;
        let d1 = Arc::new(D1Client::from_settings(&config.remote)?);
        let r2_sql = Arc::new(R2SqlClient::from_settings(&config.remote)?);
        let secrets = Arc::new(
            SecretStore::from_config(&config.secrets).context("Failed to load secrets")?,
        );

        let context = Self::build_session_context()?;
        let default_catalog = context
            .state()
            .config()
            .options()
            .catalog
            .default_catalog
            .clone();
        let catalog = context
            .catalog(&default_catalog)
            .with_context(|| format!("Default catalog '{}' is missing", default_catalog))?;

        let remote_catalog = Arc::new(RemoteCatalog::new(
            Arc::clone(&d1),
            Arc::new(AttachmentRegistry::new()),
            catalog,
            config.scan.batch_size,
        ));
        let transactions = Arc::new(TransactionManager::new(Arc::clone(&d1)));
        let services = Arc::new(RemoteServices::new(
            d1,
            r2_sql,
            secrets,
            remote_catalog,
            transactions,
            config.scan.batch_size,
            options.env,
        ));

        functions::register_all(&context, &services);

        let engine = Self { context, services };
        engine.attach_configured(&config.attachments).await;
        Ok(engine)
    }

    fn build_session_context() -> Result<SessionContext> {
        let session_config = SessionConfig::new().with_information_schema(true);
        let context = SessionContext::new_with_config(session_config);
        let state = context.state();

        // Defaults first so TableScan fetch and pushed filters are settled.
        let mut optimizer_rules = state.optimizer().rules.clone();
        optimizer_rules.push(Arc::new(RemoteLimitPushdown::new()));

        debug!("Optimizer rules registered:");
        for (i, rule) in optimizer_rules.iter().enumerate() {
            debug!("  {}: {}", i, rule.name());
        }

        let state = SessionStateBuilder::new_from_existing(state)
            .with_optimizer_rules(optimizer_rules)
            .build();
        Ok(SessionContext::new_with_state(state))
    }

    async fn attach_configured(&self, attachments: &[AttachmentConfig]) {
        for attachment in attachments {
            let request = CredentialRequest {
                secret: attachment.secret.clone(),
                ..Default::default()
            };
            let result = self
                .attach(
                    &attachment.database,
                    &request,
                    attachment.alias.as_deref(),
                    attachment.overwrite,
                )
                .await;
            if let Err(e) = result {
                // Startup continues with the databases that could be reached.
                tracing::error!("Failed to attach '{}': {}", attachment.database, e);
            }
        }
        info!(
            attached = self.services.catalog().registry().aliases().len(),
            "Configured attachments processed"
        );
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn services(&self) -> &Arc<RemoteServices> {
        &self.services
    }

    pub fn secrets(&self) -> &SecretStore {
        self.services.secrets()
    }

    /// A new session. Transactions live in the session that opened them.
    pub fn session(&self) -> RemoteSession {
        RemoteSession::new(self.context.clone(), Arc::clone(&self.services))
    }

    pub async fn attach(
        &self,
        database: &str,
        credentials: &CredentialRequest,
        alias: Option<&str>,
        overwrite: bool,
    ) -> cirrus_error::Result<Arc<AttachmentEntry>> {
        let identity = self.services.resolve(credentials, ServiceKind::D1)?;
        let mut request = AttachRequest::new(database, identity).with_overwrite(overwrite);
        if let Some(secret) = credentials.secret.clone() {
            request = request.with_secret(secret);
        }
        if let Some(alias) = alias {
            request = request.with_alias(alias);
        }
        self.services.catalog().attach(request).await
    }

    pub fn detach(&self, alias: &str) -> cirrus_error::Result<bool> {
        self.services.catalog().detach(alias)
    }

    pub fn attachments(&self) -> Vec<String> {
        self.services.catalog().registry().aliases()
    }

    /// Runs `sql` directly against a remote database, bypassing planning and
    /// the transaction buffer. `database` is a name or id; without it the
    /// credentials' own target is used.
    pub async fn execute_remote(
        &self,
        sql: &str,
        credentials: &CredentialRequest,
        database: Option<&str>,
    ) -> cirrus_error::Result<QueryResult> {
        let identity = self.services.d1_identity(credentials, database).await?;
        identity.require_target("execute_remote")?;
        self.services.d1().execute(&identity, sql).await
    }
}
