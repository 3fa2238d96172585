use cirrus_common::credentials::{CredentialRequest, EndpointIdentity, SecretStore, ServiceKind};
use cirrus_connectors::sources::d1::{looks_like_database_id, D1Client};
use cirrus_connectors::sources::r2_sql::R2SqlClient;
use cirrus_error::Result;
use std::fmt;
use std::sync::Arc;

use crate::attach::RemoteCatalog;
use crate::transaction::TransactionManager;

/// Environment variable lookup used as the last credential fallback.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn process_env() -> EnvLookup {
    Arc::new(|key| std::env::var(key).ok())
}

/// Clients and shared state behind the engine, its sessions and table functions.
pub struct RemoteServices {
    d1: Arc<D1Client>,
    r2_sql: Arc<R2SqlClient>,
    secrets: Arc<SecretStore>,
    catalog: Arc<RemoteCatalog>,
    transactions: Arc<TransactionManager>,
    batch_size: usize,
    env: EnvLookup,
}

impl fmt::Debug for RemoteServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteServices")
            .field("secrets", &self.secrets.names())
            .field("attachments", &self.catalog.registry().aliases())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl RemoteServices {
    pub fn new(
        d1: Arc<D1Client>,
        r2_sql: Arc<R2SqlClient>,
        secrets: Arc<SecretStore>,
        catalog: Arc<RemoteCatalog>,
        transactions: Arc<TransactionManager>,
        batch_size: usize,
        env: EnvLookup,
    ) -> Self {
        Self {
            d1,
            r2_sql,
            secrets,
            catalog,
            transactions,
            batch_size,
            env,
        }
    }

    pub fn d1(&self) -> &Arc<D1Client> {
        &self.d1
    }

    pub fn r2_sql(&self) -> &Arc<R2SqlClient> {
        &self.r2_sql
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    pub fn catalog(&self) -> &Arc<RemoteCatalog> {
        &self.catalog
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn resolve(
        &self,
        request: &CredentialRequest,
        kind: ServiceKind,
    ) -> Result<EndpointIdentity> {
        request.resolve_with(&self.secrets, kind, |key| (self.env)(key))
    }

    /// A D1 identity aimed at `database`, given as a name or an id. Names are
    /// resolved through the account listing. Without a database the request's
    /// own target, or the environment default, stays in place.
    pub async fn d1_identity(
        &self,
        request: &CredentialRequest,
        database: Option<&str>,
    ) -> Result<EndpointIdentity> {
        let identity = self.resolve(request, ServiceKind::D1)?;
        match database.map(str::trim).filter(|d| !d.is_empty()) {
            None => Ok(identity),
            Some(id) if looks_like_database_id(id) => Ok(identity.with_target(id)),
            Some(name) => {
                let id = self.d1.resolve_database_id(&identity, name).await?;
                Ok(identity.with_target(id))
            }
        }
    }
}
