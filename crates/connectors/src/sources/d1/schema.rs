use async_trait::async_trait;
use cirrus_common::credentials::EndpointIdentity;
use cirrus_error::CirrusError;
use datafusion::catalog::SchemaProvider;
use datafusion::datasource::TableProvider;
use datafusion::error::Result as DFResult;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::client::D1Client;
use super::introspect::TableDescriptor;
use super::scan::D1TableProvider;

/// Tables of one attached database, exposed as a DataFusion schema.
///
/// Column metadata is fetched on first reference to a table and cached for the
/// life of the attachment. The schema is read-only: tables cannot be
/// registered or dropped through it.
#[derive(Debug)]
pub struct D1SchemaProvider {
    client: Arc<D1Client>,
    identity: EndpointIdentity,
    alias: String,
    tables: Vec<TableDescriptor>,
    batch_size: usize,
    providers: Mutex<HashMap<String, Arc<D1TableProvider>>>,
}

impl D1SchemaProvider {
    pub fn new(
        client: Arc<D1Client>,
        identity: EndpointIdentity,
        alias: impl Into<String>,
        tables: Vec<TableDescriptor>,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            identity,
            alias: alias.into(),
            tables,
            batch_size,
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    /// Exact match first, then case-insensitive, since unquoted identifiers
    /// reach us lowercased.
    fn descriptor(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .or_else(|| self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name)))
    }

    fn cached(&self, name: &str) -> Option<Arc<D1TableProvider>> {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl SchemaProvider for D1SchemaProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    async fn table(&self, name: &str) -> DFResult<Option<Arc<dyn TableProvider>>> {
        let Some(descriptor) = self.descriptor(name) else {
            return Ok(None);
        };
        let remote_name = descriptor.name.clone();
        if let Some(provider) = self.cached(&remote_name) {
            return Ok(Some(provider as Arc<dyn TableProvider>));
        }

        tracing::debug!(alias = %self.alias, table = %remote_name, "Introspecting columns");
        let provider = Arc::new(
            D1TableProvider::try_new(
                Arc::clone(&self.client),
                self.identity.clone(),
                &remote_name,
                self.batch_size,
            )
            .await?,
        );
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote_name, Arc::clone(&provider));
        Ok(Some(provider as Arc<dyn TableProvider>))
    }

    fn register_table(
        &self,
        name: String,
        _table: Arc<dyn TableProvider>,
    ) -> DFResult<Option<Arc<dyn TableProvider>>> {
        Err(CirrusError::unsupported(format!(
            "Cannot create table '{}' in attached database '{}'",
            name, self.alias
        ))
        .into())
    }

    fn deregister_table(&self, name: &str) -> DFResult<Option<Arc<dyn TableProvider>>> {
        Err(CirrusError::unsupported(format!(
            "Cannot drop table '{}' in attached database '{}'",
            name, self.alias
        ))
        .into())
    }

    fn table_exist(&self, name: &str) -> bool {
        self.descriptor(name).is_some()
    }
}
