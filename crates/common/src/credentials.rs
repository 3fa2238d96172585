//! Credential storage and endpoint identity resolution.
//!
//! Every remote call is made on behalf of an [`EndpointIdentity`]. Identities are
//! resolved field by field: a named secret wins over explicit parameters, which
//! win over the `CLOUDFLARE_*` environment variables. A missing account id or
//! token is a configuration error raised before any network traffic.

use crate::config::SecretConfig;
use cirrus_error::{CirrusError, ErrorCode, ErrorContext, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

pub const ENV_ACCOUNT_ID: &str = "CLOUDFLARE_ACCOUNT_ID";
pub const ENV_API_TOKEN: &str = "CLOUDFLARE_API_TOKEN";
pub const ENV_DATABASE_ID: &str = "CLOUDFLARE_D1_DATABASE_ID";

/// Remote service a secret authenticates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    #[default]
    D1,
    R2Sql,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::D1 => write!(f, "d1"),
            ServiceKind::R2Sql => write!(f, "r2_sql"),
        }
    }
}

/// Input to [`SecretStore::create`]. Both fields are required.
#[derive(Debug, Clone, Default)]
pub struct SecretSpec {
    pub kind: ServiceKind,
    pub account_id: Option<String>,
    pub api_token: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct StoredSecret {
    pub kind: ServiceKind,
    pub account_id: String,
    pub api_token: SecretString,
}

/// Named secrets. Names are case-insensitive, last create wins.
#[derive(Debug, Default)]
pub struct SecretStore {
    secrets: RwLock<HashMap<String, StoredSecret>>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(secrets: &HashMap<String, SecretConfig>) -> Result<Self> {
        let store = Self::new();
        for (name, cfg) in secrets {
            store.create(name, cfg.clone().into())?;
        }
        Ok(store)
    }

    pub fn create(&self, name: &str, spec: SecretSpec) -> Result<()> {
        let account_id = spec
            .account_id
            .filter(|a| !a.is_empty())
            .ok_or_else(|| missing_in_secret(name, "account_id"))?;
        let api_token = spec
            .api_token
            .filter(|t| !t.expose_secret().is_empty())
            .ok_or_else(|| missing_in_secret(name, "api_token"))?;

        let mut secrets = self.secrets.write().unwrap_or_else(|e| e.into_inner());
        secrets.insert(
            name.to_lowercase(),
            StoredSecret {
                kind: spec.kind,
                account_id,
                api_token,
            },
        );
        tracing::debug!(secret = %name, kind = %spec.kind, "Secret stored");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut secrets = self.secrets.write().unwrap_or_else(|e| e.into_inner());
        secrets.remove(&name.to_lowercase()).is_some()
    }

    pub fn get(&self, name: &str, kind: ServiceKind) -> Result<StoredSecret> {
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        let secret = secrets.get(&name.to_lowercase()).ok_or_else(|| {
            CirrusError::new(
                ErrorCode::SecretNotFound,
                format!("Secret '{}' not found", name),
            )
            .with_context(ErrorContext::Credential {
                secret: Some(name.to_string()),
            })
        })?;
        if secret.kind != kind {
            return Err(CirrusError::new(
                ErrorCode::SecretKindMismatch,
                format!(
                    "Secret '{}' is a {} secret, expected {}",
                    name, secret.kind, kind
                ),
            ));
        }
        Ok(secret.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = secrets.keys().cloned().collect();
        names.sort();
        names
    }
}

fn missing_in_secret(name: &str, field: &str) -> CirrusError {
    CirrusError::new(
        ErrorCode::MissingCredential,
        format!("Secret '{}' requires {}", name, field),
    )
    .with_context(ErrorContext::Credential {
        secret: Some(name.to_string()),
    })
}

/// Account, token and optional target (database id or bucket name) for remote calls.
#[derive(Debug, Clone)]
pub struct EndpointIdentity {
    pub account_id: String,
    pub api_token: SecretString,
    pub target: Option<String>,
}

impl EndpointIdentity {
    pub fn new(account_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            api_token: SecretString::from(api_token.into()),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// The target, or a `MissingDatabase` error naming the operation that needed it.
    pub fn require_target(&self, operation: &str) -> Result<&str> {
        self.target.as_deref().ok_or_else(|| {
            CirrusError::new(
                ErrorCode::MissingDatabase,
                format!(
                    "{} requires a database id (via parameter or {} env)",
                    operation, ENV_DATABASE_ID
                ),
            )
        })
    }
}

/// Explicit credential inputs for one call.
#[derive(Debug, Clone, Default)]
pub struct CredentialRequest {
    pub secret: Option<String>,
    pub account_id: Option<String>,
    pub api_token: Option<SecretString>,
    pub target: Option<String>,
}

impl CredentialRequest {
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Default::default()
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn resolve(&self, store: &SecretStore, kind: ServiceKind) -> Result<EndpointIdentity> {
        self.resolve_with(store, kind, |key| std::env::var(key).ok())
    }

    /// Resolution with an injectable environment lookup.
    pub fn resolve_with<F>(
        &self,
        store: &SecretStore,
        kind: ServiceKind,
        env: F,
    ) -> Result<EndpointIdentity>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = match non_empty(self.secret.clone()) {
            Some(name) => Some(store.get(&name, kind)?),
            None => None,
        };

        let account_id = secret
            .as_ref()
            .map(|s| s.account_id.clone())
            .or_else(|| non_empty(self.account_id.clone()))
            .or_else(|| non_empty(env(ENV_ACCOUNT_ID)))
            .ok_or_else(|| missing_credential("account_id", ENV_ACCOUNT_ID))?;

        let api_token = secret
            .map(|s| s.api_token)
            .or_else(|| {
                self.api_token
                    .clone()
                    .filter(|t| !t.expose_secret().is_empty())
            })
            .or_else(|| non_empty(env(ENV_API_TOKEN)).map(SecretString::from))
            .ok_or_else(|| missing_credential("api_token", ENV_API_TOKEN))?;

        let target = non_empty(self.target.clone()).or_else(|| match kind {
            ServiceKind::D1 => non_empty(env(ENV_DATABASE_ID)),
            ServiceKind::R2Sql => None,
        });

        Ok(EndpointIdentity {
            account_id,
            api_token,
            target,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn missing_credential(field: &str, env_var: &str) -> CirrusError {
    CirrusError::new(
        ErrorCode::MissingCredential,
        format!(
            "{} required (via secret, parameter, or {} env)",
            field, env_var
        ),
    )
    .with_context(ErrorContext::Credential { secret: None })
}
