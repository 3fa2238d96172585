use crate::credentials::{SecretSpec, ServiceKind};
use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use validator::Validate;

// Default constants
pub const DEFAULT_D1_API_BASE: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_R2_SQL_API_BASE: &str = "https://api.sql.cloudflarestorage.com/api/v1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LIST_PAGE_SIZE: usize = 100;
pub const DEFAULT_BATCH_SIZE: usize = 2048;
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const ENV_PREFIX: &str = "CIRRUS";

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(SecretString::from(s))
}

#[derive(Debug, Deserialize, Default, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub remote: RemoteSettings,
    #[serde(default)]
    #[validate(nested)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub secrets: HashMap<String, SecretConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub attachments: Vec<AttachmentConfig>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct RemoteSettings {
    #[serde(default = "default_d1_api_base")]
    #[validate(url)]
    pub d1_api_base: String,

    #[serde(default = "default_r2_sql_api_base")]
    #[validate(url)]
    pub r2_sql_api_base: String,

    /// Upper bound for one HTTP round trip. Requests are never retried.
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub request_timeout_secs: u64,

    #[serde(default = "default_list_page_size")]
    #[validate(range(min = 1, max = 10000))]
    pub list_page_size: usize,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            d1_api_base: default_d1_api_base(),
            r2_sql_api_base: default_r2_sql_api_base(),
            request_timeout_secs: default_request_timeout_secs(),
            list_page_size: default_list_page_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Validate)]
pub struct ScanSettings {
    /// Rows per emitted record batch.
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecretConfig {
    #[serde(default)]
    pub kind: ServiceKind,
    pub account_id: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_token: SecretString,
}

impl From<SecretConfig> for SecretSpec {
    fn from(cfg: SecretConfig) -> Self {
        SecretSpec {
            kind: cfg.kind,
            account_id: Some(cfg.account_id),
            api_token: Some(cfg.api_token),
        }
    }
}

/// A database attached when the engine starts.
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct AttachmentConfig {
    #[validate(length(min = 1))]
    pub database: String,
    pub secret: Option<String>,
    pub alias: Option<String>,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            ansi: default_ansi(),
        }
    }
}

fn default_d1_api_base() -> String {
    DEFAULT_D1_API_BASE.to_string()
}

fn default_r2_sql_api_base() -> String {
    DEFAULT_R2_SQL_API_BASE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_list_page_size() -> usize {
    DEFAULT_LIST_PAGE_SIZE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_overwrite() -> bool {
    true
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_ansi() -> bool {
    true
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // CIRRUS__SCAN__BATCH_SIZE maps to scan.batch_size, etc.
        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }
}
