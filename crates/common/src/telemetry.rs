//! Tracing subscriber setup.
//!
//! Installs a `tracing_subscriber` registry with an `EnvFilter` and a fmt layer.
//! `RUST_LOG` takes precedence over the configured default directive.

use crate::config::TelemetryConfig;
use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn env_filter(config: &TelemetryConfig) -> Result<EnvFilter> {
    EnvFilter::builder()
        .with_default_directive(
            config
                .log_filter
                .parse()
                .with_context(|| format!("Invalid log filter '{}'", config.log_filter))?,
        )
        .from_env()
        .context("Invalid RUST_LOG directive")
}

/// Installs the global subscriber. Fails instead of panicking when one is already set.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(config)?)
        .with(tracing_subscriber::fmt::layer().with_ansi(config.ansi))
        .try_init()
        .context("Tracing subscriber already installed")?;

    tracing::info!(filter = %config.log_filter, "Tracing initialized");
    Ok(())
}
