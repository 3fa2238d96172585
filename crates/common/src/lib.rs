//! Common building blocks shared across cirrus crates:
//! - **Configuration**: strongly typed application configuration (`config`).
//! - **Credentials**: secret store and endpoint identity resolution (`credentials`).
//! - **Telemetry**: tracing subscriber setup (`telemetry`).
pub mod config;
pub mod credentials;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_env;
