//! Cirrus command line entry point.
//!
//! Loads configuration (`CIRRUS_CONFIG`, default `config/cirrus.yaml`),
//! initializes tracing, builds the engine and runs the SQL given as arguments,
//! or read from stdin when there are none.
use cirrus_common::config::AppConfig;
use cirrus_common::telemetry;
use cirrus_runtime::engine::{RemoteEngine, RemoteEngineOptions};
use cirrus_runtime::session::StatementResult;
use datafusion::arrow::util::pretty::pretty_format_batches;
use std::io::Read;

const DEFAULT_CONFIG_PATH: &str = "config/cirrus.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::var("CIRRUS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::from_file(&path)?;
    telemetry::init_tracing(&config.telemetry)?;

    let mut sql = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if sql.trim().is_empty() {
        std::io::stdin().read_to_string(&mut sql)?;
    }

    let engine = RemoteEngine::new(RemoteEngineOptions::new(config)).await?;
    let mut session = engine.session();

    for result in session.execute(&sql).await? {
        match result {
            StatementResult::Rows(batches) => println!("{}", pretty_format_batches(&batches)?),
            StatementResult::Buffered {
                alias,
                transaction,
                pending,
            } => println!(
                "buffered in transaction {} on '{}' ({} pending)",
                transaction, alias, pending
            ),
            StatementResult::Begin => println!("BEGIN"),
            StatementResult::Committed(outcomes) => {
                for (alias, outcome) in outcomes {
                    println!(
                        "committed {} statements on '{}' ({} changes)",
                        outcome.statements, alias, outcome.changes
                    );
                }
            }
            StatementResult::RolledBack { statements } => {
                println!("rolled back {} statements", statements)
            }
        }
    }

    if session.in_transaction() {
        tracing::warn!("Session ended with an open transaction; buffered writes were discarded");
    }
    Ok(())
}
