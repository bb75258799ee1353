//! Stock Loan Pipeline — Binary Entrypoint
//! Runs one pipeline stage (or the whole chain) against the configured
//! remote source, then reports run statistics.
//!
//! Usage: `stock-loan-pipeline [fetch|process|compact|merge|all]`
//! (defaults to `all`). Resumption is driven by recorded snapshot state,
//! so re-running a stage is always safe.

use stock_loan_pipeline::{Pipeline, PipelineConfig, RunStatus, Stage};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stock_loan_pipeline=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let stage = match std::env::args().nth(1) {
        None => Stage::All,
        Some(arg) => Stage::parse(&arg).unwrap_or_else(|| {
            eprintln!("unknown stage {arg:?}; expected fetch|process|compact|merge|all");
            std::process::exit(2);
        }),
    };

    let cfg = PipelineConfig::load_default()?;
    let pipeline = Pipeline::from_config(cfg);
    let stats = pipeline.run(stage).await?;

    if stats.status() == RunStatus::Partial {
        // Partial runs exit nonzero so schedulers notice, but the master
        // dataset is consistent and the next run resumes cleanly.
        std::process::exit(1);
    }
    Ok(())
}
