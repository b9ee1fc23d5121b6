//! Gophermart accrual reconciler
//!
//! ```text
//! ┌──────────────┐  acquire   ┌──────────────┐   GET /api/orders/{n}  ┌──────────┐
//! │accrual_queue │◀──────────▶│ worker × N   │───────────────────────▶│ accrual  │
//! │ (PostgreSQL) │  release   │              │◀───────────────────────│ service  │
//! └──────────────┘  delete    └──────┬───────┘                        └──────────┘
//!                                    │ status / ledger
//!                                    ▼
//!                             ┌──────────────┐
//!                             │ user_order + │
//!                             │accrual_ledger│
//!                             └──────────────┘
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use gophermart::config::{AppConfig, Overrides};
use gophermart::db::Database;
use gophermart::logging::init_logging;
use gophermart::reconcile::{PgOrderLedger, PgQueueStore, WorkerPool};
use gophermart::HttpAccrualClient;

#[derive(Parser, Debug)]
#[command(name = "gophermart", version, about = "Loyalty accrual reconciler")]
struct Cli {
    /// Config environment; loads config/<ENV>.yaml
    #[arg(short = 'e', long, default_value = "dev")]
    env: String,

    /// Explicit config file, takes precedence over --env
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// PostgreSQL connection string
    #[arg(short = 'd', long, env = "DATABASE_URI")]
    database_uri: Option<String>,

    /// Accrual service base URL
    #[arg(short = 'r', long, env = "ACCRUAL_SYSTEM_ADDRESS")]
    accrual_address: Option<String>,

    /// Number of reconciliation workers
    #[arg(short = 'w', long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path),
        None => AppConfig::load(&cli.env),
    }
    .context("Failed to load configuration")?
    .with_overrides(Overrides {
        database_url: cli.database_uri,
        accrual_address: cli.accrual_address,
        workers: cli.workers,
    });
    config.validate().context("Invalid configuration")?;

    let _guard = init_logging(&config.log);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("GIT_HASH"),
        env = %cli.env,
        "Starting gophermart accrual reconciler"
    );

    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.health_check().await.context("Database health check failed")?;
    db.migrate().await.context("Failed to apply schema")?;

    let accrual = HttpAccrualClient::new(&config.accrual.address, config.accrual.request_timeout())
        .context("Failed to build accrual client")?;

    let pool = WorkerPool::start(
        config.pool_config(),
        Arc::new(PgQueueStore::new(db.pool().clone())),
        Arc::new(PgOrderLedger::new(db.pool().clone())),
        Arc::new(accrual),
    );

    wait_for_shutdown().await?;

    let report = pool.shutdown().await;
    for failure in &report.failures {
        tracing::warn!(
            worker_id = failure.worker_id,
            error = %failure.error,
            "Worker ended with error"
        );
    }

    db.close().await;
    tracing::info!(clean_exits = report.clean_exits, "Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Received Ctrl-C");
            }
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        tracing::info!("Received Ctrl-C");
    }

    Ok(())
}
