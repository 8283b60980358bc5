//! # Marketplace Sync Entry Point
//!
//! `serve` runs the API, webhook workers and scheduler; `migrate` only
//! applies database migrations.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use marketplace_sync::{
    adapters::AdapterFactory,
    config::{AppConfig, ConfigLoader},
    db,
    scheduler::SyncScheduler,
    server::{Services, run_server},
    telemetry::init_tracing,
};

#[derive(Parser)]
#[command(
    name = "marketplace-sync",
    version,
    about = "Marketplace sync and consistency engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API, webhook workers and scheduler (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;
    init_tracing(&config).context("failed to initialise tracing")?;
    info!(profile = %config.profile, "configuration loaded");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "effective configuration");
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Migrate => {
            let db = db::init_pool(&config).await?;
            db::run_migrations(&db).await
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let db = db::init_pool(&config).await?;
    db::run_migrations(&db).await?;

    let scheduler_config = config.scheduler.clone();
    let services = Services::build(Arc::new(config), db, AdapterFactory::new());
    let state = services.state;

    state.orchestrator.recover_interrupted_jobs().await?;
    state.reconciliation.recover_interrupted_runs().await?;

    let shutdown = CancellationToken::new();
    let workers = state
        .webhooks
        .spawn_workers(services.webhook_receiver, shutdown.clone());
    let scheduler = SyncScheduler::new(scheduler_config, &state, services.guard);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    let orchestrator = state.orchestrator.clone();
    let result = run_server(state, shutdown.clone()).await;
    shutdown.cancel();

    orchestrator.shutdown().await;
    for handle in workers {
        if let Err(err) = handle.await {
            warn!(error = %err, "webhook worker ended abnormally");
        }
    }
    if let Err(err) = scheduler_handle.await {
        warn!(error = %err, "scheduler ended abnormally");
    }

    info!("marketplace sync stopped");
    result
}
