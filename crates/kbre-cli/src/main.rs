use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kbre_sync::{build_scheduler, DatabaseSettings, SyncConfig, SyncPipeline};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kbre-sync")]
#[command(about = "Sync KB weekly real-estate statistics into Postgres")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once (default).
    Sync,
    /// Apply database migrations and exit.
    Migrate,
    /// Run the pipeline on the configured cron until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Migrate => {
            kbre_sync::apply_migrations(&DatabaseSettings::from_env()?).await?;
            println!("migrations applied");
        }
        Commands::Schedule => schedule(SyncConfig::from_env()?).await?,
        Commands::Sync => {
            let config = SyncConfig::from_env()?;
            if config.scheduler_enabled {
                return schedule(config).await;
            }
            let max_failed = config.max_failed_batches;
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            println!("{}", summary.one_line());
            summary.ensure_success(max_failed)?;
        }
    }

    Ok(())
}

async fn schedule(config: SyncConfig) -> Result<()> {
    let cron = config.sync_cron.clone();
    let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
    let mut sched = build_scheduler(pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %cron, "scheduler started; waiting for ctrl-c");
    tokio::signal::ctrl_c().await?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
