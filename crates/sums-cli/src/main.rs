use anyhow::Result;
use clap::{Parser, Subcommand};
use sums_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sums-cli")]
#[command(about = "Site Usage Metrics Sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over every enabled dataset.
    Sync,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = sums_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} datasets={} window={}..{}",
                summary.run_id,
                summary.datasets.len(),
                summary.started_at,
                summary.finished_at
            );
            for dataset in &summary.datasets {
                println!(
                    "  {}: {} ({} rows, {:+})",
                    dataset.id, dataset.status, dataset.merged_rows, dataset.added_rows
                );
            }
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env();
            let pipeline = SyncPipeline::new(config);
            match pipeline.maybe_build_scheduler().await? {
                Some(mut scheduler) => {
                    scheduler.start().await?;
                    tokio::signal::ctrl_c().await?;
                    scheduler.shutdown().await?;
                }
                None => {
                    eprintln!("scheduler disabled; set SUMS_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
