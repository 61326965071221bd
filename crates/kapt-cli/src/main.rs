use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kapt_core::SyncReport;
use kapt_storage::FileStore;
use kapt_sync::{maybe_build_scheduler, read_status, SyncConfig, SyncOrchestrator, Trigger};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kapt-cli")]
#[command(about = "K-apt bid board sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now.
    Sync,
    /// Run scheduled syncs until interrupted.
    Schedule,
    /// Show stored totals and the latest sync events.
    Status {
        #[arg(long, default_value_t = 5)]
        events: usize,
    },
}

fn print_report(report: &SyncReport) {
    println!(
        "sync complete: total={} new={} removed={} updated={} unchanged={} invalid={}",
        report.total_bids,
        report.newly_added,
        report.removed_from_selection,
        report.updated_in_selection,
        report.unchanged_in_selection,
        report.invalid_selections_removed
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let orchestrator = SyncOrchestrator::from_config(&config)?;
            let report = orchestrator.run_sync(Trigger::Manual).await?;
            print_report(&report);
        }
        Commands::Schedule => {
            let orchestrator = Arc::new(SyncOrchestrator::from_config(&config)?);
            let Some(mut sched) = maybe_build_scheduler(orchestrator, &config).await? else {
                bail!("scheduler disabled; set KAPT_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %config.sync_cron_1,
                cron_2 = %config.sync_cron_2,
                "scheduler running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Status { events } => {
            let store = FileStore::new(config.data_dir.clone());
            let status = read_status(&store, events).await?;
            println!(
                "data_dir={} bids={} selected={}",
                config.data_dir.display(),
                status.total_bids,
                status.selected
            );
            for event in &status.recent_events {
                let outcome = if event.success { "ok" } else { "failed" };
                println!(
                    "{} {:?} {} total={} new={}{}",
                    event.timestamp.to_rfc3339(),
                    event.trigger,
                    outcome,
                    event.report.total_bids,
                    event.report.newly_added,
                    event
                        .error
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
