use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lotwatch_core::{EntryId, RunId};
use lotwatch_storage::RunStore;
use lotwatch_sync::{cancel_on_ctrl_c, maybe_build_scheduler, SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lotwatch")]
#[command(about = "Marketplace counter snapshot pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one snapshot and print its summary.
    Sync {
        /// Discover entries from a saved catalog page instead of the live site.
        #[arg(long)]
        catalog_file: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
        /// Also fetch every lot page and append its offers to the run's offer log.
        #[arg(long)]
        offers: bool,
    },
    /// Run snapshots on the configured cron expression until Ctrl-C.
    Schedule,
    /// List registered runs, newest last.
    Runs,
    /// Print one entry of a run with its counters.
    Show { run: String, entry: String },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lotwatch=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn open_store(config: &SyncConfig) -> Result<RunStore> {
    RunStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening run store {}", config.database_url))
}

/// Runs the cron scheduler until the cancel flag is raised, then stops it.
async fn run_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
    cancel: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let Some(mut sched) = maybe_build_scheduler(pipeline, config, cancel.clone()).await? else {
        warn!("scheduler disabled; set LOTWATCH_SCHEDULER_ENABLED=1 to run on {}", config.sync_cron);
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler started");

    cancel
        .wait_for(|flag| *flag)
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped; waiting for the active run");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        catalog_file: None,
        workers: None,
        offers: false,
    }) {
        Commands::Sync {
            catalog_file,
            workers,
            offers,
        } => {
            if catalog_file.is_some() {
                config.catalog_file = catalog_file;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            config.collect_offers |= offers;
            let pipeline = SyncPipeline::from_config(&config).await?;
            let result = pipeline.run_once(cancel_on_ctrl_c()).await;
            pipeline.store().close().await;
            let summary = result?;
            println!(
                "sync complete: run_id={} resumed={} discovered={} succeeded={} failed={} skipped={} offers={}",
                summary.run_id,
                summary.resumed,
                summary.discovered,
                summary.succeeded,
                summary.failed,
                summary.skipped_by_cancel,
                summary.offers_appended
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
            let mut cancel = cancel_on_ctrl_c();
            let result = run_scheduler(pipeline.clone(), &config, &mut cancel).await;
            pipeline.wait_idle().await;
            pipeline.store().close().await;
            result?;
        }
        Commands::Runs => {
            let store = open_store(&config).await?;
            let result = store.list_runs().await;
            store.close().await;
            for run in result? {
                println!("{run}");
            }
        }
        Commands::Show { run, entry } => {
            let run = RunId::parse(&run).with_context(|| format!("parsing run id {run}"))?;
            let entry: EntryId = entry
                .parse()
                .with_context(|| format!("parsing entry id {entry}"))?;
            let store = open_store(&config).await?;
            let result = store.get_entry(&run, entry).await;
            store.close().await;
            let found = result.with_context(|| format!("loading entry {entry} from run {run}"))?;
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
    }

    Ok(())
}
