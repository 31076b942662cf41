use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pncp_core::compact_day;
use pncp_sync::{RunMode, SyncConfig, SyncPipeline, SyncRunSummary, SyncSettings, WindowPlan};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "pncp")]
#[command(about = "Mirror PNCP procurement items into a local JSON file")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Mirror file (overrides PNCP_STORE_PATH)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// YAML settings file (overrides PNCP_SETTINGS_PATH)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Maximum open records re-checked per refresh pass
    #[arg(long, global = true)]
    limit: Option<usize>,

    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh open records, then import newly published ones
    Sync,
    /// Re-check open records only
    Refresh,
    /// Import newly published records only
    Import,
    /// Print the next import window without touching the network
    Plan,
    /// Run full syncs on the SYNC_CRON_1 / SYNC_CRON_2 schedule until Ctrl-C
    Schedule,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("pncp error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;

    let mut config = SyncConfig::from_env();
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(settings) = cli.settings {
        config.settings_path = settings;
    }
    let mut settings = SyncSettings::load(&config.settings_path).await?;
    if cli.limit.is_some() {
        settings.refresh.max_records = cli.limit;
    }

    let command = cli.command.unwrap_or(Commands::Sync);
    if matches!(command, Commands::Schedule) {
        config.scheduler_enabled = true;
    }
    let pipeline = SyncPipeline::new(config, settings)?;

    match command {
        Commands::Sync => print_summary(&pipeline.run_once(RunMode::Full).await?),
        Commands::Refresh => print_summary(&pipeline.run_once(RunMode::RefreshOnly).await?),
        Commands::Import => print_summary(&pipeline.run_once(RunMode::ImportOnly).await?),
        Commands::Plan => {
            let today = chrono::Local::now().date_naive();
            match pipeline.plan(today).await? {
                WindowPlan::Fetch(window) => println!(
                    "next window: {} -> {}",
                    compact_day(window.start),
                    compact_day(window.end)
                ),
                WindowPlan::UpToDate { next_start } => {
                    println!("up to date; next window starts {}", compact_day(next_start))
                }
            }
        }
        Commands::Schedule => {
            let mut sched = Arc::new(pipeline)
                .maybe_build_scheduler()
                .await?
                .context("scheduler not built")?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    let window = summary
        .window
        .map(|w| format!("{}..{}", compact_day(w.start), compact_day(w.end)))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "sync complete: run_id={} records={} refreshed_changes={} window={} appended={} saved={}",
        summary.run_id,
        summary.records,
        summary.refreshed_changes(),
        window,
        summary.appended,
        summary.saved
    );
}

fn init_tracing(quiet: bool, verbose: bool) -> Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("PNCP_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}
