use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use larder_core::{RunMode, RunStats};
use larder_storage::Tracker;
use larder_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "larder")]
#[command(about = "Mirror a recipe catalog into a document database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the catalog against the tracker.
    Sync {
        /// Read every page and archive documents whose entries are gone.
        #[arg(long)]
        full: bool,
    },
    /// Re-fetch and re-validate previously rejected entries only.
    RetryRejected,
    /// Serve the webhook trigger (and the cron job when enabled).
    Serve,
    /// Seed the tracker from a destination CSV export.
    ImportCsv { path: PathBuf },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn print_summary(stats: &RunStats) {
    println!("sync complete: {}", stats.summary_line());
    for rejection in &stats.rejections {
        println!(
            "  rejected {} ({}): {}",
            rejection.id, rejection.title, rejection.reason
        );
    }
}

async fn import_csv(path: PathBuf) -> Result<()> {
    let config = SyncConfig::from_env();
    let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    let seed = larder_storage::records_from_export_csv(file, chrono::Utc::now())
        .with_context(|| format!("reading {}", path.display()))?;

    let mut tracker = Tracker::load(&config.tracker_path)
        .await
        .context("loading tracker")?;
    let imported = tracker.import(seed.records).await?;
    tracker.flush().await?;
    info!(imported, skipped = seed.skipped, "tracker seeded from export");
    println!(
        "import complete: imported={imported} skipped={} tracker={}",
        seed.skipped,
        config.tracker_path.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { full: false }) {
        Commands::Sync { full } => {
            let stats =
                larder_sync::run_sync_once_from_env(RunMode::Normal { full_sync: full }).await?;
            print_summary(&stats);
        }
        Commands::RetryRejected => {
            let stats = larder_sync::run_sync_once_from_env(RunMode::RetryRejected).await?;
            print_summary(&stats);
        }
        Commands::Serve => larder_web::serve_from_env().await?,
        Commands::ImportCsv { path } => import_csv(path).await?,
    }

    Ok(())
}
