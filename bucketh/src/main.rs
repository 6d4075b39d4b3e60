//! Bucketh - command line entry point
//!
//! Backs the configured dataset up into a bucket, restores it, and inspects
//! or verifies buckets.

use anyhow::{bail, Result};
use bucketh::events::{BucketEvent, EventBus};
use bucketh::executor::{inspect_bucket, verify_bucket, EntryKind};
use bucketh::media::{self, OriginalMarks};
use bucketh::progress::{format_bytes, format_duration, format_speed};
use bucketh::utils::{self, shutdown::ShutdownCoordinator};
use bucketh::{
    BackupEngine, BackupRequest, BuckethError, Config, EngineContext, LocalDataset, RestoreEngine,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back the dataset up into a bucket
    Backup {
        /// Bucket path, e.g. `icloud://photos.bkz` or `/mnt/backup/photos.bk`
        bucket: String,

        /// Refuse to write unless the bucket is still at this generation
        #[arg(long)]
        expected_generation: Option<u64>,
    },

    /// Restore a bucket into the dataset
    Restore { bucket: String },

    /// Print a bucket's manifest summary
    Inspect {
        bucket: String,

        /// Print the full manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-fingerprint every entry of a bucket
    Verify { bucket: String },

    /// Print the media assets of the dataset
    Index,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("Starting bucketh v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownCoordinator::new();
    let ctx = EngineContext::new(Arc::new(config)).with_cancel(shutdown.token());
    let signals = tokio::spawn(async move { shutdown.wait_for_signal().await });
    let renderer = spawn_event_logger(&ctx.events);

    let outcome = run(args.command, &ctx).await;

    renderer.abort();
    signals.abort();
    outcome
}

async fn run(command: Command, ctx: &EngineContext) -> Result<()> {
    let config = Arc::clone(&ctx.config);

    match command {
        Command::Backup {
            bucket,
            expected_generation,
        } => {
            let dataset = LocalDataset::from_config(&config.dataset, &config.media)?;
            let mut request = BackupRequest::new(bucket);
            request.expected_generation = expected_generation;

            let result = BackupEngine::new(ctx.clone())
                .run_request(&dataset, &request)
                .await?;
            println!(
                "Generation {}: {} entries written ({}), {} unchanged, {} removed",
                result.generation,
                result.entries_written,
                format_bytes(result.bytes_written),
                result.entries_unchanged,
                result.entries_removed
            );
            for path in &result.skipped {
                println!("  skipped (no original): {}", path);
            }
        }

        Command::Restore { bucket } => {
            let dataset = LocalDataset::from_config(&config.dataset, &config.media)?;
            match RestoreEngine::new(ctx.clone()).run(&bucket, &dataset).await {
                Ok(result) => println!(
                    "Restored generation {}: {} entries ({})",
                    result.generation,
                    result.entries_restored,
                    format_bytes(result.bytes_restored)
                ),
                Err(BuckethError::RestoreIncomplete(report)) => {
                    for failure in &report.failures {
                        eprintln!("  {}: {}", failure.path, failure.error);
                    }
                    bail!("Restore incomplete: {}", report.summary());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Command::Inspect { bucket, json } => {
            let (bucket, manifest) = inspect_bucket(ctx, &bucket).await?;
            if json {
                println!("{}", String::from_utf8_lossy(&manifest.to_json()?));
                return Ok(());
            }
            println!("{}", bucket);
            println!("  generation: {}", manifest.generation);
            println!("  created:    {}", manifest.created_at.to_rfc3339());
            println!("  entries:    {}", manifest.entries.len());
            println!("  size:       {}", format_bytes(manifest.total_bytes()));
            for (label, kind) in [
                ("database", EntryKind::DatabaseSnapshot),
                ("originals", EntryKind::MediaOriginal),
                ("variants", EntryKind::MediaVariant),
                ("resources", EntryKind::Resource),
            ] {
                println!("    {:<10} {}", label, manifest.count_of(kind));
            }
        }

        Command::Verify { bucket } => {
            let report = verify_bucket(ctx, &bucket).await?;
            for path in &report.mismatched {
                println!("  mismatched:   {}", path);
            }
            for path in &report.missing {
                println!("  missing:      {}", path);
            }
            for path in &report.unreferenced {
                println!("  unreferenced: {}", path);
            }
            println!(
                "Generation {}: {} ok, {} mismatched, {} missing",
                report.generation,
                report.ok.len(),
                report.mismatched.len(),
                report.missing.len()
            );
            if !report.is_clean() {
                bail!("Bucket {} failed verification", bucket);
            }
        }

        Command::Index => {
            let marks = OriginalMarks::from_config(&config.media)?;
            let index = media::index(&config.dataset.media_dir, &marks)?;
            for asset in index.assets.values() {
                println!("{}  {}", asset.root, asset.original.relative_path);
                for variant in &asset.variants {
                    println!("    [{}] {}", variant.tag, variant.file.relative_path);
                }
            }
            for file in &index.unclaimed {
                println!("unclaimed  {}", file.relative_path);
            }
            println!(
                "{} assets, {} variants, {}",
                index.assets.len(),
                index.variant_count(),
                format_bytes(index.total_bytes())
            );
        }

        Command::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Render progress events as log lines.
fn spawn_event_logger(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(BucketEvent::Progress(p)) => tracing::info!(
                    "{:.1}% ({} / {}, {} of {} entries) {} ETA {}",
                    p.percent,
                    format_bytes(p.transferred_bytes),
                    format_bytes(p.total_bytes),
                    p.entries_processed,
                    p.total_entries,
                    format_speed(p.bytes_per_second),
                    format_duration(p.eta_seconds)
                ),
                Ok(BucketEvent::EntryFailed { path, error, .. }) => {
                    tracing::warn!("{}: {}", path, error)
                }
                Ok(other) => tracing::trace!("{:?}", other),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event logger lagged, skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
