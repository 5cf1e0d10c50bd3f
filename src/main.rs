//! Command-line front end for the TEC batching engine
//!
//! - Writing a default configuration
//! - Inspecting the batch schedule for a date range
//! - Materializing batches as `.npy` files for an external trainer
//! - Fitting exogenous normalization for a training run
//! - Comparing saved predictions against ground truth

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use deep_pred_tec::{
    data::{ArtifactKind, BatchExporter, PredictionStore},
    data::timestamp::{format_key, parse_datetime},
    session::{fit_normalization, Session},
    utils::{compare_sets, level_for_verbosity, setup_logging, Config},
};

#[derive(Parser)]
#[command(name = "deep_pred_tec")]
#[command(version = "0.1.0")]
#[command(about = "Batch TEC map time series for spatio-temporal forecasting models", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the first anchor
    #[arg(long)]
    start: Option<String>,

    /// Override the last anchor
    #[arg(long)]
    end: Option<String>,

    /// Override the batch size
    #[arg(long)]
    batch_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    InitConfig {
        /// Destination path
        path: PathBuf,
    },

    /// Build the batch schedule and print a summary
    Schedule,

    /// Build every batch and write its tensors as .npy files
    Materialize {
        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Stop after this many batches
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Fit exogenous normalization on the configured range
    FitNormalization,

    /// Report MAE/RMSE of saved predictions over a time range
    Compare {
        /// First anchor
        #[arg(long)]
        start: String,

        /// Last anchor
        #[arg(long)]
        end: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path } = &cli.command {
        setup_logging(&level_for_verbosity("info", cli.verbose));
        Config::create_default(path).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config =
        Config::load(&cli.config).with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    setup_logging(&level_for_verbosity(&config.logging.level, cli.verbose));
    info!("Loaded configuration from {}", cli.config.display());

    if let Some(start) = cli.start {
        config.data.start_date = start;
    }
    if let Some(end) = cli.end {
        config.data.end_date = end;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch.batch_size = batch_size;
    }
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::InitConfig { .. } => {}
        Commands::Schedule => show_schedule(&config)?,
        Commands::Materialize { out, limit } => materialize(&config, out, limit)?,
        Commands::FitNormalization => {
            let params = fit_normalization(&config).context("Failed to fit normalization")?;
            for ((name, mean), std) in params.feature_names.iter().zip(&params.means).zip(&params.stds) {
                println!("{:<6} mean {:>12.4}  std {:>12.4}", name, mean, std);
            }
        }
        Commands::Compare { start, end } => compare(&config, &start, &end)?,
    }

    Ok(())
}

fn show_schedule(config: &Config) -> Result<()> {
    let session = Session::open(config).context("Failed to load data")?;
    let schedule = session.schedule()?;
    let (train, val) = session.split_schedule()?;

    println!("\n=== Batch Schedule ===");
    println!("Range:            {} .. {}", config.data.start_date, config.data.end_date);
    println!("Valid anchors:    {}", schedule.num_anchors());
    println!("Excluded anchors: {}", schedule.excluded);
    println!("Batches:          {}", schedule.len());
    if let Some(last) = schedule.batches.last() {
        println!("Last batch size:  {}", last.len());
    }
    println!("Train / val:      {} / {} batches", train.len(), val.len());
    if let (Some(first), Some(last)) = (schedule.anchors().next(), schedule.anchors().last()) {
        println!("First anchor:     {}", format_key(first));
        println!("Last anchor:      {}", format_key(last));
    }
    Ok(())
}

fn materialize(config: &Config, out: PathBuf, limit: Option<usize>) -> Result<()> {
    let session = Session::open(config).context("Failed to load data")?;
    let schedule = session.schedule()?;
    if schedule.is_empty() {
        warn!("No valid anchors in range; nothing to write");
    }

    let mut exporter = BatchExporter::create(&out, config.requested_slots())?;
    let limit = limit.unwrap_or(usize::MAX);
    for batch in session
        .pipeline(&schedule)
        .prefetch(config.batch.prefetch_depth)
        .take(limit)
    {
        let batch = batch?;
        exporter
            .write(&batch)
            .with_context(|| format!("Failed to export batch {}", batch.batch.index))?;
    }
    let manifest = exporter.finish()?;
    println!("Manifest written to {}", manifest.display());
    Ok(())
}

fn compare(config: &Config, start: &str, end: &str) -> Result<()> {
    let start = parse_datetime(start)?;
    let end = parse_datetime(end)?;
    let store = PredictionStore::new(&config.run.run_dir, config.data.resolution_minutes);

    let predictions = store.read_range(ArtifactKind::Prediction, start, end)?;
    let truths = store.read_range(ArtifactKind::Truth, start, end)?;
    info!(
        "Found {} predictions and {} ground-truth files in {:?}",
        predictions.len(),
        truths.len(),
        store.dir()
    );

    let (overall, per_anchor, unmatched) = compare_sets(&predictions, &truths)?;
    if !unmatched.is_empty() {
        warn!("{} anchors lack a prediction or ground-truth file", unmatched.len());
    }

    println!("\n=== Forecast Error ===");
    for (anchor, metrics) in &per_anchor {
        println!("{}  {}", format_key(anchor), metrics);
    }
    println!("Overall: {}", overall);
    Ok(())
}
