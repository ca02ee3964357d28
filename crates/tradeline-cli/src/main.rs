use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tradeline_core::{Clock, OutputTable, SystemClock};
use tradeline_storage::CsvRecordSource;
use tradeline_sync::{
    extract_identifiers, CancelFlag, ExportStatus, IdentifierFilter, LogProgress, PipelineConfig,
    RunOutcome, TradelinePipeline,
};

#[derive(Debug, Parser)]
#[command(name = "tradeline")]
#[command(about = "Flatten credit bureau reports into a tradeline table")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and export every selected report.
    Run(RunArgs),
    /// Normalize one local report file and print its rows as CSV.
    Normalize {
        report: PathBuf,
        #[arg(long)]
        pan: Option<String>,
        /// Evaluate time windows as of this date (YYYY-MM-DD) instead of now.
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Print the identifiers a filter text resolves to. `-` reads stdin.
    ExtractPans { text: String },
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Free text containing the identifiers to process.
    #[arg(long, conflicts_with = "pans_file")]
    pans: Option<String>,
    #[arg(long)]
    pans_file: Option<PathBuf>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Read `identifier,report_reference` rows from a CSV file instead of MySQL.
    #[arg(long)]
    records_csv: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    no_parquet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Normalize { report, pan, as_of } => normalize_file(report, pan, as_of),
        Commands::ExtractPans { text } => {
            let text = if text == "-" { read_stdin()? } else { text };
            for id in extract_identifiers(&text) {
                println!("{id}");
            }
            Ok(())
        }
    }
}

fn load_config(args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::from_env(),
    };
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if args.no_parquet {
        config.write_parquet = false;
    }
    config.validate()?;
    Ok(config)
}

fn filter_text(args: &RunArgs) -> Result<Option<String>> {
    match (&args.pans, &args.pans_file) {
        (Some(text), _) => Ok(Some(text.clone())),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map(Some)
            .with_context(|| format!("reading identifier list {}", path.display())),
        (None, None) => Ok(None),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let filter = IdentifierFilter::parse(filter_text(&args)?.as_deref())
        .context("no valid identifiers found in the filter text")?;
    if let IdentifierFilter::Only(ids) = &filter {
        info!(identifiers = ids.len(), "running for selected identifiers");
    }

    let mut pipeline = TradelinePipeline::from_config(config)?;
    if let Some(path) = &args.records_csv {
        pipeline = pipeline.with_source(Arc::new(CsvRecordSource::new(path.clone())));
    }

    let outcome = pipeline.run(&filter, &LogProgress, &CancelFlag::new()).await;
    println!("{}", outcome.summary());
    match outcome {
        RunOutcome::AbortedOnFatalError(message) => bail!("run aborted: {message}"),
        RunOutcome::CompletedWithData(report) => {
            if let ExportStatus::Written(manifest) = &report.export {
                for file in &manifest.files {
                    println!("  {} ({} bytes)", file.path, file.bytes);
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn normalize_file(path: PathBuf, pan: Option<String>, as_of: Option<NaiveDate>) -> Result<()> {
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let raw: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let now = match as_of {
        Some(date) => date.and_time(chrono::NaiveTime::MIN),
        None => SystemClock.now(),
    };

    let rows = tradeline_normalize::normalize_report(&raw, pan.as_deref().unwrap_or(""), now)
        .with_context(|| format!("normalizing {}", path.display()))?;
    tradeline_export::write_csv(io::stdout().lock(), &OutputTable::new(rows))
}

fn read_stdin() -> Result<String> {
    let mut text = String::new();
    io::stdin()
        .read_to_string(&mut text)
        .context("reading stdin")?;
    Ok(text)
}
