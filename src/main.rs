use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rescrape::{
    config::RescrapeConfig,
    extractor::ContentExtractor,
    llm::LLMProcessor,
    BatchOrchestrator, MemoryRowStore, RunLock,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Re-scrape the URLs in the Error sheet and move recovered rows to Main.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file (TOML, YAML or JSON). Environment variables `RESCRAPE__*` override it.
    #[arg(short, long, env = "RESCRAPE_CONFIG")]
    config: Option<PathBuf>,

    /// Workbook file holding the Main and Error sheets as JSON.
    #[arg(short, long, default_value = "workbook.json")]
    workbook: PathBuf,

    /// Override the number of Error rows taken this run.
    #[arg(long)]
    max_rows: Option<usize>,

    /// Override the wall-clock budget of this run, in seconds.
    #[arg(long)]
    max_seconds: Option<u64>,

    /// Print the batch report as JSON instead of a text summary.
    #[arg(long)]
    json: bool,
}

/// The main entry point of the application.
///
/// Loads the configuration, takes the run lock next to the workbook, runs one batch
/// and writes the workbook back. A second concurrent run fails on the lock.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = RescrapeConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(max_rows) = args.max_rows {
        config.processing.max_rows_per_batch = max_rows;
    }
    if let Some(max_seconds) = args.max_seconds {
        config.processing.max_execution_time_seconds = max_seconds;
    }

    let lock_path = args.workbook.with_extension("lock");
    let _lock = RunLock::acquire(&lock_path, config.processing.lock_stale_after())
        .with_context(|| format!("another run holds {}", lock_path.display()))?;

    let store = Arc::new(
        MemoryRowStore::load(&args.workbook)
            .with_context(|| format!("reading workbook {}", args.workbook.display()))?
            .reject_duplicate_urls(&config.sheets.main_sheet),
    );

    let extractor = ContentExtractor::new(&config)?;
    let summarizer = LLMProcessor::new(config.llm_config.clone())?;

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{pos}/{len}] {wide_msg}")
            .context("progress template")?,
    );

    let orchestrator =
        BatchOrchestrator::new(&config, store.clone(), extractor, summarizer)?.with_progress(progress);

    // Persist whatever was committed, even when the batch aborted part-way.
    let outcome = orchestrator.run_batch().await;
    store
        .save(&args.workbook)
        .with_context(|| format!("writing workbook {}", args.workbook.display()))?;

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Batch aborted");
            return Err(e.into());
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\n=== Batch Summary ===");
        println!("Selected: {}", report.selected);
        println!("Moved to {}: {}", config.sheets.main_sheet, report.succeeded);
        println!("Soft failures: {}", report.soft_failed);
        println!("Hard failures: {}", report.hard_failed);
        println!("Left for next run: {}", report.skipped);
        if let Some(reason) = report.stop_reason {
            println!("Stopped early: {:?}", reason);
        }
        println!("Processing time: {:.2}s", report.elapsed_seconds);
    }

    info!(path = %args.workbook.display(), "Workbook saved");
    Ok(())
}
