mod config;
mod error;
mod extract;
mod fetch;
mod interrupt;
mod normalize;
mod pipeline;
mod reader;
mod record;
mod retry;
mod runner;
mod stage;
mod stages;
mod store;
mod utils;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Settings;
use crate::fetch::{Fetcher, HttpFetcher, SpiderFetcher};
use crate::interrupt::Interrupts;
use crate::pipeline::{Pipeline, RunOptions, StageOutcome};
use crate::reader::{FieldReader, ListingReader};
use crate::stage::Stage;

#[derive(Parser)]
#[command(
    name = "listing_harvester",
    about = "Craigslist listing scraper: search pages to a filtered phone table"
)]
struct Cli {
    /// Search results URL to start from
    url: String,
    /// Stages to run (1 collect, 2 links, 3 details, 4 fields, 5 filter)
    #[arg(long, num_args = 1.., default_values_t = [1u8, 2, 3, 4, 5])]
    stages: Vec<u8>,
    /// Run every stage with a single worker
    #[arg(long)]
    no_parallel: bool,
    /// Workers for stage 1 (search pages)
    #[arg(long)]
    workers_stage1: Option<usize>,
    /// Workers for stage 2 (link extraction)
    #[arg(long)]
    workers_stage2: Option<usize>,
    /// Workers for stage 3 (listing fetch)
    #[arg(long)]
    workers_stage3: Option<usize>,
    /// Workers for stage 4 (field extraction)
    #[arg(long)]
    workers_stage4: Option<usize>,
    /// Max search pages to visit
    #[arg(long)]
    max_pages: Option<usize>,
    /// Redo work already recorded as done
    #[arg(long)]
    no_resume: bool,
    /// Settings file (default: ./harvest.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = FetcherKind::Http)]
    fetcher: FetcherKind,
    /// Keep one record per phone number in the filtered table
    #[arg(long)]
    dedup_by_phone: bool,
    /// Keep records without a valid phone in the filtered table
    #[arg(long)]
    keep_missing_phones: bool,
    #[arg(long)]
    no_progress: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum FetcherKind {
    /// Plain HTTP requests
    Http,
    /// spider.cloud rendering (needs SPIDER_API_KEY)
    Spider,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let t0 = Instant::now();
    let cli = Cli::parse();

    let stages = stage::parse_stages(&cli.stages)?;
    let settings = settings_for(&cli)?;
    init_tracing(settings.log_file.as_deref())?;

    info!(
        stages = ?stages.iter().map(|s| s.number()).collect::<Vec<_>>(),
        resume = !cli.no_resume,
        "Starting scraper for {}",
        cli.url
    );

    let reader: Arc<dyn FieldReader> = Arc::new(ListingReader);
    let fetcher: Arc<dyn Fetcher> = match cli.fetcher {
        FetcherKind::Http => Arc::new(HttpFetcher::new(
            &settings.user_agent,
            settings.fetch_timeout(),
            Arc::clone(&reader),
        )?),
        FetcherKind::Spider => Arc::new(SpiderFetcher::from_env()?),
    };

    let interrupts = Interrupts::new();
    let listener = interrupts.listen_for_ctrl_c();
    let pipeline = Pipeline::new(settings, fetcher, reader, interrupts);
    let opts = RunOptions {
        base_url: cli.url.clone(),
        stages,
        resume: !cli.no_resume,
        max_pages: cli.max_pages,
        show_progress: !cli.no_progress,
    };
    let result = pipeline.run(&opts).await;
    listener.abort();
    let report = result?;

    println!();
    for (stage, outcome) in &report.stages {
        match outcome {
            StageOutcome::Finished(s) => println!(
                "{}: {} ok, {} failed, {} skipped{}",
                stage,
                s.succeeded,
                s.failed,
                s.skipped,
                if s.interrupted { " (interrupted)" } else { "" }
            ),
            StageOutcome::Filtered(r) => println!(
                "{}: kept {} of {} records ({} removed)",
                stage,
                r.retained,
                r.original,
                r.original - r.retained
            ),
            StageOutcome::Failed(e) => println!("{}: failed: {}", stage, e),
        }
    }

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", utils::format_duration(elapsed));
    }
    Ok(())
}

/// Layered settings with command-line overrides on top.
fn settings_for(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.output_dir {
        settings.output_dir = dir.clone();
    }
    for (stage, workers) in [
        (Stage::Collect, cli.workers_stage1),
        (Stage::ExtractLinks, cli.workers_stage2),
        (Stage::FetchDetails, cli.workers_stage3),
        (Stage::ExtractFields, cli.workers_stage4),
    ] {
        if let Some(n) = workers {
            settings.workers.set(stage, n);
        }
    }
    if cli.no_parallel {
        settings.serial();
    }
    if cli.dedup_by_phone {
        settings.filter.dedup_by_phone = true;
    }
    if cli.keep_missing_phones {
        settings.filter.phone_required = false;
    }
    settings.validate()?;
    Ok(settings)
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {:?}", path))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}
