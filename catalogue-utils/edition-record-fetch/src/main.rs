use anyhow::{bail, Context, Result};
use catalogue_core::catalogue::CatalogueClient;
use catalogue_core::checkpoint::{read_ids, write_lines};
use catalogue_core::config::{CatalogueConfig, DEFAULT_CATALOGUE_URL};
use catalogue_core::fetch::{run_fetch_pipeline, FetchOutcome};
use catalogue_core::runtime::{format_elapsed, progress_bar, setup_logging, setup_thread_pool};
use catalogue_core::table::write_rows_to_path;
use clap::Parser;
use log::{error, info, warn};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "Catalogue Edition Record Fetcher")]
#[command(about = "Fetch edition detail pages for a list of IDs and flatten them into one CSV")]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "out/ids.json", help = "JSON list of edition IDs")]
    input: PathBuf,

    #[arg(short, long, default_value = "out/records.csv", help = "Output CSV file")]
    output: PathBuf,

    #[arg(long, default_value = "out/failed_ids.txt", help = "Where to list IDs that could not be fetched")]
    failed_output: PathBuf,

    #[arg(short, long, default_value = "16", help = "Number of worker threads (0 for auto)")]
    threads: usize,

    #[arg(long, help = "Only fetch the first N IDs")]
    limit: Option<usize>,

    #[arg(long, default_value = DEFAULT_CATALOGUE_URL, help = "Catalogue base URL")]
    base_url: String,

    #[arg(long, default_value = "60", help = "HTTP request timeout in seconds")]
    timeout: u64,

    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
}

fn print_final_summary(start_time: Instant, outcome: &FetchOutcome, ids_count: usize, cli: &Cli) {
    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    info!("IDs requested: {}", ids_count);
    info!("Records flattened: {}", outcome.stats.records_ok);
    info!("Records lost (no digitisation, no copy): {}", outcome.stats.lost_records);
    info!("Rows written: {}", outcome.stats.rows);
    if outcome.stats.records_failed > 0 {
        warn!("Records that could not be fetched: {}", outcome.stats.records_failed);
        for id in outcome.failed_ids.iter().take(10) {
            warn!("  - {}", id);
        }
        if outcome.failed_ids.len() > 10 {
            warn!("  ... (and {} more)", outcome.failed_ids.len() - 10);
        }
    }
    if outcome.stats.records_rejected > 0 {
        error!("Records with unknown roles: {}", outcome.stats.records_rejected);
        for (id, e) in outcome.vocabulary_errors.iter().take(10) {
            error!("  - {}: {}", id, e);
        }
        if outcome.vocabulary_errors.len() > 10 {
            error!("  ... (and {} more)", outcome.vocabulary_errors.len() - 10);
        }
    }
    info!("Output written to: {}", cli.output.display());
    info!("-------------------------------------------------------");
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;
    info!("Starting edition record fetch");

    let mut ids = read_ids(&cli.input)
        .with_context(|| format!("Failed to load IDs from {}", cli.input.display()))?;
    if let Some(limit) = cli.limit {
        ids.truncate(limit);
    }
    info!("Loaded {} IDs", ids.len());

    if ids.is_empty() {
        warn!("No IDs to fetch. Exiting.");
        return Ok(());
    }

    let num_threads = setup_thread_pool(cli.threads)?;

    let config = CatalogueConfig {
        base_url: cli.base_url.clone(),
        timeout: Duration::from_secs(cli.timeout),
    };
    let client = CatalogueClient::new(config)?;

    let progress = progress_bar(ids.len() as u64)?;
    progress.set_message("Processing records...");
    let outcome = run_fetch_pipeline(&client, &ids, num_threads, &progress)?;
    progress.finish_with_message(format!(
        "Processing finished. {} records OK, {} failed, {} rejected.",
        outcome.stats.records_ok, outcome.stats.records_failed, outcome.stats.records_rejected
    ));

    info!("Writing {} entries to {}", outcome.rows.len(), cli.output.display());
    write_rows_to_path(&cli.output, &outcome.rows)?;

    if !outcome.failed_ids.is_empty() {
        let written = write_lines(&cli.failed_output, &outcome.failed_ids)?;
        info!("Listed {} failed IDs in {}", written, cli.failed_output.display());
    }

    print_final_summary(start_time, &outcome, ids.len(), &cli);

    if !outcome.vocabulary_errors.is_empty() {
        let roles: BTreeSet<String> = outcome
            .vocabulary_errors
            .iter()
            .map(|(_, e)| e.to_string())
            .collect();
        bail!(
            "{} records use roles missing from the role table:\n - {}",
            outcome.vocabulary_errors.len(),
            roles.into_iter().collect::<Vec<_>>().join("\n - ")
        );
    }

    Ok(())
}
