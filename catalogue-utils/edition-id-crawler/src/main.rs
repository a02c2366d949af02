use anyhow::Result;
use catalogue_core::catalogue::CatalogueClient;
use catalogue_core::checkpoint::write_ids;
use catalogue_core::config::{CatalogueConfig, DEFAULT_CATALOGUE_URL, DEFAULT_SUBJECT};
use catalogue_core::crawl::{crawl_ids, CrawlOutcome};
use catalogue_core::runtime::{format_elapsed, setup_logging, spinner};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "Catalogue Edition ID Crawler")]
#[command(about = "Page through a catalogue subject search and collect the edition numbers it lists")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = DEFAULT_CATALOGUE_URL, help = "Catalogue base URL")]
    base_url: String,

    #[arg(short, long, default_value = DEFAULT_SUBJECT, help = "Subject facet to search (fqs)")]
    subject: String,

    #[arg(short, long, default_value = "out/ids.json", help = "Output JSON file for the ID list")]
    output: PathBuf,

    #[arg(long, help = "Stop after this many search pages")]
    max_pages: Option<u32>,

    #[arg(long, default_value = "60", help = "HTTP request timeout in seconds")]
    timeout: u64,

    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
}

fn print_final_summary(start_time: Instant, outcome: &CrawlOutcome, cli: &Cli) {
    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    info!("Search pages fetched: {}", outcome.pages_fetched);
    info!("Stopped because: {}", outcome.stop);
    info!("IDs collected (with duplicates): {}", outcome.ids_seen);
    info!("Total document IDs found: {}", outcome.ids.len());
    info!("Output written to: {}", cli.output.display());
    info!("-------------------------------------------------------");
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;
    info!("Starting edition ID crawl for subject '{}'", cli.subject);

    let config = CatalogueConfig {
        base_url: cli.base_url.clone(),
        timeout: Duration::from_secs(cli.timeout),
    };
    let client = CatalogueClient::new(config)?;

    let progress = spinner("pages")?;
    let outcome = crawl_ids(&client, &cli.subject, cli.max_pages, &progress);
    progress.finish_with_message(format!("{} unique IDs", outcome.ids.len()));

    if outcome.ids.is_empty() {
        warn!("No IDs collected; writing an empty list.");
    }
    write_ids(&cli.output, &outcome.ids)?;

    print_final_summary(start_time, &outcome, &cli);
    Ok(())
}
