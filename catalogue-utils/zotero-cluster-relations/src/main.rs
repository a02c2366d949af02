use anyhow::Result;
use catalogue_core::checkpoint::{write_lines, Clusters};
use catalogue_core::config::{LibraryType, ZoteroConfig, DEFAULT_COLLECTION_KEY, DEFAULT_ZOTERO_API_URL};
use catalogue_core::reconcile::{link_clusters, load_or_scan_clusters, ClusterSource, LinkOutcome, RelationFormat};
use catalogue_core::runtime::{format_elapsed, progress_bar, setup_logging, setup_thread_pool, spinner};
use catalogue_core::zotero::ZoteroClient;
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RelationStyle {
    /// http://zotero.org/{users|groups}/{id}/items/{key}
    ZoteroUri,
    /// #item_{key}
    ItemFragment,
}

#[derive(Parser)]
#[command(name = "Zotero Cluster Relations")]
#[command(about = "Group Zotero items by the catalogue ID in their notes and link each group with dc:relation")]
#[command(version)]
struct Cli {
    #[arg(long, env = "ZOTERO_API_KEY", hide_env_values = true, help = "Zotero API key")]
    api_key: String,

    #[arg(long, env = "ZOTERO_LIBRARY_ID", help = "Zotero library ID")]
    library_id: String,

    #[arg(long, env = "ZOTERO_LIBRARY_TYPE", value_enum, ignore_case = true, help = "Zotero library type")]
    library_type: LibraryType,

    #[arg(short, long, default_value = DEFAULT_COLLECTION_KEY, help = "Collection to reconcile")]
    collection: String,

    #[arg(long, default_value = DEFAULT_ZOTERO_API_URL, help = "Zotero API base URL")]
    api_url: String,

    #[arg(long, default_value = "out/keys.json", help = "Cluster checkpoint; reused when present")]
    checkpoint: PathBuf,

    #[arg(long, default_value = "out/failed_items.txt", help = "Where to list items that failed during the scan")]
    failed_output: PathBuf,

    #[arg(long, value_enum, default_value = "zotero-uri", help = "How relation targets are written")]
    relation_format: RelationStyle,

    #[arg(short, long, default_value = "8", help = "Number of worker threads for linking (0 for auto)")]
    threads: usize,

    #[arg(long, help = "Stop after building the clusters")]
    cluster_only: bool,

    #[arg(long, help = "Report changes without writing to Zotero")]
    dry_run: bool,

    #[arg(long, default_value = "180", help = "HTTP request timeout in seconds")]
    timeout: u64,

    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
}

impl Cli {
    fn zotero_config(&self) -> ZoteroConfig {
        ZoteroConfig {
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            library_id: self.library_id.clone(),
            library_type: self.library_type,
            collection_key: self.collection.clone(),
            timeout: Duration::from_secs(self.timeout),
        }
    }

    fn relation_format(&self) -> RelationFormat {
        match self.relation_format {
            RelationStyle::ZoteroUri => RelationFormat::ZoteroUri {
                library_type: self.library_type,
                library_id: self.library_id.clone(),
            },
            RelationStyle::ItemFragment => RelationFormat::ItemFragment,
        }
    }
}

/// Clusters for this run, reporting on the scan when one was needed.
fn cluster_items(cli: &Cli, client: &ZoteroClient, config: &ZoteroConfig) -> Result<Clusters> {
    let progress = spinner("items")?;
    let source = load_or_scan_clusters(client, &config.collection_key, &cli.checkpoint, cli.dry_run, &progress)?;
    info!("Found {} clusters", source.clusters().len());

    let outcome = match source {
        ClusterSource::Checkpoint(clusters) => {
            progress.finish_and_clear();
            return Ok(clusters);
        }
        ClusterSource::Scan(outcome) => outcome,
    };
    progress.finish_with_message(format!("{} items scanned", outcome.items_seen));

    info!("Items scanned: {}", outcome.items_seen);
    info!("Lost flags corrected: {}", outcome.lost_flags_updated);

    if !outcome.failed_items.is_empty() {
        warn!("{} items failed during the scan", outcome.failed_items.len());
        write_lines(&cli.failed_output, &outcome.failed_items)?;
        info!("Failed item keys listed in {}", cli.failed_output.display());
    }

    Ok(outcome.clusters)
}

fn print_final_summary(start_time: Instant, clusters: &Clusters, outcome: Option<&LinkOutcome>, cli: &Cli) {
    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    info!("Found {} clusters", clusters.len());
    info!(
        "Clusters with more than one item: {}",
        clusters.values().filter(|keys| keys.len() >= 2).count()
    );
    if let Some(outcome) = outcome {
        info!("Clusters linked: {}", outcome.clusters_linked);
        info!("Items updated: {}", outcome.items_updated);
        info!("Items already linked: {}", outcome.items_already_linked);
        if !outcome.failed_clusters.is_empty() {
            warn!("Clusters with errors: {}", outcome.failed_clusters.len());
            for id in outcome.failed_clusters.iter().take(10) {
                warn!("  - {}", id);
            }
            if outcome.failed_clusters.len() > 10 {
                warn!("  ... (and {} more)", outcome.failed_clusters.len() - 10);
            }
        }
    }
    if cli.dry_run {
        info!("Dry run: nothing was written to Zotero");
    }
    info!("-------------------------------------------------------");
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;
    let config = cli.zotero_config();
    info!("Starting Zotero reconciliation for {:?}", config);

    let client = ZoteroClient::new(config.clone())?;
    let clusters = cluster_items(&cli, &client, &config)?;

    if cli.cluster_only {
        print_final_summary(start_time, &clusters, None, &cli);
        return Ok(());
    }

    setup_thread_pool(cli.threads)?;
    let progress = progress_bar(0)?;
    progress.set_message("Linking clusters...");
    let outcome = link_clusters(&client, &clusters, &cli.relation_format(), cli.dry_run, &progress);
    progress.finish_with_message(format!(
        "Linking finished. {} clusters OK, {} errors.",
        outcome.clusters_linked,
        outcome.failed_clusters.len()
    ));

    print_final_summary(start_time, &clusters, Some(&outcome), &cli);
    Ok(())
}
