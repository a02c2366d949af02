use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::{DashMap, DashSet};
use indicatif::ProgressBar;
use log::{debug, error, info};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::catalogue::EditionSource;
use crate::edition::FlattenError;
use crate::id::CatalogueId;
use crate::page::parse_edition_page;
use crate::table::Row;

enum RecordError {
    /// Network or page problems; the record is skipped.
    Fetch(anyhow::Error),
    /// The record uses vocabulary the flattener does not know.
    Vocabulary(FlattenError),
}

fn process_id<S: EditionSource + ?Sized>(source: &S, id: &CatalogueId) -> Result<Vec<Row>, RecordError> {
    let html = source.edition_page(id).map_err(RecordError::Fetch)?;
    let record = parse_edition_page(&html).map_err(|e| RecordError::Fetch(e.into()))?;
    record.flatten().map_err(RecordError::Vocabulary)
}

struct IncrementalStats {
    records_ok: AtomicUsize,
    rows_emitted: AtomicUsize,
    lost_records: AtomicUsize,
    failed_ids: DashSet<CatalogueId>,
    vocabulary_errors: DashMap<CatalogueId, FlattenError>,
}

impl IncrementalStats {
    fn new() -> Self {
        Self {
            records_ok: AtomicUsize::new(0),
            rows_emitted: AtomicUsize::new(0),
            lost_records: AtomicUsize::new(0),
            failed_ids: DashSet::new(),
            vocabulary_errors: DashMap::new(),
        }
    }

    fn record_rows(&self, rows: &[Row]) {
        self.records_ok.fetch_add(1, Ordering::Relaxed);
        self.rows_emitted.fetch_add(rows.len(), Ordering::Relaxed);
        if rows.iter().any(|row| row.get("is_lost").and_then(|v| v.as_bool()) == Some(true)) {
            self.lost_records.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub records_ok: usize,
    /// Pages that could not be fetched or decoded.
    pub records_failed: usize,
    /// Records with a role missing from the role table.
    pub records_rejected: usize,
    pub rows: usize,
    pub lost_records: usize,
}

#[derive(Debug)]
pub struct FetchOutcome {
    /// In completion order.
    pub rows: Vec<Row>,
    pub stats: FetchStats,
    /// Sorted.
    pub failed_ids: Vec<CatalogueId>,
    /// Sorted by id.
    pub vocabulary_errors: Vec<(CatalogueId, FlattenError)>,
}

/// Fetches and flattens every id on the rayon pool. Rows are handed to a
/// collector thread as each record completes.
pub fn run_fetch_pipeline<S: EditionSource + ?Sized>(
    source: &S,
    ids: &[CatalogueId],
    num_threads: usize,
    progress: &ProgressBar,
) -> Result<FetchOutcome> {
    let stats = IncrementalStats::new();

    let channel_capacity = (num_threads * 4).max(8);
    let (row_sender, row_receiver): (Sender<Vec<Row>>, Receiver<Vec<Row>>) = bounded(channel_capacity);
    debug!("Using row channel with capacity: {}", channel_capacity);

    let collector = thread::spawn(move || -> Vec<Row> {
        let mut all_rows = Vec::new();
        for rows in row_receiver {
            all_rows.extend(rows);
        }
        all_rows
    });

    info!("Starting parallel record processing for {} IDs...", ids.len());
    ids.par_iter().for_each_with(row_sender, |sender, id| {
        match process_id(source, id) {
            Ok(rows) => {
                stats.record_rows(&rows);
                progress.set_message(format!("OK: {} ({} rows)", id, rows.len()));
                if let Err(e) = sender.send(rows) {
                    error!("Row collector hung up while sending record {}: {}", id, e);
                }
            }
            Err(RecordError::Fetch(e)) => {
                error!("Exception processing ID {}: {:#}", id, e);
                stats.failed_ids.insert(id.clone());
                progress.set_message(format!("ERR: {}", id));
            }
            Err(RecordError::Vocabulary(e)) => {
                error!("Record {} cannot be flattened: {}", id, e);
                stats.vocabulary_errors.insert(id.clone(), e);
            }
        }
        progress.inc(1);
    });

    let rows = collector
        .join()
        .map_err(|e| anyhow!("Row collector thread panicked: {:?}", e))?;

    let mut failed_ids: Vec<CatalogueId> = stats.failed_ids.into_iter().collect();
    failed_ids.sort_unstable();

    let mut vocabulary_errors: Vec<(CatalogueId, FlattenError)> = stats.vocabulary_errors.into_iter().collect();
    vocabulary_errors.sort_by(|a, b| a.0.cmp(&b.0));

    let fetch_stats = FetchStats {
        records_ok: stats.records_ok.into_inner(),
        records_failed: failed_ids.len(),
        records_rejected: vocabulary_errors.len(),
        rows: stats.rows_emitted.into_inner(),
        lost_records: stats.lost_records.into_inner(),
    };

    Ok(FetchOutcome { rows, stats: fetch_stats, failed_ids, vocabulary_errors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::fixtures::page_html;
    use serde_json::json;
    use std::collections::HashMap;

    struct FakeEditions {
        pages: HashMap<String, String>,
    }

    impl EditionSource for FakeEditions {
        fn edition_page(&self, id: &CatalogueId) -> Result<String> {
            self.pages
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| anyhow!("Status code 404 for {}", id))
        }
    }

    fn ids(ids: &[&str]) -> Vec<CatalogueId> {
        ids.iter().map(|id| CatalogueId::from(*id)).collect()
    }

    fn fake() -> FakeEditions {
        let mut pages = HashMap::new();
        pages.insert(
            "1".to_string(),
            page_html(&json!({ "props": {
                "edition": { "std_title": "Lost book" },
                "digitisations": [],
                "copies": []
            } })),
        );
        pages.insert(
            "2".to_string(),
            page_html(&json!({ "props": {
                "edition": { "std_title": "Held book", "author_1": "Amy", "role_1": "Editor" },
                "digitisations": [{ "url": "https://a" }],
                "copies": [{ "name": "BL", "city": "London", "country": "UK", "shelfmark": "C.1" }]
            } })),
        );
        pages.insert(
            "3".to_string(),
            page_html(&json!({ "props": {
                "edition": { "author_1": "X", "role_1": "Printer" }
            } })),
        );
        pages.insert("4".to_string(), "<html><body>Server error</body></html>".to_string());
        FakeEditions { pages }
    }

    #[test]
    fn test_pipeline_collects_rows_and_failures() {
        let outcome = run_fetch_pipeline(&fake(), &ids(&["1", "2", "3", "4", "5"]), 4, &ProgressBar::hidden()).unwrap();

        assert_eq!(outcome.rows.len(), 3);
        assert_eq!(
            outcome.stats,
            FetchStats { records_ok: 2, records_failed: 2, records_rejected: 1, rows: 3, lost_records: 1 }
        );
        assert_eq!(outcome.failed_ids, ids(&["4", "5"]));
        assert_eq!(outcome.vocabulary_errors.len(), outcome.stats.records_rejected);
        assert_eq!(outcome.vocabulary_errors[0].0, CatalogueId::from("3"));
        assert!(!outcome.failed_ids.contains(&CatalogueId::from("3")));

        let editors: Vec<_> = outcome.rows.iter().filter(|row| row.get("editor") == Some(&json!("Amy"))).collect();
        assert_eq!(editors.len(), 2);
    }

    #[test]
    fn test_pipeline_with_no_ids() {
        let outcome = run_fetch_pipeline(&fake(), &[], 4, &ProgressBar::hidden()).unwrap();
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.stats, FetchStats::default());
    }
}
