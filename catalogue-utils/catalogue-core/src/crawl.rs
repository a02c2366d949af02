use indicatif::ProgressBar;
use log::{error, info, warn};
use std::fmt;

use crate::catalogue::SearchSource;
use crate::id::CatalogueId;
use crate::page::{extract_payload, SearchPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NoIdentifiers,
    LastPage,
    NoPagination,
    RequestFailed,
    MalformedPage,
    PageLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::NoIdentifiers => "page yielded no identifiers",
            StopReason::LastPage => "reached last page based on pagination data",
            StopReason::NoPagination => "no pagination data in page",
            StopReason::RequestFailed => "request failed",
            StopReason::MalformedPage => "page payload could not be extracted",
            StopReason::PageLimit => "page limit reached",
        };
        f.write_str(reason)
    }
}

#[derive(Debug)]
pub struct CrawlOutcome {
    /// Deduplicated, sorted.
    pub ids: Vec<CatalogueId>,
    pub ids_seen: usize,
    pub pages_fetched: u32,
    pub stop: StopReason,
}

/// Walks the search pages for `subject`, 1, 2, ... until the results run out.
pub fn crawl_ids<S: SearchSource + ?Sized>(
    source: &S,
    subject: &str,
    max_pages: Option<u32>,
    progress: &ProgressBar,
) -> CrawlOutcome {
    let mut collected: Vec<CatalogueId> = Vec::new();
    let mut pages_fetched = 0;
    let mut page = 1;

    let stop = loop {
        if max_pages.is_some_and(|max| page > max) {
            break StopReason::PageLimit;
        }

        let html = match source.search_page(subject, page) {
            Ok(html) => html,
            Err(e) => {
                error!("Failed to fetch page {}: {:#}", page, e);
                break StopReason::RequestFailed;
            }
        };

        let payload: SearchPayload = match extract_payload(&html) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Page {}: {}", page, e);
                break StopReason::MalformedPage;
            }
        };

        let ids_on_page = payload.ids();
        if ids_on_page.is_empty() {
            info!("No IDs found in page {} data structure", page);
            break StopReason::NoIdentifiers;
        }

        info!("Page {}: collected {} IDs", page, ids_on_page.len());
        collected.extend(ids_on_page);
        pages_fetched = page;
        progress.inc(1);
        progress.set_message(format!("{} IDs", collected.len()));

        match payload.has_next_page() {
            Some(true) => page += 1,
            Some(false) => {
                info!("Reached last page based on pagination data");
                break StopReason::LastPage;
            }
            None => {
                warn!("Could not find pagination data in JSON");
                break StopReason::NoPagination;
            }
        }
    };

    let ids_seen = collected.len();
    collected.sort_unstable();
    collected.dedup();

    CrawlOutcome { ids: collected, ids_seen, pages_fetched, stop }
}
