//! Reconciliation of Zotero items that describe the same catalogue record.
//!
//! Items carry their catalogue number in the free-text `extra` note
//! (`USTC ID: 75104`). Items sharing a number form a cluster, and every
//! member of a cluster is linked to every other one through `dc:relation`.

use anyhow::{Context, Result};
use dashmap::DashSet;
use indicatif::ProgressBar;
use log::{error, info, warn};
use rayon::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::checkpoint::{read_clusters, write_clusters, Clusters};
use crate::config::LibraryType;
use crate::id::CatalogueId;
use crate::zotero::{ReferenceLibrary, ZoteroError, ZoteroItem};

pub const CATALOGUE_ID_MARKER: &str = "USTC ID: ";
pub const ITEM_TYPE: &str = "book";
pub const PAGE_LIMIT: usize = 100;

const NOT_DIGITISED: &str = "Digitised: False";
const NO_COPIES: &str = "Has copies: False";
const LOST_TRUE: &str = "Lost: true";
const LOST_FALSE: &str = "Lost: false";

/// Catalogue number from an `extra` note: the text after the last
/// `USTC ID: ` marker, up to the end of that line.
pub fn parse_catalogue_id(extra: &str) -> Option<CatalogueId> {
    let (_, tail) = extra.rsplit_once(CATALOGUE_ID_MARKER)?;
    let id = tail.lines().next().unwrap_or_default().trim();
    if id.is_empty() {
        None
    } else {
        Some(CatalogueId::from(id))
    }
}

/// Neither digitised nor held anywhere, according to the note.
pub fn is_lost(extra: &str) -> bool {
    extra.contains(NOT_DIGITISED) && extra.contains(NO_COPIES)
}

/// Rewrites the `Lost:` flag to agree with [`is_lost`]. `None` when the
/// note already agrees (or carries no flag).
pub fn sync_lost_flag(extra: &str) -> Option<String> {
    let (stale, fresh) = if is_lost(extra) {
        (LOST_FALSE, LOST_TRUE)
    } else {
        (LOST_TRUE, LOST_FALSE)
    };
    extra.contains(stale).then(|| extra.replace(stale, fresh))
}

/// How a relation target is written into `dc:relation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationFormat {
    /// `http://zotero.org/{users|groups}/{id}/items/{key}`, what the Zotero
    /// clients write themselves.
    ZoteroUri { library_type: LibraryType, library_id: String },
    /// `#item_{key}`
    ItemFragment,
}

impl RelationFormat {
    pub fn target(&self, key: &str) -> String {
        match self {
            RelationFormat::ZoteroUri { library_type, library_id } => format!(
                "http://zotero.org/{}/{}/items/{}",
                library_type.path_segment(),
                library_id,
                key
            ),
            RelationFormat::ItemFragment => format!("#item_{}", key),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub clusters: Clusters,
    pub items_seen: usize,
    pub lost_flags_updated: usize,
    pub failed_items: Vec<String>,
}

fn process_item<L: ReferenceLibrary + ?Sized>(
    library: &L,
    item: &mut ZoteroItem,
    dry_run: bool,
) -> Result<(Option<CatalogueId>, bool), ZoteroError> {
    let Some(catalogue_id) = parse_catalogue_id(&item.data.extra) else {
        return Ok((None, false));
    };

    let Some(extra) = sync_lost_flag(&item.data.extra) else {
        return Ok((Some(catalogue_id), false));
    };

    info!(
        "USTC ID: {} (key={}) lost flag set to {}",
        catalogue_id,
        item.key,
        is_lost(&extra)
    );
    item.data.extra = extra;
    if !dry_run {
        library.update_item(item)?;
    }
    Ok((Some(catalogue_id), true))
}

/// Reads every book in the collection, fixes stale lost flags and groups
/// the item keys by catalogue number. Failing items are recorded and
/// skipped; a failing page read aborts the scan.
pub fn scan_collection<L: ReferenceLibrary + ?Sized>(
    library: &L,
    collection_key: &str,
    dry_run: bool,
    progress: &ProgressBar,
) -> Result<ScanOutcome, ZoteroError> {
    let mut outcome = ScanOutcome::default();
    let mut start = 0;

    loop {
        info!("Fetching items from {} to {}", start, start + PAGE_LIMIT);
        let batch = library.collection_items(collection_key, ITEM_TYPE, start, PAGE_LIMIT)?;
        if batch.is_empty() {
            break;
        }

        for mut item in batch {
            outcome.items_seen += 1;
            progress.inc(1);
            match process_item(library, &mut item, dry_run) {
                Ok((Some(catalogue_id), flag_updated)) => {
                    if flag_updated {
                        outcome.lost_flags_updated += 1;
                    }
                    outcome.clusters.entry(catalogue_id).or_default().push(item.key);
                }
                Ok((None, _)) => {}
                Err(e) => {
                    error!("Failed to process item {}: {}", item.key, e);
                    outcome.failed_items.push(item.key);
                }
            }
        }

        start += PAGE_LIMIT;
    }

    Ok(outcome)
}

/// Where a run got its clusters from.
#[derive(Debug)]
pub enum ClusterSource {
    Checkpoint(Clusters),
    Scan(ScanOutcome),
}

impl ClusterSource {
    pub fn clusters(&self) -> &Clusters {
        match self {
            ClusterSource::Checkpoint(clusters) => clusters,
            ClusterSource::Scan(outcome) => &outcome.clusters,
        }
    }
}

/// Clusters from a non-empty checkpoint, or from a fresh scan of the
/// collection. The scan result is saved as the new checkpoint only when
/// every item was read, so items that failed are picked up by the next run.
pub fn load_or_scan_clusters<L: ReferenceLibrary + ?Sized>(
    library: &L,
    collection_key: &str,
    checkpoint: &Path,
    dry_run: bool,
    progress: &ProgressBar,
) -> Result<ClusterSource> {
    if let Some(clusters) = read_clusters(checkpoint)? {
        if !clusters.is_empty() {
            return Ok(ClusterSource::Checkpoint(clusters));
        }
        info!("Checkpoint {} is empty; rescanning", checkpoint.display());
    }

    let outcome = scan_collection(library, collection_key, dry_run, progress)
        .with_context(|| format!("Failed to read collection {}", collection_key))?;

    if dry_run {
        info!("Dry run: checkpoint {} left untouched", checkpoint.display());
    } else if !outcome.failed_items.is_empty() {
        warn!(
            "{} items failed during the scan; checkpoint {} not saved",
            outcome.failed_items.len(),
            checkpoint.display()
        );
    } else {
        write_clusters(checkpoint, &outcome.clusters)?;
    }

    Ok(ClusterSource::Scan(outcome))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub updated: usize,
    pub already_linked: usize,
}

/// Points every member of a cluster at all the other members. Members that
/// already hold at least `len - 1` relations are left alone, so relinking a
/// linked cluster writes nothing.
pub fn link_cluster<L: ReferenceLibrary + ?Sized>(
    library: &L,
    keys: &[String],
    format: &RelationFormat,
    dry_run: bool,
) -> Result<LinkStats, ZoteroError> {
    let mut stats = LinkStats::default();
    if keys.len() < 2 {
        return Ok(stats);
    }

    for key in keys {
        let mut item = library.item(key)?;
        if item.data.related().len() >= keys.len() - 1 {
            stats.already_linked += 1;
            continue;
        }

        let targets = keys
            .iter()
            .filter(|other| *other != key)
            .map(|other| format.target(other))
            .collect();
        item.data.set_related(targets);
        if !dry_run {
            library.update_item(&item)?;
        }
        stats.updated += 1;
    }

    Ok(stats)
}

#[derive(Debug, Default)]
pub struct LinkOutcome {
    pub clusters_linked: usize,
    pub items_updated: usize,
    pub items_already_linked: usize,
    pub failed_clusters: Vec<CatalogueId>,
}

/// Links all clusters with two or more members, in parallel. Clusters are
/// disjoint, so no item is written by two workers.
pub fn link_clusters<L: ReferenceLibrary + ?Sized>(
    library: &L,
    clusters: &Clusters,
    format: &RelationFormat,
    dry_run: bool,
    progress: &ProgressBar,
) -> LinkOutcome {
    let clusters_linked = AtomicUsize::new(0);
    let items_updated = AtomicUsize::new(0);
    let items_already_linked = AtomicUsize::new(0);
    let failed_clusters: DashSet<CatalogueId> = DashSet::new();

    let linkable: Vec<(&CatalogueId, &Vec<String>)> =
        clusters.iter().filter(|(_, keys)| keys.len() >= 2).collect();
    progress.set_length(linkable.len() as u64);

    linkable.par_iter().for_each(|(catalogue_id, keys)| {
        match link_cluster(library, keys, format, dry_run) {
            Ok(stats) => {
                clusters_linked.fetch_add(1, Ordering::Relaxed);
                items_updated.fetch_add(stats.updated, Ordering::Relaxed);
                items_already_linked.fetch_add(stats.already_linked, Ordering::Relaxed);
            }
            Err(e) => {
                error!("Error updating cluster {} {:?}: {}", catalogue_id, keys, e);
                failed_clusters.insert((*catalogue_id).clone());
            }
        }
        progress.inc(1);
    });

    let mut failed_clusters: Vec<CatalogueId> = failed_clusters.into_iter().collect();
    failed_clusters.sort_unstable();
    if !failed_clusters.is_empty() {
        warn!("{} clusters could not be linked", failed_clusters.len());
    }

    LinkOutcome {
        clusters_linked: clusters_linked.into_inner(),
        items_updated: items_updated.into_inner(),
        items_already_linked: items_already_linked.into_inner(),
        failed_clusters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zotero::ItemData;
    use rstest::rstest;
    use std::collections::{BTreeMap, HashSet};
    use std::fs;
    use std::sync::Mutex;

    /// In-memory library; bumps versions on write like the real API.
    #[derive(Default)]
    struct FakeLibrary {
        items: Mutex<BTreeMap<String, ZoteroItem>>,
        writes: AtomicUsize,
        listings: AtomicUsize,
        broken: HashSet<String>,
    }

    impl FakeLibrary {
        fn with_items(items: Vec<ZoteroItem>) -> Self {
            Self {
                items: Mutex::new(items.into_iter().map(|item| (item.key.clone(), item)).collect()),
                ..Default::default()
            }
        }

        fn get(&self, key: &str) -> ZoteroItem {
            self.items.lock().unwrap()[key].clone()
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl ReferenceLibrary for FakeLibrary {
        fn collection_items(
            &self,
            _collection_key: &str,
            _item_type: &str,
            start: usize,
            limit: usize,
        ) -> Result<Vec<ZoteroItem>, ZoteroError> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            Ok(self.items.lock().unwrap().values().skip(start).take(limit).cloned().collect())
        }

        fn item(&self, key: &str) -> Result<ZoteroItem, ZoteroError> {
            self.items.lock().unwrap().get(key).cloned().ok_or_else(|| ZoteroError::Status {
                status: 404,
                url: format!("/items/{}", key),
                body: "Not found".to_string(),
            })
        }

        fn update_item(&self, item: &ZoteroItem) -> Result<(), ZoteroError> {
            if self.broken.contains(&item.key) {
                return Err(ZoteroError::VersionConflict(item.key.clone()));
            }
            let mut stored = item.clone();
            stored.version += 1;
            self.items.lock().unwrap().insert(item.key.clone(), stored);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn item(key: &str, extra: &str) -> ZoteroItem {
        ZoteroItem {
            key: key.to_string(),
            version: 1,
            data: ItemData { extra: extra.to_string(), ..Default::default() },
        }
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[rstest]
    #[case("USTC ID: 75104", Some("75104"))]
    #[case("Digitised: True\nUSTC ID: 75104\nHas copies: True", Some("75104"))]
    #[case("USTC ID: 1\nUSTC ID: 2\nLost: false", Some("2"))]
    #[case("USTC ID: 75104\r\nLost: false", Some("75104"))]
    #[case("USTC ID: \nLost: false", None)]
    #[case("Lost: false", None)]
    #[case("", None)]
    fn test_parse_catalogue_id(#[case] extra: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_catalogue_id(extra), expected.map(CatalogueId::from));
    }

    #[rstest]
    #[case("Digitised: False\nHas copies: False\nLost: false", Some("Digitised: False\nHas copies: False\nLost: true"))]
    #[case("Digitised: True\nHas copies: False\nLost: true", Some("Digitised: True\nHas copies: False\nLost: false"))]
    #[case("Digitised: False\nHas copies: False\nLost: true", None)]
    #[case("Digitised: True\nHas copies: True\nLost: false", None)]
    #[case("Digitised: False\nHas copies: False", None)]
    fn test_sync_lost_flag(#[case] extra: &str, #[case] expected: Option<&str>) {
        assert_eq!(sync_lost_flag(extra).as_deref(), expected);
    }

    #[test]
    fn test_relation_formats() {
        let uri = RelationFormat::ZoteroUri { library_type: LibraryType::Group, library_id: "5531".to_string() };
        assert_eq!(uri.target("ABCD1234"), "http://zotero.org/groups/5531/items/ABCD1234");
        assert_eq!(RelationFormat::ItemFragment.target("ABCD1234"), "#item_ABCD1234");
    }

    #[test]
    fn test_scan_groups_by_catalogue_id_across_pages() {
        let mut items: Vec<ZoteroItem> = (0..PAGE_LIMIT + 5)
            .map(|i| item(&format!("K{:04}", i), &format!("USTC ID: {}", i % 3)))
            .collect();
        items.push(item("NOID", "Some other note"));
        let library = FakeLibrary::with_items(items);

        let outcome = scan_collection(&library, "COLL", false, &ProgressBar::hidden()).unwrap();

        assert_eq!(outcome.items_seen, PAGE_LIMIT + 6);
        assert_eq!(outcome.clusters.len(), 3);
        let total: usize = outcome.clusters.values().map(Vec::len).sum();
        assert_eq!(total, PAGE_LIMIT + 5);
        assert!(outcome.failed_items.is_empty());
        assert_eq!(library.writes(), 0);
    }

    #[test]
    fn test_scan_fixes_lost_flags() {
        let library = FakeLibrary::with_items(vec![
            item("A", "USTC ID: 1\nDigitised: True\nHas copies: False\nLost: true"),
            item("B", "USTC ID: 1\nDigitised: False\nHas copies: False\nLost: true"),
        ]);

        let outcome = scan_collection(&library, "COLL", false, &ProgressBar::hidden()).unwrap();

        assert_eq!(outcome.lost_flags_updated, 1);
        assert_eq!(library.writes(), 1);
        assert!(library.get("A").data.extra.ends_with("Lost: false"));
        assert!(library.get("B").data.extra.ends_with("Lost: true"));
    }

    #[test]
    fn test_scan_dry_run_writes_nothing() {
        let library = FakeLibrary::with_items(vec![item("A", "USTC ID: 1\nLost: true")]);
        let outcome = scan_collection(&library, "COLL", true, &ProgressBar::hidden()).unwrap();
        assert_eq!(outcome.lost_flags_updated, 1);
        assert_eq!(library.writes(), 0);
    }

    #[test]
    fn test_scan_records_failed_items() {
        let mut library = FakeLibrary::with_items(vec![
            item("A", "USTC ID: 1\nLost: true"),
            item("B", "USTC ID: 1\nLost: false"),
        ]);
        library.broken.insert("A".to_string());

        let outcome = scan_collection(&library, "COLL", false, &ProgressBar::hidden()).unwrap();

        assert_eq!(outcome.failed_items, vec!["A".to_string()]);
        assert_eq!(outcome.clusters[&CatalogueId::from("1")], keys(&["B"]));
    }

    #[test]
    fn test_link_cluster_is_reciprocal_and_idempotent() {
        let library = FakeLibrary::with_items(vec![
            item("A", "USTC ID: 1"),
            item("B", "USTC ID: 1"),
            item("C", "USTC ID: 1"),
        ]);
        let cluster = keys(&["A", "B", "C"]);

        let first = link_cluster(&library, &cluster, &RelationFormat::ItemFragment, false).unwrap();
        assert_eq!(first, LinkStats { updated: 3, already_linked: 0 });
        assert_eq!(library.get("A").data.related(), vec!["#item_B", "#item_C"]);
        assert_eq!(library.get("B").data.related(), vec!["#item_A", "#item_C"]);
        assert_eq!(library.get("C").data.related(), vec!["#item_A", "#item_B"]);

        let second = link_cluster(&library, &cluster, &RelationFormat::ItemFragment, false).unwrap();
        assert_eq!(second, LinkStats { updated: 0, already_linked: 3 });
        assert_eq!(library.writes(), 3);
    }

    #[test]
    fn test_singletons_are_not_linked() {
        let library = FakeLibrary::with_items(vec![item("A", "USTC ID: 1")]);
        let stats = link_cluster(&library, &keys(&["A"]), &RelationFormat::ItemFragment, false).unwrap();
        assert_eq!(stats, LinkStats::default());
        assert_eq!(library.writes(), 0);
    }

    #[test]
    fn test_link_clusters_reports_failures() {
        let library = FakeLibrary::with_items(vec![
            item("A", "USTC ID: 1"),
            item("B", "USTC ID: 1"),
            item("C", "USTC ID: 2"),
            item("D", "USTC ID: 3"),
        ]);
        let mut clusters = Clusters::new();
        clusters.insert(CatalogueId::from("1"), keys(&["A", "B"]));
        clusters.insert(CatalogueId::from("2"), keys(&["C", "MISSING"]));
        clusters.insert(CatalogueId::from("3"), keys(&["D"]));

        let format = RelationFormat::ZoteroUri { library_type: LibraryType::User, library_id: "7".to_string() };
        let outcome = link_clusters(&library, &clusters, &format, false, &ProgressBar::hidden());

        assert_eq!(outcome.clusters_linked, 1);
        assert_eq!(outcome.items_updated, 2);
        assert_eq!(outcome.failed_clusters, vec![CatalogueId::from("2")]);
        assert_eq!(library.get("A").data.related(), vec!["http://zotero.org/users/7/items/B"]);
    }

    #[test]
    fn test_existing_checkpoint_skips_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, r#"{"75104": ["A", "B"]}"#).unwrap();
        let library = FakeLibrary::with_items(vec![item("C", "USTC ID: 9")]);

        let source = load_or_scan_clusters(&library, "COLL", &path, false, &ProgressBar::hidden()).unwrap();

        assert!(matches!(source, ClusterSource::Checkpoint(_)));
        assert_eq!(source.clusters()[&CatalogueId::from("75104")], keys(&["A", "B"]));
        assert_eq!(library.listings.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_checkpoint_is_rescanned_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, "{}").unwrap();
        let library = FakeLibrary::with_items(vec![item("A", "USTC ID: 1"), item("B", "USTC ID: 1")]);

        let source = load_or_scan_clusters(&library, "COLL", &path, false, &ProgressBar::hidden()).unwrap();

        assert!(matches!(source, ClusterSource::Scan(_)));
        assert!(library.listings.load(Ordering::SeqCst) > 0);
        let saved = read_clusters(&path).unwrap().unwrap();
        assert_eq!(saved[&CatalogueId::from("1")], keys(&["A", "B"]));
    }

    #[test]
    fn test_dry_run_writes_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("keys.json");
        let library = FakeLibrary::with_items(vec![item("A", "USTC ID: 1")]);

        let source = load_or_scan_clusters(&library, "COLL", &path, true, &ProgressBar::hidden()).unwrap();

        assert_eq!(source.clusters().len(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_scan_with_failed_items_writes_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let mut library = FakeLibrary::with_items(vec![
            item("A", "USTC ID: 1\nLost: true"),
            item("B", "USTC ID: 1"),
        ]);
        library.broken.insert("A".to_string());

        let source = load_or_scan_clusters(&library, "COLL", &path, false, &ProgressBar::hidden()).unwrap();
        let ClusterSource::Scan(outcome) = source else {
            panic!("expected a scan");
        };
        assert_eq!(outcome.failed_items, keys(&["A"]));
        assert!(!path.exists());

        // Once the item reads cleanly the next run scans again and saves it.
        library.broken.clear();
        let source = load_or_scan_clusters(&library, "COLL", &path, false, &ProgressBar::hidden()).unwrap();
        assert!(matches!(source, ClusterSource::Scan(_)));
        assert_eq!(read_clusters(&path).unwrap().unwrap()[&CatalogueId::from("1")], keys(&["A", "B"]));
    }
}
