//! JSON and text files that link the tools together: `ids.json` from the
//! crawler, `keys.json` cluster checkpoints and plain failure lists.

use anyhow::{Context, Result};
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::id::CatalogueId;

/// Zotero item keys grouped by the catalogue id found in their notes.
pub type Clusters = BTreeMap<CatalogueId, Vec<String>>;

fn create_file(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory structure for: {}", path.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file: {}", path.display()))?;
    Ok(BufWriter::new(file))
}

pub fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Malformed JSON in {}", path.display()))
}

/// Pretty JSON with four-space indentation.
pub fn write_json<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    let mut writer = create_file(path)?;
    let mut serializer = Serializer::with_formatter(&mut writer, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

pub fn read_ids<P: AsRef<Path>>(path: P) -> Result<Vec<CatalogueId>> {
    read_json(path)
}

pub fn write_ids<P: AsRef<Path>>(path: P, ids: &[CatalogueId]) -> Result<()> {
    write_json(&path, &ids)?;
    info!("Saved {} IDs to '{}'", ids.len(), path.as_ref().display());
    Ok(())
}

/// `Ok(None)` when no checkpoint exists yet. A checkpoint that exists but
/// does not parse is an error.
pub fn read_clusters<P: AsRef<Path>>(path: P) -> Result<Option<Clusters>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let clusters: Clusters = read_json(path)?;
    info!("Loaded {} clusters from checkpoint {}", clusters.len(), path.display());
    Ok(Some(clusters))
}

pub fn write_clusters<P: AsRef<Path>>(path: P, clusters: &Clusters) -> Result<()> {
    write_json(&path, clusters)?;
    info!("Saved {} clusters to checkpoint {}", clusters.len(), path.as_ref().display());
    Ok(())
}

/// One entry per line.
pub fn write_lines<P, I, T>(path: P, lines: I) -> Result<usize>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = T>,
    T: Display,
{
    let path = path.as_ref();
    let mut writer = create_file(path)?;
    let mut count = 0;
    for line in lines {
        writeln!(writer, "{}", line)?;
        count += 1;
    }
    writer.flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("ids.json");
        let ids = vec![CatalogueId::from("75104"), CatalogueId::from("804919")];

        write_ids(&path, &ids).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "[\n    \"75104\",\n    \"804919\"\n]\n"
        );
        assert_eq!(read_ids(&path).unwrap(), ids);
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_clusters(dir.path().join("keys.json")).unwrap().is_none());
    }

    #[test]
    fn test_malformed_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, "{\"75104\": [").unwrap();
        let err = read_clusters(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Malformed JSON"));
    }

    #[test]
    fn test_clusters_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let mut clusters = Clusters::new();
        clusters.insert(CatalogueId::from("75104"), vec!["ABCD1234".to_string(), "EFGH5678".to_string()]);

        write_clusters(&path, &clusters).unwrap();
        assert_eq!(read_clusters(&path).unwrap(), Some(clusters));
    }

    #[test]
    fn test_write_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_items.txt");
        assert_eq!(write_lines(&path, ["K1", "K2"]).unwrap(), 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), "K1\nK2\n");
    }
}
