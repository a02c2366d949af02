//! Minimal Zotero web API (v3) client: list a collection, read an item,
//! patch an item's `extra` and `relations`.

use log::debug;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::config::ZoteroConfig;
use crate::http::build_client;

pub const RELATION_PREDICATE: &str = "dc:relation";
const API_VERSION: &str = "3";

#[derive(Error, Debug)]
pub enum ZoteroError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Zotero API returned {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("Item {0} was modified remotely since it was read")]
    VersionConflict(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ZoteroItem {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    pub data: ItemData,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ItemData {
    #[serde(default, deserialize_with = "null_as_default")]
    pub extra: String,
    /// Zotero sends `{}` for an item without relations, but older
    /// libraries may hold `[]`.
    #[serde(default, deserialize_with = "object_or_empty")]
    pub relations: Map<String, Value>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn object_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

impl ItemData {
    /// Targets of `dc:relation`, which Zotero stores as a string for a
    /// single relation and an array otherwise.
    pub fn related(&self) -> Vec<&str> {
        match self.relations.get(RELATION_PREDICATE) {
            Some(Value::String(target)) => vec![target.as_str()],
            Some(Value::Array(targets)) => targets.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Replaces all relations with `dc:relation` to `targets`.
    pub fn set_related(&mut self, targets: Vec<String>) {
        self.relations = Map::new();
        self.relations.insert(
            RELATION_PREDICATE.to_string(),
            Value::Array(targets.into_iter().map(Value::String).collect()),
        );
    }
}

/// The subset of the Zotero API the reconciliation needs.
pub trait ReferenceLibrary: Sync {
    fn collection_items(
        &self,
        collection_key: &str,
        item_type: &str,
        start: usize,
        limit: usize,
    ) -> Result<Vec<ZoteroItem>, ZoteroError>;

    fn item(&self, key: &str) -> Result<ZoteroItem, ZoteroError>;

    /// Writes back `extra` and `relations`, guarded by the item version.
    fn update_item(&self, item: &ZoteroItem) -> Result<(), ZoteroError>;
}

pub struct ZoteroClient {
    http: Client,
    config: ZoteroConfig,
}

impl ZoteroClient {
    pub fn new(config: ZoteroConfig) -> Result<Self, ZoteroError> {
        let http = build_client(config.timeout)?;
        Ok(Self { http, config })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Zotero-API-Key", &self.config.api_key)
            .header("Zotero-API-Version", API_VERSION)
    }

    fn check(response: Response) -> Result<Response, ZoteroError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().unwrap_or_default();
        Err(ZoteroError::Status { status: status.as_u16(), url, body })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ZoteroError> {
        let url = format!("{}{}", self.config.library_url(), path);
        debug!("GET {}", url);
        let response = self.authorized(self.http.get(&url).query(query)).send()?;
        Ok(Self::check(response)?.json()?)
    }
}

impl ReferenceLibrary for ZoteroClient {
    fn collection_items(
        &self,
        collection_key: &str,
        item_type: &str,
        start: usize,
        limit: usize,
    ) -> Result<Vec<ZoteroItem>, ZoteroError> {
        self.get_json(
            &format!("/collections/{}/items", collection_key),
            &[
                ("itemType", item_type.to_string()),
                ("start", start.to_string()),
                ("limit", limit.to_string()),
                ("format", "json".to_string()),
            ],
        )
    }

    fn item(&self, key: &str) -> Result<ZoteroItem, ZoteroError> {
        self.get_json(&format!("/items/{}", key), &[("format", "json".to_string())])
    }

    fn update_item(&self, item: &ZoteroItem) -> Result<(), ZoteroError> {
        let url = format!("{}/items/{}", self.config.library_url(), item.key);
        debug!("PATCH {} (version {})", url, item.version);
        let body = json!({
            "extra": item.data.extra,
            "relations": item.data.relations,
        });
        let response = self
            .authorized(self.http.patch(&url))
            .header("If-Unmodified-Since-Version", item.version.to_string())
            .json(&body)
            .send()?;
        if response.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(ZoteroError::VersionConflict(item.key.clone()));
        }
        Self::check(response)?;
        Ok(())
    }
}
