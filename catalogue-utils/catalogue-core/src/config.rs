use std::fmt;
use std::time::Duration;

use clap::ValueEnum;

pub const DEFAULT_CATALOGUE_URL: &str = "https://www.ustc.ac.uk";
pub const DEFAULT_SUBJECT: &str = "Mathematics";
pub const DEFAULT_ZOTERO_API_URL: &str = "https://api.zotero.org";
pub const DEFAULT_COLLECTION_KEY: &str = "3WTMLSGR";
pub const USER_AGENT: &str = concat!("catalogue-utils/", env!("CARGO_PKG_VERSION"));

/// Where and how to reach the catalogue website.
#[derive(Debug, Clone)]
pub struct CatalogueConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl CatalogueConfig {
    pub fn search_url(&self) -> String {
        format!("{}/explore", self.base_url.trim_end_matches('/'))
    }

    pub fn edition_url(&self, id: &str) -> String {
        format!("{}/editions/{}", self.base_url.trim_end_matches('/'), id)
    }
}

impl Default for CatalogueConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CATALOGUE_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LibraryType {
    User,
    Group,
}

impl LibraryType {
    /// Path segment used by the Zotero web API and item URIs.
    pub fn path_segment(self) -> &'static str {
        match self {
            LibraryType::User => "users",
            LibraryType::Group => "groups",
        }
    }
}

/// Credentials and target collection for the Zotero web API.
#[derive(Clone)]
pub struct ZoteroConfig {
    pub api_url: String,
    pub api_key: String,
    pub library_id: String,
    pub library_type: LibraryType,
    pub collection_key: String,
    pub timeout: Duration,
}

impl ZoteroConfig {
    /// `{api}/{users|groups}/{id}`
    pub fn library_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.api_url.trim_end_matches('/'),
            self.library_type.path_segment(),
            self.library_id
        )
    }
}

impl fmt::Debug for ZoteroConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoteroConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("library_id", &self.library_id)
            .field("library_type", &self.library_type)
            .field("collection_key", &self.collection_key)
            .field("timeout", &self.timeout)
            .finish()
    }
}
