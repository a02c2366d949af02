use anyhow::{bail, Context, Result};
use log::debug;
use reqwest::blocking::Client;
use reqwest::StatusCode;

use crate::config::CatalogueConfig;
use crate::http::build_client;
use crate::id::CatalogueId;

/// Paginated search results, one HTML page per call, restricted to a
/// subject facet.
pub trait SearchSource {
    fn search_page(&self, subject: &str, page: u32) -> Result<String>;
}

/// Edition detail pages. Called concurrently from the worker pool.
pub trait EditionSource: Sync {
    fn edition_page(&self, id: &CatalogueId) -> Result<String>;
}

pub struct CatalogueClient {
    http: Client,
    config: CatalogueConfig,
}

impl CatalogueClient {
    pub fn new(config: CatalogueConfig) -> Result<Self> {
        let http = build_client(config.timeout)
            .context("Failed to build HTTP client")?;
        Ok(Self { http, config })
    }

    fn get_text(&self, request: reqwest::blocking::RequestBuilder) -> Result<String> {
        let response = request.send()?;
        let status = response.status();
        let url = response.url().to_string();
        if status != StatusCode::OK {
            bail!("Status code {} from {}", status.as_u16(), url);
        }
        debug!("GET {} -> {}", url, status);
        Ok(response.text()?)
    }
}

impl SearchSource for CatalogueClient {
    fn search_page(&self, subject: &str, page: u32) -> Result<String> {
        let pg = page.to_string();
        let request = self
            .http
            .get(self.config.search_url())
            .query(&[("fqs", subject), ("pg", pg.as_str())]);
        self.get_text(request)
            .with_context(|| format!("Failed to fetch search page {} for '{}'", page, subject))
    }
}

impl EditionSource for CatalogueClient {
    fn edition_page(&self, id: &CatalogueId) -> Result<String> {
        let request = self.http.get(self.config.edition_url(id.as_str()));
        self.get_text(request)
            .with_context(|| format!("Failed to fetch record for ID {}", id))
    }
}
