//! Catalogue pages ship their data as a JSON document in the `data-page`
//! attribute of the app root element. The HTML parser hands us the attribute
//! with entities already decoded.

use lazy_static::lazy_static;
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::edition::EditionRecord;
use crate::id::CatalogueId;

pub const DATA_PAGE_ATTR: &str = "data-page";

lazy_static! {
    static ref DATA_PAGE_SELECTOR: Selector = Selector::parse("[data-page]").unwrap();
}

#[derive(Error, Debug)]
pub enum PageError {
    #[error("Could not find data-page attribute in HTML")]
    MissingPayload,

    #[error("Failed to parse JSON data from page: {0}")]
    Json(#[from] serde_json::Error),
}

/// Raw text of the first `data-page` attribute in the document.
pub fn extract_payload_text(html: &str) -> Result<String, PageError> {
    let document = Html::parse_document(html);
    let payload = document
        .select(&DATA_PAGE_SELECTOR)
        .find_map(|element| element.value().attr(DATA_PAGE_ATTR))
        .map(str::to_string);
    payload.ok_or(PageError::MissingPayload)
}

pub fn extract_payload<T: DeserializeOwned>(html: &str) -> Result<T, PageError> {
    let text = extract_payload_text(html)?;
    Ok(serde_json::from_str(&text)?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SearchPayload {
    props: SearchProps,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchProps {
    results: Option<SearchResults>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResults {
    data: Vec<SearchHit>,
    meta: Option<ResultsMeta>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchHit {
    attributes: Option<HitAttributes>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HitAttributes {
    sn: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResultsMeta {
    pagination: Option<Pagination>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Pagination {
    next: Value,
}

impl SearchPayload {
    /// Record numbers (`props.results.data[].attributes.sn`) on this page.
    pub fn ids(&self) -> Vec<CatalogueId> {
        self.props
            .results
            .iter()
            .flat_map(|results| results.data.iter())
            .filter_map(|hit| hit.attributes.as_ref())
            .filter_map(|attributes| CatalogueId::from_value(&attributes.sn))
            .collect()
    }

    /// `Some(true)` when the pagination block links a next page, `None` when
    /// there is no pagination block at all.
    pub fn has_next_page(&self) -> Option<bool> {
        let pagination = self.props.results.as_ref()?.meta.as_ref()?.pagination.as_ref()?;
        Some(!crate::table::is_blank(&pagination.next))
    }
}

#[derive(Debug, Deserialize)]
struct DetailPayload {
    props: EditionRecord,
}

/// Decodes the edition record embedded in a detail page.
pub fn parse_edition_page(html: &str) -> Result<EditionRecord, PageError> {
    let payload: DetailPayload = extract_payload(html)?;
    Ok(payload.props)
}
