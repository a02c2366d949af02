//! Shared pieces of the catalogue tools: page payload extraction, edition
//! flattening, CSV output, checkpoint files and the Zotero reconciliation
//! logic used by the `edition-*` and `zotero-*` binaries.

pub mod catalogue;
pub mod checkpoint;
pub mod config;
pub mod crawl;
pub mod edition;
pub mod fetch;
pub mod http;
pub mod id;
pub mod page;
pub mod reconcile;
pub mod runtime;
pub mod table;
pub mod zotero;

pub use edition::{EditionRecord, FlattenError, PersonType, Role};
pub use id::CatalogueId;
pub use table::Row;
