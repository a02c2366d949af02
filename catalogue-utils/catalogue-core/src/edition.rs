//! Edition records as embedded in catalogue detail pages, and their
//! flattening into one row per digitisation or holding copy.
//!
//! The `edition` object is mostly flat scalars, with three naming shapes:
//!
//! * `std_<name>` carries a standardised value and is emitted as `<name>`;
//! * `<base>_<n>` is the n-th entry of a repeated field (authors, places,
//!   printers ...). Entries are joined into a single `;`-separated cell. For
//!   `author_<n>` the cell is chosen by the person type of `role_<n>`;
//! * everything else is copied as is, minus bookkeeping fields.

use std::collections::BTreeMap;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::table::{cell_text, is_blank, Row};

lazy_static! {
    static ref NUMBERED_KEY_RE: Regex = Regex::new(r"^(?P<base>.*)_(?P<index>\d+)$").unwrap();
}

const STANDARD_PREFIX: &str = "std_";

/// Prefixes (text before the last `_`) of keys that are never emitted.
const IGNORED_PREFIXES: [&str; 4] = ["female", "created", "updated", "fingerprint"];

/// Groups that only exist to resolve author roles.
const ROLE_GROUPS: [&str; 2] = ["author_role", "role"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlattenError {
    #[error("Unmapped role '{role}' (from {field}); the role table needs updating")]
    UnmappedRole { role: String, field: String },

    #[error("No role given for {field}")]
    MissingRole { field: String },
}

/// Contributor roles used by the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Commentator,
    Contributor,
    Defendant,
    Editor,
    Engraver,
    Illustrator,
    PrincipalAuthor,
    Proponent,
    Pseudonym,
    Respondent,
    Translator,
}

/// Output column a role is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PersonType {
    Author,
    Contributor,
    Editor,
    Translator,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Commentator" => Ok(Role::Commentator),
            "Contributor" => Ok(Role::Contributor),
            "Defendant" => Ok(Role::Defendant),
            "Editor" => Ok(Role::Editor),
            "Engraver" => Ok(Role::Engraver),
            "Illustrator" => Ok(Role::Illustrator),
            "Principal Author" => Ok(Role::PrincipalAuthor),
            "Proponent" => Ok(Role::Proponent),
            "Pseudonym" => Ok(Role::Pseudonym),
            "Respondent" => Ok(Role::Respondent),
            "Translator" => Ok(Role::Translator),
            other => Err(other.to_string()),
        }
    }
}

impl Role {
    pub fn person_type(self) -> PersonType {
        match self {
            Role::PrincipalAuthor | Role::Pseudonym => PersonType::Author,
            Role::Editor => PersonType::Editor,
            Role::Translator => PersonType::Translator,
            Role::Commentator
            | Role::Contributor
            | Role::Defendant
            | Role::Engraver
            | Role::Illustrator
            | Role::Proponent
            | Role::Respondent => PersonType::Contributor,
        }
    }
}

impl PersonType {
    pub fn as_str(self) -> &'static str {
        match self {
            PersonType::Author => "author",
            PersonType::Contributor => "contributor",
            PersonType::Editor => "editor",
            PersonType::Translator => "translator",
        }
    }
}

/// How a single `edition` key is treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditionKey<'a> {
    /// `std_<name>`, emitted as `<name>`.
    Standard(&'a str),
    /// `<base>_<index>`, one entry of a repeated field.
    Numbered { base: &'a str, index: &'a str },
    /// Emitted under its own name.
    Plain,
    Ignored,
}

impl<'a> EditionKey<'a> {
    pub fn classify(key: &'a str) -> Self {
        if let Some(name) = key.strip_prefix(STANDARD_PREFIX) {
            return EditionKey::Standard(name);
        }
        if let Some(caps) = NUMBERED_KEY_RE.captures(key) {
            if let (Some(base), Some(index)) = (caps.name("base"), caps.name("index")) {
                return EditionKey::Numbered { base: base.as_str(), index: index.as_str() };
            }
        }
        match key.rsplit_once('_') {
            Some((prefix, _)) if IGNORED_PREFIXES.contains(&prefix) => EditionKey::Ignored,
            Some(_) => EditionKey::Plain,
            None if key == "id" => EditionKey::Ignored,
            None => EditionKey::Plain,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Digitisation {
    pub url: Value,
}

/// A physical holding of an edition.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Holding {
    pub name: Value,
    pub city: Value,
    pub country: Value,
    pub shelfmark: Value,
}

impl Holding {
    /// `"{name} ({city}, {country})"`, blanks for missing parts.
    pub fn location(&self) -> String {
        format!(
            "{} ({}, {})",
            cell_text(&self.name),
            cell_text(&self.city),
            cell_text(&self.country)
        )
    }
}

/// One bibliographic entry with its digitisations and known copies.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EditionRecord {
    pub edition: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub digitisations: Vec<Option<Digitisation>>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub copies: Vec<Option<Holding>>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

impl EditionRecord {
    pub fn is_digitised(&self) -> bool {
        !self.digitisations.is_empty()
    }

    pub fn has_copies(&self) -> bool {
        !self.copies.is_empty()
    }

    /// Neither a digitisation nor a physical copy is known.
    pub fn is_lost(&self) -> bool {
        !self.is_digitised() && !self.has_copies()
    }

    fn role_field(&self, index: &str) -> Option<(String, &Value)> {
        ["role", "author_role"].iter().find_map(|prefix| {
            let field = format!("{}_{}", prefix, index);
            self.edition.get(&field).map(|value| (field, value))
        })
    }

    /// Person type for `author_<index>`, read from the matching role field.
    pub fn person_type(&self, index: &str) -> Result<PersonType, FlattenError> {
        match self.role_field(index) {
            Some((field, Value::String(role))) => role
                .parse::<Role>()
                .map(Role::person_type)
                .map_err(|role| FlattenError::UnmappedRole { role, field }),
            Some((field, _)) => Err(FlattenError::MissingRole { field }),
            None => Err(FlattenError::MissingRole { field: format!("author_{}", index) }),
        }
    }

    /// Fields shared by every row of this record.
    pub fn base_row(&self) -> Result<Row, FlattenError> {
        let mut row = Row::new();
        row.insert("is_lost".to_string(), Value::Bool(false));
        row.insert("digitised_url".to_string(), Value::String(String::new()));
        row.insert("copy_location".to_string(), Value::String(String::new()));
        row.insert("copy_shelfmark".to_string(), Value::String(String::new()));

        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for (key, value) in &self.edition {
            match EditionKey::classify(key) {
                EditionKey::Standard(name) => {
                    row.insert(name.to_string(), value.clone());
                }
                EditionKey::Numbered { base, index } => {
                    let group = if base == "author" {
                        self.person_type(index)?.as_str()
                    } else {
                        base
                    };
                    groups.entry(group).or_default().push(key);
                }
                EditionKey::Plain => {
                    row.insert(key.clone(), value.clone());
                }
                EditionKey::Ignored => {}
            }
        }

        for (group, mut fields) in groups {
            if ROLE_GROUPS.contains(&group) {
                continue;
            }
            fields.sort_unstable();
            let mut values: Vec<String> = fields
                .iter()
                .filter_map(|field| self.edition.get(*field))
                .filter(|value| !is_blank(value))
                .map(cell_text)
                .collect();
            if values.is_empty() {
                continue;
            }
            values.sort();
            row.insert(group.to_string(), Value::String(values.join(";")));
        }

        row.insert("is_digitised".to_string(), Value::Bool(self.is_digitised()));
        row.insert("has_copies".to_string(), Value::Bool(self.has_copies()));
        Ok(row)
    }

    /// Flattens the record: one row per digitisation plus one per copy, or a
    /// single `is_lost` row when there are neither.
    pub fn flatten(&self) -> Result<Vec<Row>, FlattenError> {
        let base = self.base_row()?;

        if self.is_lost() {
            let mut row = base;
            row.insert("is_lost".to_string(), Value::Bool(true));
            return Ok(vec![row]);
        }

        let mut rows = Vec::with_capacity(self.digitisations.len() + self.copies.len());

        for digitisation in self.digitisations.iter().flatten() {
            let mut row = base.clone();
            row.insert("digitised_url".to_string(), Value::String(cell_text(&digitisation.url)));
            rows.push(row);
        }

        for copy in self.copies.iter().flatten() {
            let mut row = base.clone();
            row.insert("copy_location".to_string(), Value::String(copy.location()));
            row.insert("copy_shelfmark".to_string(), Value::String(cell_text(&copy.shelfmark)));
            rows.push(row);
        }

        Ok(rows)
    }
}
