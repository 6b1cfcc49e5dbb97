//! Source adapter contract plus the RoyalRoad, NovelUpdates and AniList adapters.
//!
//! An adapter knows two things about its source: which request fetches a
//! given listing page, and how to turn that page's body into canonical
//! records. Extraction is pure; adapters never touch the network or the store.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use frh_core::{CanonicalRecord, DomainError, Source, Variant};
use scraper::{ElementRef, Selector};
use thiserror::Error;
use tracing::warn;

pub use frh_storage::PageRequest;

mod anilist;
mod novelupdates;
mod royalroad;

pub use anilist::AniListAdapter;
pub use novelupdates::NovelUpdatesAdapter;
pub use royalroad::RoyalRoadAdapter;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("invalid selector `{selector}`: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
    #[error("malformed {site} payload: {message}")]
    Payload { site: Source, message: String },
}

/// Why a single entry could not become a record.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EntryError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a number: `{text}`")]
    InvalidNumber { field: &'static str, text: String },
    #[error("entry does not match the expected schema: {0}")]
    Schema(String),
    #[error(transparent)]
    InvalidRecord(#[from] DomainError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntry {
    pub index: usize,
    pub reason: String,
}

/// Records pulled from one page, plus what was left behind and why.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub records: Vec<CanonicalRecord>,
    /// Entries dropped on purpose (e.g. series without chapters yet).
    pub filtered: usize,
    pub skipped: Vec<SkippedEntry>,
}

impl Extraction {
    /// `Ok(None)` means the entry was filtered out by a business rule.
    pub(crate) fn push(&mut self, index: usize, outcome: Result<Option<CanonicalRecord>, EntryError>) {
        let outcome = outcome.and_then(|record| match record {
            Some(record) => record.validate().map(|()| Some(record)).map_err(EntryError::from),
            None => Ok(None),
        });
        match outcome {
            Ok(Some(record)) => self.records.push(record),
            Ok(None) => self.filtered += 1,
            Err(err) => {
                warn!(index, error = %err, "skipping malformed entry");
                self.skipped.push(SkippedEntry {
                    index,
                    reason: err.to_string(),
                });
            }
        }
    }
}

pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// File extension used when archiving raw pages.
    fn archive_extension(&self) -> &'static str;

    fn page_request(&self, variant: Variant, page: u32) -> Result<PageRequest, AdapterError>;

    /// Parse one page. Malformed entries are skipped, never fatal; an error
    /// here means the page as a whole was unusable.
    fn extract(&self, body: &[u8], variant: Variant) -> Result<Extraction, AdapterError>;
}

pub fn adapter_for_source(source: Source) -> Box<dyn SourceAdapter> {
    match source {
        Source::RoyalRoad => Box::new(RoyalRoadAdapter),
        Source::NovelUpdates => Box::new(NovelUpdatesAdapter),
        Source::AniList => Box::new(AniListAdapter),
    }
}

pub(crate) fn selector(css: &'static str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

pub(crate) fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|el| text_or_none(element_text(el)))
}

pub(crate) fn all_texts(scope: ElementRef<'_>, sel: &Selector) -> Vec<String> {
    scope
        .select(sel)
        .filter_map(|el| text_or_none(element_text(el)))
        .collect()
}

/// Text nodes that are direct children of `element`, each whitespace-collapsed.
pub(crate) fn direct_texts(element: ElementRef<'_>) -> Vec<String> {
    element
        .children()
        .filter_map(|node| node.value().as_text())
        .filter_map(|text| text_or_none(collapse_whitespace(text)))
        .collect()
}

/// First run of digits in `text`, thousands separators allowed: `"12,345 Followers"` -> 12345.
pub(crate) fn parse_count(field: &'static str, text: &str) -> Result<u64, EntryError> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    digits.parse().map_err(|_| EntryError::InvalidNumber {
        field,
        text: text.to_string(),
    })
}

pub(crate) fn parse_float(field: &'static str, text: &str) -> Result<f64, EntryError> {
    text.trim()
        .replace(',', "")
        .parse()
        .map_err(|_| EntryError::InvalidNumber {
            field,
            text: text.to_string(),
        })
}

/// Calendar date from a listing, as midnight UTC. Unparseable dates count as absent.
pub(crate) fn parse_listing_date(text: &str, format: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(text.trim(), format).ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    pub fn fixture_path(source: &str, name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(source)
            .join(name)
    }

    pub fn read_fixture(source: &str, name: &str) -> Vec<u8> {
        let path = fixture_path(source, name);
        std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frh_core::{NovelUpdatesPage, SourceMetrics};

    #[test]
    fn counts_strip_thousands_separators() {
        assert_eq!(parse_count("followers", " 12,345 Followers").unwrap(), 12_345);
        assert_eq!(parse_count("chapters", "0 Chapters").unwrap(), 0);
        assert!(matches!(
            parse_count("views", "n/a"),
            Err(EntryError::InvalidNumber { field: "views", .. })
        ));
    }

    #[test]
    fn floats_and_dates_parse_leniently() {
        assert_eq!(parse_float("rating", " 4.57 ").unwrap(), 4.57);
        assert!(parse_float("rating", "four").is_err());

        let date = parse_listing_date("Mar 04, 2026", "%b %d, %Y").unwrap();
        assert_eq!(date.to_rfc3339(), "2026-03-04T00:00:00+00:00");
        assert!(parse_listing_date("3 hours ago", "%b %d, %Y").is_none());
    }

    #[test]
    fn whitespace_collapses_across_lines() {
        assert_eq!(collapse_whitespace("  a\n\t b   c "), "a b c");
    }

    #[test]
    fn extraction_counts_filtered_and_skipped_entries() {
        let mut extraction = Extraction::default();
        let metrics = SourceMetrics::NovelUpdates {
            readers: 1,
            reviews: 1,
            rating: 4.0,
            chapters: 3,
            update_frequency: 2.0,
        };
        extraction.push(0, Ok(Some(CanonicalRecord::new("Lord of the Mysteries", metrics.clone()))));
        extraction.push(1, Ok(None));
        extraction.push(2, Err(EntryError::MissingField("title")));
        extraction.push(3, Ok(Some(CanonicalRecord::new(" ", metrics))));

        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.filtered, 1);
        let skipped: Vec<_> = extraction.skipped.iter().map(|s| s.index).collect();
        assert_eq!(skipped, vec![2, 3]);
    }

    #[test]
    fn dispatch_returns_the_matching_adapter() {
        for source in Source::ALL {
            assert_eq!(adapter_for_source(source).source(), source);
        }
        let adapter = adapter_for_source(Source::RoyalRoad);
        let err = adapter
            .page_request(Variant::NovelUpdates(NovelUpdatesPage::ActivityWeek), 1)
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Domain(DomainError::VariantMismatch { .. })
        ));
    }
}
