//! Core domain model for FRH: sources, listing variants, canonical records and harvest jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default item quota for a harvest job.
pub const DEFAULT_QUERY_LIMIT: u32 = 250;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error("unknown variant `{input}` for source {site}")]
    UnknownVariant { site: Source, input: String },
    #[error("variant `{variant}` does not belong to source {site}")]
    VariantMismatch { site: Source, variant: Variant },
    #[error("page cap must be at least 1")]
    ZeroPageCap,
    #[error("record identity is empty")]
    EmptyIdentity,
    #[error("metric `{field}` must be finite and non-negative, got {value}")]
    InvalidMetric { field: &'static str, value: f64 },
}

/// One external ranking site or API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    RoyalRoad,
    NovelUpdates,
    AniList,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::RoyalRoad, Source::NovelUpdates, Source::AniList];

    /// Stable name; doubles as the record collection and the `last_updated` document key.
    pub fn as_str(self) -> &'static str {
        match self {
            Source::RoyalRoad => "royalroad",
            Source::NovelUpdates => "novelupdates",
            Source::AniList => "anilist",
        }
    }

    pub fn entries_per_page(self) -> u32 {
        match self {
            Source::RoyalRoad => 20,
            Source::NovelUpdates => 25,
            Source::AniList => 50,
        }
    }

    pub fn default_max_pages(self) -> u32 {
        match self {
            Source::RoyalRoad => 10,
            Source::NovelUpdates => 1,
            Source::AniList => 1,
        }
    }

    /// HTML listings are crawled politely; the AniList GraphQL API is not a crawl.
    pub fn obeys_robots_txt(self) -> bool {
        !matches!(self, Source::AniList)
    }

    pub fn default_variant(self) -> Variant {
        match self {
            Source::RoyalRoad => Variant::RoyalRoad(RoyalRoadPage::OngoingFictions),
            Source::NovelUpdates => Variant::NovelUpdates(NovelUpdatesPage::ActivityWeek),
            Source::AniList => Variant::AniList(AniListPage::Top100),
        }
    }

    pub fn variants(self) -> impl Iterator<Item = Variant> {
        VARIANTS
            .iter()
            .map(|(variant, _, _)| *variant)
            .filter(move |variant| variant.source() == self)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Source::ALL
            .into_iter()
            .find(|source| source.as_str() == wanted)
            .ok_or_else(|| DomainError::UnknownSource(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoyalRoadPage {
    BestRated,
    Trending,
    OngoingFictions,
    PopularThisWeek,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NovelUpdatesPage {
    ActivityWeek,
    PopularMonth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AniListPage {
    Top100,
    Trending,
}

/// A named listing view within a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    RoyalRoad(RoyalRoadPage),
    NovelUpdates(NovelUpdatesPage),
    AniList(AniListPage),
}

// (variant, display label, slug)
const VARIANTS: &[(Variant, &str, &str)] = &[
    (Variant::RoyalRoad(RoyalRoadPage::BestRated), "Best Rated", "best-rated"),
    (Variant::RoyalRoad(RoyalRoadPage::Trending), "Trending", "trending"),
    (
        Variant::RoyalRoad(RoyalRoadPage::OngoingFictions),
        "Ongoing Fictions",
        "ongoing-fictions",
    ),
    (
        Variant::RoyalRoad(RoyalRoadPage::PopularThisWeek),
        "Popular This Week",
        "popular-this-week",
    ),
    (
        Variant::NovelUpdates(NovelUpdatesPage::ActivityWeek),
        "Activity (Week)",
        "activity-week",
    ),
    (
        Variant::NovelUpdates(NovelUpdatesPage::PopularMonth),
        "Popular (Month)",
        "popular-month",
    ),
    (Variant::AniList(AniListPage::Top100), "Top 100", "top-100"),
    (Variant::AniList(AniListPage::Trending), "Trending", "trending"),
];

impl Variant {
    pub fn source(self) -> Source {
        match self {
            Variant::RoyalRoad(_) => Source::RoyalRoad,
            Variant::NovelUpdates(_) => Source::NovelUpdates,
            Variant::AniList(_) => Source::AniList,
        }
    }

    /// Human label, used as the field name in the `last_updated` document.
    pub fn label(self) -> &'static str {
        self.entry().1
    }

    /// Path- and CLI-friendly name.
    pub fn slug(self) -> &'static str {
        self.entry().2
    }

    fn entry(self) -> &'static (Variant, &'static str, &'static str) {
        VARIANTS
            .iter()
            .find(|(variant, _, _)| *variant == self)
            .expect("every variant has a table entry")
    }

    /// Resolve a variant of `source` from its label or slug, ignoring case.
    pub fn parse(source: Source, input: &str) -> Result<Variant, DomainError> {
        let wanted = input.trim();
        source
            .variants()
            .find(|variant| {
                variant.label().eq_ignore_ascii_case(wanted)
                    || variant.slug().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| DomainError::UnknownVariant {
                site: source,
                input: input.to_string(),
            })
    }

    pub fn ensure_source(self, source: Source) -> Result<Variant, DomainError> {
        if self.source() == source {
            Ok(self)
        } else {
            Err(DomainError::VariantMismatch {
                site: source,
                variant: self,
            })
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Source-specific numeric metrics, flattened into the stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum SourceMetrics {
    RoyalRoad {
        followers: u64,
        rating: f64,
        pages: u64,
        views: u64,
        chapters: u64,
    },
    NovelUpdates {
        readers: u64,
        reviews: u64,
        rating: f64,
        chapters: u64,
        /// Average days between releases.
        update_frequency: f64,
    },
    AniList {
        popularity: u64,
        favorites: u64,
        rating: f64,
        status: String,
    },
}

impl SourceMetrics {
    fn float_fields(&self) -> Vec<(&'static str, f64)> {
        match self {
            SourceMetrics::RoyalRoad { rating, .. } | SourceMetrics::AniList { rating, .. } => {
                vec![("rating", *rating)]
            }
            SourceMetrics::NovelUpdates {
                rating,
                update_frequency,
                ..
            } => vec![("rating", *rating), ("update_frequency", *update_frequency)],
        }
    }
}

fn default_is_new() -> bool {
    true
}

/// One harvested entry in its canonical, source-independent shape.
///
/// `identity` is the display title and the document key. `is_new` is only
/// ever written when the document is first created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    #[serde(rename = "title")]
    pub identity: String,
    pub genres: Vec<String>,
    #[serde(flatten)]
    pub metrics: SourceMetrics,
    pub last_updated: Option<DateTime<Utc>>,
    pub description: String,
    #[serde(default = "default_is_new")]
    pub is_new: bool,
}

impl CanonicalRecord {
    pub fn new(identity: impl Into<String>, metrics: SourceMetrics) -> Self {
        Self {
            identity: identity.into(),
            genres: Vec::new(),
            metrics,
            last_updated: None,
            description: String::new(),
            is_new: true,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.identity.trim().is_empty() {
            return Err(DomainError::EmptyIdentity);
        }
        for (field, value) in self.metrics.float_fields() {
            if !value.is_finite() || value < 0.0 {
                return Err(DomainError::InvalidMetric { field, value });
            }
        }
        Ok(())
    }
}

/// A request to harvest one (source, variant) pair. Consumed once, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestJob {
    pub run_id: Uuid,
    pub variant: Variant,
    pub quota: u32,
    pub page_cap: u32,
}

impl HarvestJob {
    pub fn new(variant: Variant, quota: u32, page_cap: u32) -> Result<Self, DomainError> {
        if page_cap == 0 {
            return Err(DomainError::ZeroPageCap);
        }
        Ok(Self {
            run_id: Uuid::new_v4(),
            variant,
            quota,
            page_cap,
        })
    }

    pub fn source(&self) -> Source {
        self.variant.source()
    }
}
