use frh_core::{CanonicalRecord, DomainError, NovelUpdatesPage, Source, SourceMetrics, Variant};
use scraper::{ElementRef, Html, Selector};

use crate::{
    all_texts, collapse_whitespace, direct_texts, element_text, first_text, parse_count,
    parse_float, parse_listing_date, selector, AdapterError, EntryError, Extraction, PageRequest,
    SourceAdapter,
};

const RANKING_URL: &str = "https://www.novelupdates.com/series-ranking/";
/// Genre ids the ranking is narrowed to.
const GENRE_FILTER: &str = "324,1692,560";
/// Status tag NovelUpdates mixes into the genre list.
const COMPLETED_TAG: &str = "Completed";

#[derive(Debug, Clone, Copy, Default)]
pub struct NovelUpdatesAdapter;

fn rank_param(page: NovelUpdatesPage) -> &'static str {
    match page {
        NovelUpdatesPage::ActivityWeek => "week",
        NovelUpdatesPage::PopularMonth => "popmonth",
    }
}

struct Selectors {
    entry: Selector,
    title: Selector,
    rating: Selector,
    stats: Selector,
    genres: Selector,
    body: Selector,
    hidden: Selector,
}

impl Selectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            entry: selector("div.search_main_box_nu")?,
            title: selector("div.search_title a")?,
            rating: selector("div.search_ratings")?,
            stats: selector("div.search_stats span.ss_desk")?,
            genres: selector("div.search_genre a")?,
            body: selector("div.search_body_nu")?,
            hidden: selector("span.testhide")?,
        })
    }
}

/// `"4.5 (4.5)"` -> 4.5; the score shown in parentheses is the authoritative one.
fn rating(text: &str) -> Result<f64, EntryError> {
    let inner = text
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(inner, _)| inner)
        .ok_or(EntryError::MissingField("rating"))?;
    parse_float("rating", inner)
}

/// `"Every 2.5 Day(s)"` -> 2.5
fn update_frequency(text: &str) -> Result<f64, EntryError> {
    let token = text
        .split_whitespace()
        .nth(1)
        .ok_or(EntryError::MissingField("update_frequency"))?;
    parse_float("update_frequency", token)
}

/// Text inside the collapsed `span.testhide`, minus its own loose text and
/// the trailing "less" toggle.
fn hidden_description(hidden: ElementRef<'_>) -> String {
    let mut fragments: Vec<String> = hidden
        .descendants()
        .filter(|node| node.parent().map(|parent| parent.id()) != Some(hidden.id()))
        .filter_map(|node| node.value().as_text())
        .map(|text| collapse_whitespace(text))
        .filter(|text| !text.is_empty())
        .collect();
    fragments.pop();
    fragments.join(" ")
}

fn description(item: ElementRef<'_>, sel: &Selectors) -> String {
    let Some(body) = item.select(&sel.body).next() else {
        return String::new();
    };
    let visible = direct_texts(body).join(" ");
    let hidden = body
        .select(&sel.hidden)
        .next()
        .map(hidden_description)
        .unwrap_or_default();
    collapse_whitespace(&format!("{visible} {hidden}"))
}

fn parse_entry(
    item: ElementRef<'_>,
    sel: &Selectors,
) -> Result<Option<CanonicalRecord>, EntryError> {
    let title = first_text(item, &sel.title).ok_or(EntryError::MissingField("title"))?;
    let rating_text = item
        .select(&sel.rating)
        .next()
        .map(element_text)
        .ok_or(EntryError::MissingField("rating"))?;

    let stats: Vec<String> = item.select(&sel.stats).flat_map(direct_texts).collect();
    let stat = |index: usize, field: &'static str| {
        stats
            .get(index)
            .map(String::as_str)
            .ok_or(EntryError::MissingField(field))
    };

    let chapters = parse_count("chapters", stat(0, "chapters")?)?;
    if chapters == 0 {
        return Ok(None);
    }

    let metrics = SourceMetrics::NovelUpdates {
        readers: parse_count("readers", stat(2, "readers")?)?,
        reviews: parse_count("reviews", stat(3, "reviews")?)?,
        rating: rating(&rating_text)?,
        chapters,
        update_frequency: update_frequency(stat(1, "update_frequency")?)?,
    };

    let mut record = CanonicalRecord::new(title, metrics);
    record.genres = all_texts(item, &sel.genres);
    record.genres.retain(|genre| genre != COMPLETED_TAG);
    record.last_updated = stats
        .get(4)
        .and_then(|text| parse_listing_date(text, "%m-%d-%Y"));
    record.description = description(item, sel);
    Ok(Some(record))
}

impl SourceAdapter for NovelUpdatesAdapter {
    fn source(&self) -> Source {
        Source::NovelUpdates
    }

    fn archive_extension(&self) -> &'static str {
        "html"
    }

    fn page_request(&self, variant: Variant, page: u32) -> Result<PageRequest, AdapterError> {
        let Variant::NovelUpdates(ranking) = variant else {
            return Err(DomainError::VariantMismatch {
                site: Source::NovelUpdates,
                variant,
            }
            .into());
        };
        Ok(PageRequest::Get {
            url: format!(
                "{RANKING_URL}?rank={}&ge={GENRE_FILTER}&rl=0&pg={page}",
                rank_param(ranking)
            ),
        })
    }

    fn extract(&self, body: &[u8], variant: Variant) -> Result<Extraction, AdapterError> {
        variant.ensure_source(Source::NovelUpdates)?;
        let sel = Selectors::new()?;
        let document = Html::parse_document(&String::from_utf8_lossy(body));

        let mut extraction = Extraction::default();
        for (index, item) in document.select(&sel.entry).enumerate() {
            extraction.push(index, parse_entry(item, &sel));
        }
        Ok(extraction)
    }
}
