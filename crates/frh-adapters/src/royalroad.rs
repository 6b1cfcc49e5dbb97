use chrono::{DateTime, TimeZone, Utc};
use frh_core::{CanonicalRecord, DomainError, RoyalRoadPage, Source, SourceMetrics, Variant};
use scraper::{ElementRef, Html, Selector};

use crate::{
    all_texts, element_text, first_text, parse_count, parse_float, parse_listing_date, selector,
    AdapterError, EntryError, Extraction, PageRequest, SourceAdapter,
};

const BASE_URL: &str = "https://www.royalroad.com/fictions";

#[derive(Debug, Clone, Copy, Default)]
pub struct RoyalRoadAdapter;

fn listing_path(page: RoyalRoadPage) -> &'static str {
    match page {
        RoyalRoadPage::BestRated => "best-rated",
        RoyalRoadPage::Trending => "trending",
        RoyalRoadPage::OngoingFictions => "active-popular",
        RoyalRoadPage::PopularThisWeek => "weekly-popular",
    }
}

struct Selectors {
    entry: Selector,
    title: Selector,
    tags: Selector,
    followers: Selector,
    rating: Selector,
    pages: Selector,
    views: Selector,
    chapters: Selector,
    updated: Selector,
    description: Selector,
}

impl Selectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            entry: selector("div.fiction-list-item.row")?,
            title: selector("h2.fiction-title a")?,
            tags: selector("span.tags a")?,
            followers: selector("i.fa-users + span")?,
            rating: selector("i.fa-star + span")?,
            pages: selector("i.fa-book + span")?,
            views: selector("i.fa-eye + span")?,
            chapters: selector("i.fa-list + span")?,
            updated: selector("i.fa-calendar + span time")?,
            description: selector(r#"div[id^="description-"] p"#)?,
        })
    }
}

fn stat(item: ElementRef<'_>, sel: &Selector, field: &'static str) -> Result<u64, EntryError> {
    let text = first_text(item, sel).ok_or(EntryError::MissingField(field))?;
    parse_count(field, &text)
}

/// `unixtime` when the page carries it, otherwise the rendered `Mar 04, 2026` form.
fn last_updated(item: ElementRef<'_>, sel: &Selector) -> Option<DateTime<Utc>> {
    let time = item.select(sel).next()?;
    if let Some(ts) = time
        .value()
        .attr("unixtime")
        .and_then(|raw| raw.trim().parse::<i64>().ok())
    {
        return Utc.timestamp_opt(ts, 0).single();
    }
    parse_listing_date(&element_text(time), "%b %d, %Y")
}

fn parse_entry(
    item: ElementRef<'_>,
    sel: &Selectors,
) -> Result<Option<CanonicalRecord>, EntryError> {
    let title = first_text(item, &sel.title).ok_or(EntryError::MissingField("title"))?;

    let rating_text = item
        .select(&sel.rating)
        .next()
        .and_then(|span| span.value().attr("title"))
        .ok_or(EntryError::MissingField("rating"))?;

    let metrics = SourceMetrics::RoyalRoad {
        followers: stat(item, &sel.followers, "followers")?,
        rating: parse_float("rating", rating_text)?,
        pages: stat(item, &sel.pages, "pages")?,
        views: stat(item, &sel.views, "views")?,
        chapters: stat(item, &sel.chapters, "chapters")?,
    };

    let mut record = CanonicalRecord::new(title, metrics);
    record.genres = all_texts(item, &sel.tags);
    record.last_updated = last_updated(item, &sel.updated);
    record.description = all_texts(item, &sel.description).join(" ");
    Ok(Some(record))
}

impl SourceAdapter for RoyalRoadAdapter {
    fn source(&self) -> Source {
        Source::RoyalRoad
    }

    fn archive_extension(&self) -> &'static str {
        "html"
    }

    fn page_request(&self, variant: Variant, page: u32) -> Result<PageRequest, AdapterError> {
        let Variant::RoyalRoad(listing) = variant else {
            return Err(DomainError::VariantMismatch {
                site: Source::RoyalRoad,
                variant,
            }
            .into());
        };
        Ok(PageRequest::Get {
            url: format!("{BASE_URL}/{}?page={page}", listing_path(listing)),
        })
    }

    fn extract(&self, body: &[u8], variant: Variant) -> Result<Extraction, AdapterError> {
        variant.ensure_source(Source::RoyalRoad)?;
        let sel = Selectors::new()?;
        let document = Html::parse_document(&String::from_utf8_lossy(body));

        let mut extraction = Extraction::default();
        for (index, item) in document.select(&sel.entry).enumerate() {
            extraction.push(index, parse_entry(item, &sel));
        }
        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::read_fixture;

    fn best_rated() -> Variant {
        Variant::RoyalRoad(RoyalRoadPage::BestRated)
    }

    #[test]
    fn listing_urls_follow_the_variant() {
        let adapter = RoyalRoadAdapter;
        assert_eq!(
            adapter
                .page_request(Variant::RoyalRoad(RoyalRoadPage::OngoingFictions), 3)
                .unwrap(),
            PageRequest::Get {
                url: "https://www.royalroad.com/fictions/active-popular?page=3".into()
            }
        );
        assert_eq!(
            adapter
                .page_request(Variant::RoyalRoad(RoyalRoadPage::PopularThisWeek), 1)
                .unwrap()
                .url(),
            "https://www.royalroad.com/fictions/weekly-popular?page=1"
        );
    }

    #[test]
    fn fixture_page_yields_well_formed_entries_and_skips_the_broken_one() {
        let body = read_fixture("royalroad", "best_rated_page1.html");
        let extraction = RoyalRoadAdapter.extract(&body, best_rated()).unwrap();

        assert_eq!(extraction.records.len(), 2);
        assert_eq!(extraction.skipped.len(), 1);
        assert_eq!(extraction.skipped[0].index, 1);
        assert_eq!(extraction.filtered, 0);

        let first = &extraction.records[0];
        assert_eq!(first.identity, "Beware Of Chicken");
        assert_eq!(first.genres, vec!["Comedy", "Fantasy", "Xianxia"]);
        assert_eq!(
            first.metrics,
            SourceMetrics::RoyalRoad {
                followers: 40_123,
                rating: 4.71,
                pages: 2_870,
                views: 12_345_678,
                chapters: 301,
            }
        );
        assert_eq!(
            first.last_updated.unwrap().to_rfc3339(),
            "2026-03-04T00:00:00+00:00"
        );
        assert_eq!(
            first.description,
            "Jin Rou wanted a quiet life. The farm had other plans."
        );
        assert!(first.is_new);

        let second = &extraction.records[1];
        assert_eq!(second.identity, "Super Supportive");
        assert_eq!(
            second.last_updated.unwrap().to_rfc3339(),
            "2026-03-01T12:00:00+00:00"
        );
    }

    #[test]
    fn foreign_variant_is_rejected() {
        let err = RoyalRoadAdapter
            .extract(b"<html></html>", Source::AniList.default_variant())
            .unwrap_err();
        assert!(matches!(err, AdapterError::Domain(_)));
    }

    #[test]
    fn empty_page_yields_nothing() {
        let extraction = RoyalRoadAdapter
            .extract(b"<html><body><p>No fictions</p></body></html>", best_rated())
            .unwrap();
        assert_eq!(extraction, Extraction::default());
    }
}
