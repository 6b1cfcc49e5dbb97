use frh_core::{AniListPage, CanonicalRecord, DomainError, Source, SourceMetrics, Variant};
use scraper::{Html, Node};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::{collapse_whitespace, AdapterError, EntryError, Extraction, PageRequest, SourceAdapter};

const GRAPHQL_URL: &str = "https://graphql.anilist.co";

const MEDIA_QUERY: &str = r#"
query ($page: Int, $perPage: Int, $sort: [MediaSort]) {
  Page(page: $page, perPage: $perPage) {
    media(type: MANGA, sort: $sort) {
      title { english romaji native }
      genres
      popularity
      favourites
      averageScore
      status
      description
    }
  }
}
"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct AniListAdapter;

fn sort_key(page: AniListPage) -> &'static str {
    match page {
        AniListPage::Top100 => "SCORE_DESC",
        AniListPage::Trending => "TRENDING_DESC",
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Option<PageData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PageData {
    #[serde(rename = "Page")]
    page: Option<MediaPage>,
}

#[derive(Debug, Deserialize)]
struct MediaPage {
    #[serde(default)]
    media: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaEntry {
    title: Option<MediaTitle>,
    genres: Option<Vec<String>>,
    popularity: Option<u64>,
    favourites: Option<u64>,
    average_score: Option<f64>,
    status: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MediaTitle {
    english: Option<String>,
    romaji: Option<String>,
    native: Option<String>,
}

impl MediaTitle {
    /// English, then romaji, then native; blank strings count as missing.
    fn preferred(&self) -> Option<String> {
        [&self.english, &self.romaji, &self.native]
            .into_iter()
            .flatten()
            .map(|title| collapse_whitespace(title))
            .find(|title| !title.is_empty())
    }
}

/// AniList descriptions are HTML fragments (`<br>`, `<i>`, entities).
fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut text = String::new();
    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Text(chunk) => text.push_str(chunk),
            Node::Element(element) if element.name() == "br" => text.push(' '),
            _ => {}
        }
    }
    collapse_whitespace(&text)
}

fn parse_entry(value: JsonValue) -> Result<Option<CanonicalRecord>, EntryError> {
    let entry: MediaEntry =
        serde_json::from_value(value).map_err(|e| EntryError::Schema(e.to_string()))?;

    let title = entry
        .title
        .unwrap_or_default()
        .preferred()
        .ok_or(EntryError::MissingField("title"))?;

    let metrics = SourceMetrics::AniList {
        popularity: entry.popularity.ok_or(EntryError::MissingField("popularity"))?,
        favorites: entry.favourites.ok_or(EntryError::MissingField("favourites"))?,
        rating: entry
            .average_score
            .ok_or(EntryError::MissingField("averageScore"))?,
        status: entry.status.ok_or(EntryError::MissingField("status"))?,
    };

    let mut record = CanonicalRecord::new(title, metrics);
    record.genres = entry.genres.unwrap_or_default();
    record.description = entry
        .description
        .as_deref()
        .map(html_to_text)
        .unwrap_or_default();
    Ok(Some(record))
}

impl SourceAdapter for AniListAdapter {
    fn source(&self) -> Source {
        Source::AniList
    }

    fn archive_extension(&self) -> &'static str {
        "json"
    }

    fn page_request(&self, variant: Variant, page: u32) -> Result<PageRequest, AdapterError> {
        let Variant::AniList(listing) = variant else {
            return Err(DomainError::VariantMismatch {
                site: Source::AniList,
                variant,
            }
            .into());
        };
        Ok(PageRequest::PostJson {
            url: GRAPHQL_URL.to_string(),
            body: json!({
                "query": MEDIA_QUERY,
                "variables": {
                    "page": page,
                    "perPage": Source::AniList.entries_per_page(),
                    "sort": [sort_key(listing)],
                },
            }),
        })
    }

    fn extract(&self, body: &[u8], variant: Variant) -> Result<Extraction, AdapterError> {
        variant.ensure_source(Source::AniList)?;
        let payload = |message: String| AdapterError::Payload {
            site: Source::AniList,
            message,
        };

        let envelope: Envelope =
            serde_json::from_slice(body).map_err(|e| payload(format!("not JSON: {e}")))?;
        if !envelope.errors.is_empty() {
            let messages: Vec<_> = envelope.errors.into_iter().map(|e| e.message).collect();
            return Err(payload(messages.join("; ")));
        }
        let media = envelope
            .data
            .and_then(|data| data.page)
            .ok_or_else(|| payload("response has no data.Page".to_string()))?
            .media;

        let mut extraction = Extraction::default();
        for (index, value) in media.into_iter().enumerate() {
            extraction.push(index, parse_entry(value));
        }
        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::read_fixture;

    fn top_100() -> Variant {
        Variant::AniList(AniListPage::Top100)
    }

    #[test]
    fn request_is_a_graphql_post_with_sort_and_page() {
        let request = AniListAdapter
            .page_request(Variant::AniList(AniListPage::Trending), 3)
            .unwrap();
        let PageRequest::PostJson { url, body } = request else {
            panic!("expected a POST request");
        };
        assert_eq!(url, "https://graphql.anilist.co");
        assert_eq!(body["variables"]["page"], 3);
        assert_eq!(body["variables"]["perPage"], 50);
        assert_eq!(body["variables"]["sort"], json!(["TRENDING_DESC"]));
        assert!(body["query"].as_str().unwrap().contains("type: MANGA"));
    }

    #[test]
    fn fixture_page_prefers_english_titles_and_skips_incomplete_media() {
        let body = read_fixture("anilist", "top_100_page1.json");
        let extraction = AniListAdapter.extract(&body, top_100()).unwrap();

        let titles: Vec<_> = extraction.records.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(titles, vec!["Berserk", "Oyasumi Punpun"]);
        let skipped: Vec<_> = extraction.skipped.iter().map(|s| s.index).collect();
        assert_eq!(skipped, vec![2, 3]);

        let berserk = &extraction.records[0];
        assert_eq!(
            berserk.metrics,
            SourceMetrics::AniList {
                popularity: 180_000,
                favorites: 41_000,
                rating: 93.0,
                status: "RELEASING".into(),
            }
        );
        assert_eq!(berserk.genres, vec!["Action", "Drama", "Fantasy"]);
        assert_eq!(
            berserk.description,
            "Guts, a former mercenary now known as the Black Swordsman, is out for revenge. \
             (Source: Dark Horse)"
        );
        assert!(berserk.last_updated.is_none());

        let punpun = &extraction.records[1];
        assert_eq!(punpun.description, "");
    }

    #[test]
    fn graphql_errors_reject_the_whole_page() {
        let body = br#"{"data": null, "errors": [{"message": "Too Many Requests.", "status": 429}]}"#;
        let err = AniListAdapter.extract(body, top_100()).unwrap_err();
        assert!(
            matches!(err, AdapterError::Payload { ref message, .. } if message.contains("Too Many Requests"))
        );

        let err = AniListAdapter.extract(b"<html>oops</html>", top_100()).unwrap_err();
        assert!(matches!(err, AdapterError::Payload { .. }));
    }

    #[test]
    fn native_title_is_the_last_resort() {
        let title = MediaTitle {
            english: Some("  ".into()),
            romaji: None,
            native: Some("ベルセルク".into()),
        };
        assert_eq!(title.preferred().as_deref(), Some("ベルセルク"));
        assert_eq!(MediaTitle::default().preferred(), None);
    }

    #[test]
    fn description_markup_is_flattened() {
        assert_eq!(
            html_to_text("Line one.<br><br>\n<i>Line</i> two &amp; three."),
            "Line one. Line two & three."
        );
    }
}
