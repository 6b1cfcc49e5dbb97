use std::sync::Arc;

use chrono::{DateTime, Utc};
use frh_adapters::SourceAdapter;
use frh_core::{CanonicalRecord, HarvestJob, Source, Variant};
use frh_storage::{PageArchive, RateLimitedFetcher, RawContent, UpsertSink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{page_sequence, HarvestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFailureKind {
    Fetch,
    Extraction,
}

/// A page that contributed no records; the job carried on without it.
#[derive(Debug, Clone, PartialEq)]
pub struct PageFailure {
    pub page: u32,
    pub kind: PageFailureKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarvestReport {
    pub run_id: Uuid,
    pub source: Source,
    pub variant: Variant,
    pub pages_planned: usize,
    pub pages_fetched: usize,
    pub page_failures: Vec<PageFailure>,
    pub records_extracted: usize,
    pub entries_filtered: usize,
    pub entries_skipped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub stamped_at: DateTime<Utc>,
}

/// Runs one job end to end: plan pages, fetch and extract each, persist once, stamp.
pub struct SourceHarvester {
    adapter: Arc<dyn SourceAdapter>,
    fetcher: Arc<RateLimitedFetcher>,
    archive: Option<PageArchive>,
    sink: UpsertSink,
}

impl SourceHarvester {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        fetcher: Arc<RateLimitedFetcher>,
        sink: UpsertSink,
    ) -> Self {
        Self {
            adapter,
            fetcher,
            archive: None,
            sink,
        }
    }

    pub fn with_archive(mut self, archive: Option<PageArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn source(&self) -> Source {
        self.adapter.source()
    }

    pub async fn run(
        &self,
        job: &HarvestJob,
        cancel: &CancellationToken,
    ) -> Result<HarvestReport, HarvestError> {
        let span = info_span!(
            "harvest",
            run_id = %job.run_id,
            source = %job.source(),
            variant = %job.variant,
        );
        self.run_inner(job, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        job: &HarvestJob,
        cancel: &CancellationToken,
    ) -> Result<HarvestReport, HarvestError> {
        let source = job.source();
        let variant = job.variant;
        if source != self.adapter.source() || source != self.fetcher.source() {
            return Err(HarvestError::Configuration(format!(
                "job for {source} handed to the {} harvester",
                self.adapter.source()
            )));
        }

        let pages = page_sequence(job.quota, source.entries_per_page(), job.page_cap);
        info!(pages = pages.len(), quota = job.quota, "starting harvest");

        let mut records: Vec<CanonicalRecord> = Vec::new();
        let mut page_failures = Vec::new();
        let mut pages_fetched = 0;
        let mut entries_filtered = 0;
        let mut entries_skipped = 0;

        for &page in &pages {
            let cancelled = || HarvestError::Cancelled {
                site: source,
                variant,
                page,
            };
            if cancel.is_cancelled() {
                info!(page, "harvest cancelled; discarding extracted records");
                return Err(cancelled());
            }

            let request = self
                .adapter
                .page_request(variant, page)
                .map_err(|e| HarvestError::Configuration(e.to_string()))?;

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(page, "harvest cancelled mid-fetch; discarding extracted records");
                    return Err(cancelled());
                }
                fetched = self.fetcher.fetch(&request) => fetched,
            };
            let raw = match fetched {
                Ok(raw) => raw,
                Err(error) if error.is_unrecoverable() => {
                    warn!(page, %error, "source refused access; aborting harvest");
                    return Err(HarvestError::Fetch {
                        site: source,
                        variant,
                        page,
                        error,
                    });
                }
                Err(error) => {
                    warn!(page, %error, "page fetch failed; continuing with remaining pages");
                    page_failures.push(PageFailure {
                        page,
                        kind: PageFailureKind::Fetch,
                        detail: error.to_string(),
                    });
                    continue;
                }
            };
            pages_fetched += 1;
            self.archive_page(variant, page, &raw).await;

            match self.adapter.extract(&raw.body, variant) {
                Ok(extraction) => {
                    debug!(
                        page,
                        records = extraction.records.len(),
                        filtered = extraction.filtered,
                        skipped = extraction.skipped.len(),
                        "page extracted"
                    );
                    entries_filtered += extraction.filtered;
                    entries_skipped += extraction.skipped.len();
                    records.extend(extraction.records);
                }
                Err(error) => {
                    warn!(page, %error, "page could not be extracted");
                    page_failures.push(PageFailure {
                        page,
                        kind: PageFailureKind::Extraction,
                        detail: error.to_string(),
                    });
                }
            }
        }

        let persistence = |error: anyhow::Error| HarvestError::Persistence {
            site: source,
            variant,
            error,
        };
        let summary = self
            .sink
            .persist(&records, source.as_str())
            .await
            .map_err(persistence)?;

        let stamped_at = Utc::now();
        self.sink
            .stamp(source, variant, stamped_at)
            .await
            .map_err(persistence)?;

        info!(
            records = records.len(),
            inserted = summary.inserted,
            updated = summary.updated,
            failed_pages = page_failures.len(),
            "harvest complete"
        );

        Ok(HarvestReport {
            run_id: job.run_id,
            source,
            variant,
            pages_planned: pages.len(),
            pages_fetched,
            page_failures,
            records_extracted: records.len(),
            entries_filtered,
            entries_skipped,
            inserted: summary.inserted,
            updated: summary.updated,
            stamped_at,
        })
    }

    async fn archive_page(&self, variant: Variant, page: u32, raw: &RawContent) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive
            .store_page(variant, page, self.adapter.archive_extension(), &raw.body)
            .await
        {
            Ok(stored) => debug!(
                page,
                path = %stored.relative_path.display(),
                sha256 = %stored.content_hash,
                "archived raw page"
            ),
            Err(err) => warn!(page, error = %format!("{err:#}"), "failed to archive raw page"),
        }
    }
}

impl std::fmt::Debug for SourceHarvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHarvester")
            .field("source", &self.adapter.source())
            .field("archive", &self.archive)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{royalroad_page, royalroad_url, Scripted, ScriptedFetcher};
    use super::*;
    use async_trait::async_trait;
    use frh_adapters::RoyalRoadAdapter;
    use frh_core::RoyalRoadPage;
    use frh_storage::{
        BulkWriteSummary, DocumentStore, DocumentUpsert, MemoryDocumentStore, PageFetcher,
        LAST_UPDATED_COLLECTION,
    };
    use serde_json::Value as JsonValue;
    use std::time::Duration;

    const BEST_RATED: Variant = Variant::RoyalRoad(RoyalRoadPage::BestRated);

    fn harvester(fetcher: Arc<dyn PageFetcher>, store: Arc<dyn DocumentStore>) -> SourceHarvester {
        SourceHarvester::new(
            Arc::new(RoyalRoadAdapter),
            Arc::new(RateLimitedFetcher::new(Source::RoyalRoad, fetcher, Duration::ZERO)),
            UpsertSink::new(store),
        )
    }

    fn three_page_job() -> HarvestJob {
        HarvestJob::new(BEST_RATED, 60, 10).unwrap()
    }

    /// Bulk writes always fail; single-field writes go through.
    #[derive(Debug, Default)]
    struct BrokenBulkStore {
        inner: MemoryDocumentStore,
    }

    #[async_trait]
    impl DocumentStore for BrokenBulkStore {
        async fn bulk_upsert(
            &self,
            _collection: &str,
            _upserts: Vec<DocumentUpsert>,
        ) -> anyhow::Result<BulkWriteSummary> {
            anyhow::bail!("connection reset by peer")
        }

        async fn set_field(
            &self,
            collection: &str,
            key: &str,
            field: &str,
            value: JsonValue,
        ) -> anyhow::Result<()> {
            self.inner.set_field(collection, key, field, value).await
        }
    }

    #[tokio::test]
    async fn failed_page_is_skipped_and_the_rest_persisted() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with(royalroad_url("best-rated", 1), Scripted::Body(royalroad_page(&["Mother of Learning", "The Wandering Inn"])))
                .with(royalroad_url("best-rated", 2), Scripted::Status(503))
                .with(royalroad_url("best-rated", 3), Scripted::Body(royalroad_page(&["Azarinth Healer"]))),
        );
        let store = Arc::new(MemoryDocumentStore::new());

        let report = harvester(fetcher.clone(), store.clone())
            .run(&three_page_job(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.pages_planned, 3);
        assert_eq!(report.pages_fetched, 2);
        assert_eq!(
            report.page_failures,
            vec![PageFailure {
                page: 2,
                kind: PageFailureKind::Fetch,
                detail: format!("http status 503 for {}", royalroad_url("best-rated", 2)),
            }]
        );
        assert_eq!(report.inserted, 3);
        assert_eq!(fetcher.requested().len(), 3);

        let stored = store.collection("royalroad").await;
        let titles: Vec<_> = stored.keys().map(String::as_str).collect();
        assert_eq!(titles, vec!["Azarinth Healer", "Mother of Learning", "The Wandering Inn"]);

        let stamp = store.document(LAST_UPDATED_COLLECTION, "royalroad").await.unwrap();
        assert_eq!(
            stamp.get("Best Rated"),
            Some(&JsonValue::String(report.stamped_at.to_rfc3339()))
        );
    }

    #[tokio::test]
    async fn second_run_updates_without_resetting_first_seen() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with(royalroad_url("best-rated", 1), Scripted::Body(royalroad_page(&["Mother of Learning"]))),
        );
        let store = Arc::new(MemoryDocumentStore::new());
        let harvester = harvester(fetcher, store.clone());
        let job = HarvestJob::new(BEST_RATED, 20, 10).unwrap();

        let first = harvester.run(&job, &CancellationToken::new()).await.unwrap();
        store
            .set_field("royalroad", "Mother of Learning", "is_new", JsonValue::Bool(false))
            .await
            .unwrap();
        let second = harvester.run(&job, &CancellationToken::new()).await.unwrap();

        assert_eq!((first.inserted, first.updated), (1, 0));
        assert_eq!((second.inserted, second.updated), (0, 1));
        let doc = store.document("royalroad", "Mother of Learning").await.unwrap();
        assert_eq!(doc.get("is_new"), Some(&JsonValue::Bool(false)));
    }

    #[tokio::test]
    async fn refused_access_aborts_before_anything_is_written() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with(royalroad_url("best-rated", 1), Scripted::Body(royalroad_page(&["Mother of Learning"])))
                .with(royalroad_url("best-rated", 2), Scripted::Forbidden),
        );
        let store = Arc::new(MemoryDocumentStore::new());

        let err = harvester(fetcher.clone(), store.clone())
            .run(&three_page_job(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, HarvestError::Fetch { page: 2, .. }));
        assert_eq!(fetcher.requested().len(), 2);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_leaves_the_previous_stamp() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with(royalroad_url("best-rated", 1), Scripted::Body(royalroad_page(&["Mother of Learning"]))),
        );
        let store = Arc::new(BrokenBulkStore::default());
        store
            .inner
            .set_field(
                LAST_UPDATED_COLLECTION,
                "royalroad",
                "Best Rated",
                JsonValue::String("2026-01-01T00:00:00+00:00".into()),
            )
            .await
            .unwrap();

        let err = harvester(fetcher, store.clone())
            .run(&HarvestJob::new(BEST_RATED, 20, 10).unwrap(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, HarvestError::Persistence { .. }));
        let stamp = store
            .inner
            .document(LAST_UPDATED_COLLECTION, "royalroad")
            .await
            .unwrap();
        assert_eq!(
            stamp.get("Best Rated"),
            Some(&JsonValue::String("2026-01-01T00:00:00+00:00".into()))
        );
    }

    #[tokio::test]
    async fn cancelled_job_fetches_and_persists_nothing() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let store = Arc::new(MemoryDocumentStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = harvester(fetcher.clone(), store.clone())
            .run(&three_page_job(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, HarvestError::Cancelled { page: 1, .. }));
        assert!(fetcher.requested().is_empty());
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_run_discards_pages_already_extracted() {
        let cancel = CancellationToken::new();
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with(royalroad_url("best-rated", 1), Scripted::Body(royalroad_page(&["Mother of Learning"])))
                .with(royalroad_url("best-rated", 2), Scripted::Stall(cancel.clone()))
                .with(royalroad_url("best-rated", 3), Scripted::Body(royalroad_page(&["Azarinth Healer"]))),
        );
        let store = Arc::new(MemoryDocumentStore::new());

        let err = harvester(fetcher.clone(), store.clone())
            .run(&three_page_job(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, HarvestError::Cancelled { page: 2, .. }));
        assert_eq!(
            fetcher.requested(),
            vec![royalroad_url("best-rated", 1), royalroad_url("best-rated", 2)]
        );
        assert!(store.collection("royalroad").await.is_empty());
        assert!(store.document(LAST_UPDATED_COLLECTION, "royalroad").await.is_none());
    }

    #[tokio::test]
    async fn empty_listing_still_stamps_the_variant() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with(royalroad_url("best-rated", 1), Scripted::Body(royalroad_page(&[]))),
        );
        let store = Arc::new(MemoryDocumentStore::new());

        let report = harvester(fetcher, store.clone())
            .run(&HarvestJob::new(BEST_RATED, 20, 10).unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.records_extracted, 0);
        assert!(report.page_failures.is_empty());
        assert!(store.collection("royalroad").await.is_empty());
        assert!(store.document(LAST_UPDATED_COLLECTION, "royalroad").await.is_some());
    }

    #[tokio::test]
    async fn job_for_another_source_is_rejected() {
        let store = Arc::new(MemoryDocumentStore::new());
        let job = HarvestJob::new(Source::AniList.default_variant(), 50, 1).unwrap();

        let err = harvester(Arc::new(ScriptedFetcher::default()), store)
            .run(&job, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Configuration(_)));
    }

    #[tokio::test]
    async fn raw_pages_are_archived_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with(royalroad_url("best-rated", 1), Scripted::Body(royalroad_page(&["Mother of Learning"]))),
        );
        let harvester = harvester(fetcher, Arc::new(MemoryDocumentStore::new()))
            .with_archive(Some(PageArchive::new(dir.path())));

        harvester
            .run(&HarvestJob::new(BEST_RATED, 20, 10).unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        let archived = std::fs::read(dir.path().join("royalroad/best-rated/1.html")).unwrap();
        assert_eq!(archived, royalroad_page(&["Mother of Learning"]));
    }
}
