use std::collections::BTreeMap;
use std::sync::Arc;

use frh_adapters::{adapter_for_source, SourceAdapter};
use frh_core::{HarvestJob, Source, Variant, DEFAULT_QUERY_LIMIT};
use frh_storage::{DocumentStore, PageArchive, PageFetcher, RateLimitedFetcher, UpsertSink};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{HarvestConfig, HarvestError, HarvestReport, ScheduledJob, SourceHarvester};

/// Everything a job needs, wired once per process: one adapter and one
/// rate-limited fetcher per source, a shared sink and the optional archive.
pub struct HarvestRegistry {
    adapters: BTreeMap<Source, Arc<dyn SourceAdapter>>,
    fetchers: BTreeMap<Source, Arc<RateLimitedFetcher>>,
    sink: UpsertSink,
    archive: Option<PageArchive>,
}

impl HarvestRegistry {
    pub fn new(
        config: &HarvestConfig,
        transport: Arc<dyn PageFetcher>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let adapters = Source::ALL
            .into_iter()
            .map(|source| (source, Arc::from(adapter_for_source(source))))
            .collect();
        let fetchers = Source::ALL
            .into_iter()
            .map(|source| {
                let mut fetcher =
                    RateLimitedFetcher::new(source, transport.clone(), config.download_delay);
                if source.obeys_robots_txt() {
                    fetcher = fetcher.with_robots_txt(config.user_agent.clone());
                }
                (source, Arc::new(fetcher))
            })
            .collect();
        Self {
            adapters,
            fetchers,
            sink: UpsertSink::new(store),
            archive: config.archive_dir.clone().map(PageArchive::new),
        }
    }

    /// Build a job, filling in the source's default variant, the default
    /// quota and the source's default page cap.
    pub fn job(
        &self,
        source: Source,
        variant: Option<&str>,
        query_limit: Option<u32>,
        max_pages: Option<u32>,
    ) -> Result<HarvestJob, HarvestError> {
        let variant = match variant {
            Some(input) => Variant::parse(source, input)?,
            None => source.default_variant(),
        };
        let job = HarvestJob::new(
            variant,
            query_limit.unwrap_or(DEFAULT_QUERY_LIMIT),
            max_pages.unwrap_or_else(|| source.default_max_pages()),
        )?;
        Ok(job)
    }

    pub fn job_from_entry(&self, entry: &ScheduledJob) -> Result<HarvestJob, HarvestError> {
        self.job(
            entry.source,
            entry.variant.as_deref(),
            entry.query_limit,
            entry.max_pages,
        )
    }

    pub fn harvester(&self, source: Source) -> Result<SourceHarvester, HarvestError> {
        let missing = || HarvestError::Configuration(format!("no harvester wired for {source}"));
        let adapter = self.adapters.get(&source).ok_or_else(missing)?;
        let fetcher = self.fetchers.get(&source).ok_or_else(missing)?;
        Ok(
            SourceHarvester::new(adapter.clone(), fetcher.clone(), self.sink.clone())
                .with_archive(self.archive.clone()),
        )
    }

    pub async fn run(
        &self,
        job: &HarvestJob,
        cancel: &CancellationToken,
    ) -> Result<HarvestReport, HarvestError> {
        self.harvester(job.source())?.run(job, cancel).await
    }

    /// Run every job as its own task. Jobs for different sources overlap;
    /// jobs for the same source queue on that source's fetcher.
    /// Results come back in the order the jobs were given.
    pub async fn run_all(
        &self,
        jobs: Vec<HarvestJob>,
        cancel: &CancellationToken,
    ) -> Vec<(HarvestJob, Result<HarvestReport, HarvestError>)> {
        let mut tasks = JoinSet::new();
        let mut results = Vec::with_capacity(jobs.len());

        for (index, job) in jobs.into_iter().enumerate() {
            let harvester = match self.harvester(job.source()) {
                Ok(harvester) => harvester,
                Err(err) => {
                    results.push((index, job, Err(err)));
                    continue;
                }
            };
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = harvester.run(&job, &cancel).await;
                (index, job, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(err) => error!(%err, "harvest task ended without a result"),
            }
        }

        results.sort_by_key(|(index, _, _)| *index);
        results
            .into_iter()
            .map(|(_, job, result)| (job, result))
            .collect()
    }
}

impl std::fmt::Debug for HarvestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestRegistry")
            .field("fetchers", &self.fetchers)
            .field("archive", &self.archive)
            .finish_non_exhaustive()
    }
}
