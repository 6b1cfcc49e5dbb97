use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use frh_core::Source;
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{HarvestError, HarvestRegistry};

/// The jobs file: which (source, variant) pairs to harvest, and when.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobsFile {
    pub jobs: Vec<ScheduledJob>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScheduledJob {
    pub source: Source,
    #[serde(default)]
    pub variant: Option<String>,
    /// Six-field cron expression (seconds first). Jobs without one only run via `run-all`.
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub query_limit: Option<u32>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

impl JobsFile {
    pub fn parse(text: &str) -> Result<Self, HarvestError> {
        serde_yaml::from_str(text)
            .map_err(|e| HarvestError::Configuration(format!("invalid jobs file: {e}")))
    }

    pub async fn load(path: &Path) -> Result<Self, HarvestError> {
        let text = fs::read_to_string(path).await.map_err(|e| {
            HarvestError::Configuration(format!("reading {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }
}

/// One cron job per scheduled entry. Every tick builds a fresh job (new run id)
/// from the entry; the scheduler is returned unstarted.
pub async fn build_scheduler(
    registry: Arc<HarvestRegistry>,
    jobs: &JobsFile,
    cancel: CancellationToken,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    for entry in &jobs.jobs {
        let Some(cron) = entry.cron.clone() else {
            warn!(source = %entry.source, "jobs file entry has no cron; not scheduling it");
            continue;
        };
        registry
            .job_from_entry(entry)
            .with_context(|| format!("invalid jobs file entry for {}", entry.source))?;

        let job_registry = registry.clone();
        let job_entry = entry.clone();
        let job_cancel = cancel.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let registry = job_registry.clone();
            let entry = job_entry.clone();
            let cancel = job_cancel.clone();
            Box::pin(async move {
                if cancel.is_cancelled() {
                    return;
                }
                let job = match registry.job_from_entry(&entry) {
                    Ok(job) => job,
                    Err(err) => {
                        error!(source = %entry.source, %err, "scheduled job could not be built");
                        return;
                    }
                };
                match registry.run(&job, &cancel).await {
                    Ok(report) => info!(
                        run_id = %report.run_id,
                        source = %report.source,
                        variant = %report.variant,
                        inserted = report.inserted,
                        updated = report.updated,
                        "scheduled harvest finished"
                    ),
                    Err(err) => error!(run_id = %job.run_id, %err, "scheduled harvest failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(source = %entry.source, cron = %cron, "scheduled harvest job");
    }

    Ok(sched)
}
