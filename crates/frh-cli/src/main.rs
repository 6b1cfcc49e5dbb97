use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use frh_core::{Source, DEFAULT_QUERY_LIMIT};
use frh_storage::{DocumentStore, HttpFetcher, MemoryDocumentStore, PgDocumentStore};
use frh_sync::{build_scheduler, HarvestConfig, HarvestRegistry, HarvestReport, JobsFile};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "frh")]
#[command(about = "Fiction ranking harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest one source listing once.
    Harvest {
        #[arg(long)]
        source: Source,
        /// Variant label or slug; defaults to the source's default listing.
        #[arg(long)]
        variant: Option<String>,
        #[arg(long)]
        query_limit: Option<u32>,
        #[arg(long)]
        max_pages: Option<u32>,
        /// Keep records in process memory instead of PostgreSQL.
        #[arg(long)]
        memory: bool,
    },
    /// Run every job of the jobs file once, concurrently.
    RunAll {
        #[arg(long)]
        jobs: Option<PathBuf>,
        #[arg(long)]
        memory: bool,
    },
    /// Run the jobs file on its cron schedules until Ctrl-C.
    Schedule {
        #[arg(long)]
        jobs: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// List sources, variants and their defaults.
    Variants,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::RunAll {
        jobs: None,
        memory: false,
    }) {
        Commands::Harvest {
            source,
            variant,
            query_limit,
            max_pages,
            memory,
        } => {
            let config = HarvestConfig::from_env()?;
            let registry = build_registry(&config, memory).await?;
            let job = registry.job(source, variant.as_deref(), query_limit, max_pages)?;
            let report = registry.run(&job, &shutdown_token()).await?;
            print_report(&report);
        }
        Commands::RunAll { jobs, memory } => {
            let config = HarvestConfig::from_env()?;
            let registry = build_registry(&config, memory).await?;
            let path = jobs.unwrap_or_else(|| config.jobs_file.clone());
            let file = JobsFile::load(&path).await?;
            let jobs = file
                .jobs
                .iter()
                .map(|entry| registry.job_from_entry(entry))
                .collect::<Result<Vec<_>, _>>()?;

            let total = jobs.len();
            let mut failed = 0;
            for (job, result) in registry.run_all(jobs, &shutdown_token()).await {
                match result {
                    Ok(report) => print_report(&report),
                    Err(err) => {
                        failed += 1;
                        eprintln!("harvest failed: run_id={} error={err}", job.run_id);
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {total} harvest jobs failed");
            }
        }
        Commands::Schedule { jobs } => {
            let config = HarvestConfig::from_env()?;
            let registry = Arc::new(build_registry(&config, false).await?);
            let path = jobs.unwrap_or_else(|| config.jobs_file.clone());
            let file = JobsFile::load(&path).await?;

            let cancel = CancellationToken::new();
            let mut sched = build_scheduler(registry, &file, cancel.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(jobs = file.jobs.len(), file = %path.display(), "scheduler running; Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            warn!("shutting down scheduler");
            cancel.cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
            let store = PgDocumentStore::connect(&url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Variants => {
            for source in Source::ALL {
                println!(
                    "{source}: {} entries/page, default max pages {}, default query limit {}",
                    source.entries_per_page(),
                    source.default_max_pages(),
                    DEFAULT_QUERY_LIMIT
                );
                let default = source.default_variant();
                for variant in source.variants() {
                    let marker = if variant == default { " (default)" } else { "" };
                    println!("  {:<20} {}{marker}", variant.slug(), variant.label());
                }
            }
        }
    }

    Ok(())
}

async fn build_registry(config: &HarvestConfig, memory: bool) -> Result<HarvestRegistry> {
    let store: Arc<dyn DocumentStore> = if memory {
        warn!("using the in-memory store; records are discarded on exit");
        Arc::new(MemoryDocumentStore::new())
    } else {
        Arc::new(PgDocumentStore::connect(config.database_url()?).await?)
    };
    let transport = Arc::new(HttpFetcher::new(config.http_client_config())?);
    Ok(HarvestRegistry::new(config, transport, store))
}

/// Token cancelled on the first Ctrl-C; running harvests stop before their next fetch.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling harvests");
            trigger.cancel();
        }
    });
    token
}

fn print_report(report: &HarvestReport) {
    println!(
        "harvest complete: run_id={} source={} variant={} pages={}/{} records={} inserted={} updated={} failed_pages={} stamped_at={}",
        report.run_id,
        report.source,
        report.variant,
        report.pages_fetched,
        report.pages_planned,
        report.records_extracted,
        report.inserted,
        report.updated,
        report.page_failures.len(),
        report.stamped_at.to_rfc3339()
    );
}
