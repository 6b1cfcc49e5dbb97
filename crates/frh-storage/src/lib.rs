//! Page fetching, per-source rate limiting, raw page archiving and document persistence for FRH.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use frh_core::{Source, Variant};
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod documents;
mod robots;

pub use documents::{
    BulkWriteSummary, Document, DocumentStore, DocumentUpsert, MemoryDocumentStore,
    PgDocumentStore, UpsertSink, LAST_UPDATED_COLLECTION,
};
pub use robots::RobotsTxt;

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Audit copy of every fetched page, laid out as `<source>/<variant>/<page>.<ext>`.
///
/// Nothing in the pipeline reads these files back; a later fetch of the same
/// page replaces the previous copy.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(&self, variant: Variant, page: u32, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(variant.source().as_str())
            .join(variant.slug())
            .join(format!("{page}.{ext}"))
    }

    /// Write the page through a temp file and an atomic rename.
    pub async fn store_page(
        &self,
        variant: Variant,
        page: u32,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(variant, page, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp archive file {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

/// What to ask a source for: a plain listing page or a JSON (GraphQL) query.
#[derive(Debug, Clone, PartialEq)]
pub enum PageRequest {
    Get { url: String },
    PostJson { url: String, body: JsonValue },
}

impl PageRequest {
    pub fn url(&self) -> &str {
        match self {
            PageRequest::Get { url } | PageRequest::PostJson { url, .. } => url,
        }
    }
}

/// Body of a successful response, exactly as the source returned it.
#[derive(Debug, Clone)]
pub struct RawContent {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("access denied (http {status}) for {url}")]
    Forbidden { status: u16, url: String },
    #[error("robots.txt disallows {url}")]
    Disallowed { url: String },
    #[error("{0}")]
    Transport(String),
}

impl FetchError {
    /// The source refuses us outright; retrying other pages is pointless.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            FetchError::Forbidden { .. } | FetchError::Disallowed { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|status| classify_status(status) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Forbidden { .. } | FetchError::Disallowed { .. } | FetchError::Transport(_) => {
                false
            }
        }
    }
}

/// Transport seam between the pipeline and whatever performs the network round-trip.
/// One call is one attempt; retries and pacing belong to [`RateLimitedFetcher`].
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, request: &PageRequest) -> Result<RawContent, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn is_access_denied(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS
    )
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

/// reqwest-backed transport. Per-source pacing and retries live in [`RateLimitedFetcher`].
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    fn build(&self, request: &PageRequest) -> reqwest::RequestBuilder {
        match request {
            PageRequest::Get { url } => self.client.get(url),
            PageRequest::PostJson { url, body } => self.client.post(url).json(body),
        }
    }

    async fn fetch_once(&self, request: &PageRequest) -> Result<RawContent, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Transport("http fetcher is shut down".to_string()))?;

        let resp = self.build(request).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if status.is_success() {
            let body = resp.bytes().await?.to_vec();
            return Ok(RawContent {
                status: status.as_u16(),
                final_url,
                body,
                fetched_at: Utc::now(),
            });
        }
        if is_access_denied(status) {
            return Err(FetchError::Forbidden {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, request: &PageRequest) -> Result<RawContent, FetchError> {
        let span = info_span!("http_fetch", url = request.url());
        self.fetch_once(request).instrument(span).await
    }
}

#[derive(Debug, Default)]
struct SourceSlot {
    last_request: Option<Instant>,
    robots: Option<RobotsTxt>,
}

/// Paces one source: a single request in flight, and at least `min_delay`
/// between the starts of consecutive requests, retries and robots.txt included.
pub struct RateLimitedFetcher {
    source: Source,
    transport: Arc<dyn PageFetcher>,
    min_delay: Duration,
    backoff: BackoffPolicy,
    robots_agent: Option<String>,
    slot: Mutex<SourceSlot>,
}

impl RateLimitedFetcher {
    pub fn new(source: Source, transport: Arc<dyn PageFetcher>, min_delay: Duration) -> Self {
        Self {
            source,
            transport,
            min_delay,
            backoff: BackoffPolicy::default(),
            robots_agent: None,
            slot: Mutex::new(SourceSlot::default()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check every request against the source's robots.txt, read once on first use.
    pub fn with_robots_txt(mut self, user_agent: impl Into<String>) -> Self {
        self.robots_agent = Some(user_agent.into());
        self
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub async fn fetch(&self, request: &PageRequest) -> Result<RawContent, FetchError> {
        // Held across every attempt: it is the per-source in-flight slot.
        let mut slot = self.slot.lock().await;

        if let Some(user_agent) = &self.robots_agent {
            let target = RobotsTarget::for_url(request.url())?;
            if slot.robots.is_none() {
                let robots = self.read_robots(&mut slot, &target.robots_url).await;
                slot.robots = Some(robots);
            }
            let allowed = slot
                .robots
                .as_ref()
                .map_or(true, |robots| robots.is_allowed(user_agent, &target.path));
            if !allowed {
                return Err(FetchError::Disallowed {
                    url: request.url().to_string(),
                });
            }
        }

        let mut attempt = 0;
        let mut not_before = None;
        loop {
            self.wait_turn(&mut slot, not_before).await;
            match self.transport.fetch(request).await {
                Err(error) if error.is_retryable() && attempt < self.backoff.max_retries => {
                    let backoff = self.backoff.delay_for_attempt(attempt);
                    debug!(source = %self.source, %error, attempt, ?backoff, "retrying request");
                    not_before = Some(Instant::now() + backoff);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn wait_turn(&self, slot: &mut SourceSlot, not_before: Option<Instant>) {
        let delay_until = slot.last_request.map(|previous| previous + self.min_delay);
        let ready_at = match (delay_until, not_before) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if let Some(ready_at) = ready_at {
            if Instant::now() < ready_at {
                debug!(source = %self.source, "waiting out download delay");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        slot.last_request = Some(Instant::now());
    }

    async fn read_robots(&self, slot: &mut SourceSlot, robots_url: &str) -> RobotsTxt {
        self.wait_turn(slot, None).await;
        let request = PageRequest::Get {
            url: robots_url.to_string(),
        };
        match self.transport.fetch(&request).await {
            Ok(raw) => RobotsTxt::parse(&String::from_utf8_lossy(&raw.body)),
            Err(error) => {
                warn!(source = %self.source, %error, "robots.txt unavailable; treating every path as allowed");
                RobotsTxt::default()
            }
        }
    }
}

struct RobotsTarget {
    robots_url: String,
    path: String,
}

impl RobotsTarget {
    fn for_url(url: &str) -> Result<Self, FetchError> {
        let invalid = |e: String| FetchError::Transport(format!("invalid url `{url}`: {e}"));
        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        let robots_url = parsed
            .join("/robots.txt")
            .map_err(|e| invalid(e.to_string()))?
            .to_string();
        let path = match parsed.query() {
            Some(query) => format!("{}?{query}", parsed.path()),
            None => parsed.path().to_string(),
        };
        Ok(Self { robots_url, path })
    }
}

impl std::fmt::Debug for RateLimitedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedFetcher")
            .field("source", &self.source)
            .field("min_delay", &self.min_delay)
            .field("backoff", &self.backoff)
            .field("robots_agent", &self.robots_agent)
            .finish_non_exhaustive()
    }
}
