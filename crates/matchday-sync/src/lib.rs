//! Crawl orchestration: source registry, ingestion sink, and the per-source
//! crawl driver.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use matchday_adapters::{
    adapter_for_source, extract_page, SourceAdapter, LIVE_FOOTBALL_ON_TV_SOURCE_ID,
    SKYSPORTS_SOURCE_ID,
};
use matchday_core::{DateLabelStyle, FixtureRecord, RawFixture};
use matchday_storage::{
    FetchedPage, FetchError, FixtureStore, HttpClientConfig, HttpFetcher, PageArchive, PageFetcher,
    StoreConfig,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchday-sync";

const MAX_CONCURRENCY: usize = 16;

fn default_true() -> bool {
    true
}

fn default_date_format() -> String {
    "%Y%m%d".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Pages that must be fetched; any failure aborts the source run.
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub rolling_window: Option<RollingWindowConfig>,
}

/// One page per day from the run date, `{date}` in the template replaced by
/// the day formatted with `date_format`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingWindowConfig {
    pub url_template: String,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    pub horizon_days: u32,
}

impl RollingWindowConfig {
    pub fn urls(&self, start: NaiveDate, horizon_days: u32) -> Result<Vec<String>> {
        (0..horizon_days)
            .filter_map(|offset| start.checked_add_days(Days::new(u64::from(offset))))
            .map(|day| -> Result<String> {
                Ok(self.url_template.replace("{date}", &self.format_day(day)?))
            })
            .collect()
    }

    /// Formats fail on specifiers a bare date cannot fill, such as `%H`.
    fn format_day(&self, day: NaiveDate) -> Result<String> {
        let mut out = String::new();
        write!(out, "{}", day.format(&self.date_format)).map_err(|_| {
            anyhow!(
                "rolling window date_format {:?} cannot format a calendar date",
                self.date_format
            )
        })?;
        Ok(out)
    }

    fn validate(&self, source_id: &str) -> Result<()> {
        if !self.url_template.contains("{date}") {
            bail!("rolling window url_template for {source_id} has no {{date}} placeholder");
        }
        if StrftimeItems::new(&self.date_format).any(|item| matches!(item, Item::Error)) {
            bail!(
                "rolling window date_format {:?} for {source_id} is not a valid strftime format",
                self.date_format
            );
        }
        self.format_day(NaiveDate::MIN)
            .with_context(|| format!("validating rolling window for {source_id}"))?;
        Ok(())
    }
}

impl SourceRegistry {
    /// The two listings this project was built for.
    pub fn builtin() -> Self {
        Self {
            sources: vec![
                SourceConfig {
                    source_id: SKYSPORTS_SOURCE_ID.to_string(),
                    display_name: "Sky Sports".to_string(),
                    enabled: true,
                    listing_urls: vec!["https://www.skysports.com/watch/football-on-sky".to_string()],
                    rolling_window: Some(RollingWindowConfig {
                        url_template: "https://www.skysports.com/watch/liveonsky/more/football/{date}"
                            .to_string(),
                        date_format: default_date_format(),
                        horizon_days: 300,
                    }),
                },
                SourceConfig {
                    source_id: LIVE_FOOTBALL_ON_TV_SOURCE_ID.to_string(),
                    display_name: "Live Football On TV".to_string(),
                    enabled: true,
                    listing_urls: vec!["https://www.live-footballontv.com".to_string()],
                    rolling_window: None,
                },
            ],
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Reads `path` when it exists, otherwise the built-in registry.
    pub async fn load_or_builtin(path: &Path) -> Result<Self> {
        let exists = fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if exists {
            Self::load(path).await
        } else {
            debug!(path = %path.display(), "source registry file missing; using built-in sources");
            Ok(Self::builtin())
        }
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    fn validate(&self) -> Result<()> {
        for source in &self.sources {
            if source.listing_urls.is_empty() && source.rolling_window.is_none() {
                bail!("source {} has neither listing_urls nor rolling_window", source.source_id);
            }
            if let Some(window) = &source.rolling_window {
                window.validate(&source.source_id)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub concurrency: usize,
    pub horizon_days_override: Option<u32>,
    pub archive_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://football.db".to_string()),
            sources_path: std::env::var("MATCHDAY_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            user_agent: std::env::var("MATCHDAY_USER_AGENT")
                .unwrap_or_else(|_| "matchday-bot/0.1 (+football fixture listings)".to_string()),
            http_timeout_secs: std::env::var("MATCHDAY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            concurrency: std::env::var("MATCHDAY_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            horizon_days_override: std::env::var("MATCHDAY_HORIZON_DAYS")
                .ok()
                .and_then(|v| v.parse().ok()),
            archive_dir: std::env::var("MATCHDAY_ARCHIVE_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.database_url.clone())
    }
}

/// Normalizes raw fixtures and persists them at most once per natural
/// identity.
#[derive(Debug, Clone)]
pub struct IngestionSink {
    store: FixtureStore,
}

impl IngestionSink {
    pub fn new(store: FixtureStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &FixtureStore {
        &self.store
    }

    pub fn normalize(raw: RawFixture, style: DateLabelStyle, reference: NaiveDate) -> FixtureRecord {
        let label = raw.date_label.clone();
        let record = FixtureRecord::from_raw(raw, style, reference);
        if record.date.is_empty() {
            debug!(date_label = %label, "unparseable date label; storing with empty date");
        }
        record
    }

    /// Returns whether a new row was created.
    pub async fn ingest(
        &self,
        raw: RawFixture,
        style: DateLabelStyle,
        reference: NaiveDate,
    ) -> Result<bool> {
        let record = Self::normalize(raw, style, reference);
        self.store
            .insert_if_absent(&record)
            .await
            .context("inserting fixture")
    }

    /// Ingests one page atomically. Returns the number of rows created.
    pub async fn ingest_page(
        &self,
        raws: Vec<RawFixture>,
        style: DateLabelStyle,
        reference: NaiveDate,
    ) -> Result<usize> {
        let records: Vec<FixtureRecord> = raws
            .into_iter()
            .map(|raw| Self::normalize(raw, style, reference))
            .collect();
        self.store
            .insert_page(&records)
            .await
            .context("inserting page fixtures")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub reference_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_attempted: usize,
    pub pages_fetched: usize,
    pub pages_skipped: usize,
    pub extracted: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct PageCounts {
    extracted: usize,
    inserted: usize,
}

pub struct CrawlDriver {
    fetcher: Arc<dyn PageFetcher>,
    sink: IngestionSink,
    archive: Option<PageArchive>,
    concurrency: usize,
    horizon_days_override: Option<u32>,
}

impl CrawlDriver {
    pub fn new(fetcher: Arc<dyn PageFetcher>, sink: IngestionSink) -> Self {
        Self {
            fetcher,
            sink,
            archive: None,
            concurrency: 8,
            horizon_days_override: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }

    pub fn with_horizon_override(mut self, horizon_days: Option<u32>) -> Self {
        self.horizon_days_override = horizon_days;
        self
    }

    pub fn with_archive(mut self, archive: Option<PageArchive>) -> Self {
        self.archive = archive;
        self
    }

    /// Opens the store (applying migrations) and the HTTP client described by
    /// `config`.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = FixtureStore::open(&config.store_config())
            .await
            .with_context(|| format!("opening store {}", config.database_url))?;
        store.migrate().await.context("applying store migrations")?;

        let concurrency = config.concurrency.clamp(1, MAX_CONCURRENCY);
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: MAX_CONCURRENCY,
            per_source_concurrency: concurrency,
        })?;

        Ok(Self::new(Arc::new(http), IngestionSink::new(store))
            .with_concurrency(concurrency)
            .with_horizon_override(config.horizon_days_override)
            .with_archive(config.archive_dir.clone().map(PageArchive::new)))
    }

    pub fn sink(&self) -> &IngestionSink {
        &self.sink
    }

    pub async fn run_source(&self, source: &SourceConfig) -> Result<SourceRunSummary> {
        self.run_source_at(source, Local::now().date_naive()).await
    }

    /// Crawls one source with `today` as both window start and the reference
    /// date for year-elided labels.
    pub async fn run_source_at(
        &self,
        source: &SourceConfig,
        today: NaiveDate,
    ) -> Result<SourceRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let adapter = adapter_for_source(&source.source_id)?;
        let adapter = adapter.as_ref();
        info!(%run_id, source_id = %source.source_id, %today, "source run started");

        let mut pages_attempted = 0usize;
        let mut pages_fetched = 0usize;
        let mut totals = PageCounts::default();

        for url in &source.listing_urls {
            pages_attempted += 1;
            let page = self
                .fetch(run_id, &source.source_id, url)
                .await
                .with_context(|| format!("fetching mandatory page {url}"))?;
            pages_fetched += 1;
            let counts = self
                .ingest_body(adapter, &page, today)
                .await
                .with_context(|| format!("ingesting {url}"))?;
            totals.extracted += counts.extracted;
            totals.inserted += counts.inserted;
        }

        let window_urls = match &source.rolling_window {
            Some(window) => {
                let horizon = self.horizon_days_override.unwrap_or(window.horizon_days);
                window.urls(today, horizon)?
            }
            None => Vec::new(),
        };
        pages_attempted += window_urls.len();

        // The first store failure drops the stream, cancelling outstanding fetches.
        let source_id = source.source_id.as_str();
        let (window_fetched, window_totals) = stream::iter(window_urls)
            .map(move |url| async move {
                match self.fetch(run_id, source_id, &url).await {
                    Ok(page) => self
                        .ingest_body(adapter, &page, today)
                        .await
                        .map(Some)
                        .with_context(|| format!("ingesting {url}")),
                    Err(err) => {
                        warn!(%run_id, source_id, url = %url, error = %err, "skipping unavailable page");
                        Ok(None)
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .try_fold((0usize, PageCounts::default()), |(fetched, mut sum), page| async move {
                Ok::<_, anyhow::Error>(match page {
                    Some(counts) => {
                        sum.extracted += counts.extracted;
                        sum.inserted += counts.inserted;
                        (fetched + 1, sum)
                    }
                    None => (fetched, sum),
                })
            })
            .await?;
        pages_fetched += window_fetched;
        totals.extracted += window_totals.extracted;
        totals.inserted += window_totals.inserted;

        let summary = SourceRunSummary {
            run_id,
            source_id: source.source_id.clone(),
            reference_date: today,
            started_at,
            finished_at: Utc::now(),
            pages_attempted,
            pages_fetched,
            pages_skipped: pages_attempted - pages_fetched,
            extracted: totals.extracted,
            inserted: totals.inserted,
        };
        info!(
            %run_id,
            source_id = %summary.source_id,
            pages_fetched = summary.pages_fetched,
            pages_skipped = summary.pages_skipped,
            extracted = summary.extracted,
            inserted = summary.inserted,
            "source run finished"
        );
        Ok(summary)
    }

    /// Runs every enabled source. A failed source does not stop the others.
    pub async fn run_all(&self, registry: &SourceRegistry) -> Vec<(String, Result<SourceRunSummary>)> {
        let mut out = Vec::new();
        for source in registry.sources.iter().filter(|s| s.enabled) {
            let result = self.run_source(source).await;
            if let Err(err) = &result {
                warn!(source_id = %source.source_id, error = %format!("{err:#}"), "source run failed");
            }
            out.push((source.source_id.clone(), result));
        }
        out
    }

    async fn fetch(&self, run_id: Uuid, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let page = self.fetcher.fetch_page(run_id, source_id, url).await?;
        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .archive_page(Local::now().date_naive(), source_id, &page.body)
                .await
            {
                warn!(source_id, url, error = %format!("{err:#}"), "failed to archive page");
            }
        }
        Ok(page)
    }

    async fn ingest_body(
        &self,
        adapter: &dyn SourceAdapter,
        page: &FetchedPage,
        reference: NaiveDate,
    ) -> Result<PageCounts> {
        let raws = extract_page(adapter, &page.text());
        let extracted = raws.len();
        let inserted = self
            .sink
            .ingest_page(raws, adapter.date_label_style(), reference)
            .await?;
        debug!(url = %page.final_url, extracted, inserted, "page ingested");
        Ok(PageCounts { extracted, inserted })
    }
}

async fn registry_from_config(config: &SyncConfig) -> Result<SourceRegistry> {
    SourceRegistry::load_or_builtin(&config.sources_path).await
}

/// Crawls one source using environment configuration.
pub async fn run_source_from_env(source_id: &str) -> Result<SourceRunSummary> {
    let config = SyncConfig::from_env();
    let registry = registry_from_config(&config).await?;
    let source = registry
        .find(source_id)
        .with_context(|| format!("source {source_id} is not in the registry"))?
        .clone();
    let driver = CrawlDriver::from_config(&config).await?;
    driver.run_source(&source).await
}

/// Crawls every enabled source using environment configuration.
pub async fn run_sync_once_from_env() -> Result<Vec<(String, Result<SourceRunSummary>)>> {
    let config = SyncConfig::from_env();
    let registry = registry_from_config(&config).await?;
    let driver = CrawlDriver::from_config(&config).await?;
    Ok(driver.run_all(&registry).await)
}
