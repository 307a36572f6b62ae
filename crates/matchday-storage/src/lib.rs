//! Fixture persistence (SQLite via sqlx), raw page archival, and the HTTP page
//! fetcher used by the crawl driver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use matchday_core::{FixtureRecord, StoredFixture};
use sha2::{Digest, Sha256};
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, Row, Sqlite};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchday-storage";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const INSERT_IF_ABSENT_SQL: &str = "INSERT INTO matches (date, home_team, away_team, time, competition, channel) \
     VALUES (?, ?, ?, ?, ?, ?) \
     ON CONFLICT (date, home_team, away_team, time) DO NOTHING";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] MigrateError),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(10),
        }
    }

    /// Private in-memory database; a single connection keeps every query on
    /// the same database.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_timeout: Duration::from_secs(10),
        }
    }
}

/// Handle to the `matches` table. Clones share the pool and the writer lock.
#[derive(Debug, Clone)]
pub struct FixtureStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl FixtureStore {
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Applies the embedded migrations, including the natural-identity index.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Inserts one record unless its natural identity is already stored.
    /// Returns whether a row was created.
    pub async fn insert_if_absent(&self, record: &FixtureRecord) -> Result<bool, StoreError> {
        let _writer = self.write_lock.lock().await;
        Ok(insert_fixture(&self.pool, record).await?)
    }

    /// Inserts one page worth of records in a single transaction and returns
    /// the number of rows created.
    pub async fn insert_page(&self, records: &[FixtureRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for record in records {
            match insert_fixture(&mut *tx, record).await {
                Ok(true) => inserted += 1,
                Ok(false) => debug!(
                    date = %record.date,
                    home_team = %record.home_team,
                    away_team = %record.away_team,
                    "fixture already stored"
                ),
                Err(err) => {
                    tx.rollback().await?;
                    return Err(err.into());
                }
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Closes the pool. Later calls fail with a database error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM matches")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Every stored fixture ordered by date, kickoff time, then id.
    pub async fn list_all(&self) -> Result<Vec<StoredFixture>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, date, home_team, away_team, time, competition, channel \
             FROM matches ORDER BY date, time, id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            // Legacy tables predating 0001 allow NULL text columns.
            let text = |column: &str| -> Result<String, sqlx::Error> {
                Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
            };
            out.push(StoredFixture {
                id: row.try_get("id")?,
                fixture: FixtureRecord {
                    date: text("date")?,
                    home_team: text("home_team")?,
                    away_team: text("away_team")?,
                    time: text("time")?,
                    competition: text("competition")?,
                    channel: text("channel")?,
                },
            });
        }
        Ok(out)
    }
}

async fn insert_fixture<'e, E>(executor: E, record: &FixtureRecord) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(INSERT_IF_ABSENT_SQL)
        .bind(record.date.as_str())
        .bind(record.home_team.as_str())
        .bind(record.away_team.as_str())
        .bind(record.time.as_str())
        .bind(record.competition.as_str())
        .bind(record.channel.as_str())
        .execute(executor)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Where an archived body landed and whether this call wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPage {
    pub path: PathBuf,
    pub written: bool,
}

/// Keeps every fetched listing body under `<root>/<source>/<YYYYMMDD>/<sha256>.html`.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn page_path(&self, fetched_on: NaiveDate, source_id: &str, body: &[u8]) -> PathBuf {
        let digest = hex::encode(Sha256::digest(body));
        self.root
            .join(source_id)
            .join(fetched_on.format("%Y%m%d").to_string())
            .join(format!("{digest}.html"))
    }

    /// A body already archived for that source and day is left untouched.
    pub async fn archive_page(
        &self,
        fetched_on: NaiveDate,
        source_id: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let path = self.page_path(fetched_on, source_id, body);
        let day_dir = path.parent().unwrap_or(self.root.as_path()).to_path_buf();
        fs::create_dir_all(&day_dir)
            .await
            .with_context(|| format!("cannot create page archive dir {}", day_dir.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("cannot stat archived page {}", path.display()))?
        {
            return Ok(ArchivedPage { path, written: false });
        }

        // Readers never observe a half-written page.
        let partial = day_dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&partial, body)
            .await
            .with_context(|| format!("cannot write {}", partial.display()))?;
        if let Err(err) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err).with_context(|| format!("cannot move page into {}", path.display()));
        }

        debug!(source_id, path = %path.display(), bytes = body.len(), "page archived");
        Ok(ArchivedPage { path, written: true })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 8,
        }
    }
}

/// A successful (2xx) response body.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrieves one page. Any non-2xx response is an error.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
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
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "page fetched");
            Ok(FetchedPage { final_url, body })
        }
        .instrument(span)
        .await
    }
}
