//! Raw artifact storage, rate-limit aware HTTP fetch and per-run SQLite storage for lotwatch.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use lotwatch_core::{
    ColumnSet, Entry, EntryId, MetricCategory, MetricSet, Offer, RunId, RunIdError, RunRef,
    SubEntry, BASE_COLUMNS,
};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::Url;

pub const CRATE_NAME: &str = "lotwatch-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed store for raw pages captured during a run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
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

    pub fn artifact_relative_path(
        &self,
        run: &RunId,
        kind: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(run.as_str())
            .join(kind)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        run: &RunId,
        kind: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(run, kind, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Rate limited: wait for the server's hint and try again.
    RateLimited,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Reads a `Retry-After` value in whole seconds; anything else falls back to `default`.
pub fn parse_retry_after(value: Option<&str>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, the first request included.
    pub max_attempts: usize,
    pub default_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            default_retry_after: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("still rate limited after {attempts} attempts for {url}")]
    ExhaustedRetries { url: String, attempts: usize },
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Request { .. } => "fetch_error",
            FetchError::HttpStatus { .. } => "fetch_error",
            FetchError::ExhaustedRetries { .. } => "exhausted_retries",
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
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
            retry: config.retry,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// One GET, no retry. Any non-2xx status is an error.
    pub async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, mode = "once");
        async {
            let resp = self.send(url).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = read_body(url, resp).await?;
            Ok(FetchedResponse {
                status,
                final_url,
                body,
                attempts: 1,
            })
        }
        .instrument(span)
        .await
    }

    /// GET that honours HTTP 429 `Retry-After`; every other failure is returned immediately.
    pub async fn fetch_with_retry(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, mode = "retry");
        let max_attempts = self.retry.max_attempts.max(1);
        async {
            for attempt in 1..=max_attempts {
                let resp = self.send(url).await?;
                let status = resp.status();
                let final_url = resp.url().to_string();

                if status.is_success() {
                    let body = read_body(url, resp).await?;
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                        attempts: attempt,
                    });
                }

                if classify_status(status) == RetryDisposition::NonRetryable {
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }

                if attempt == max_attempts {
                    break;
                }

                let hint = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok());
                let delay = parse_retry_after(hint, self.retry.default_retry_after);
                warn!(attempt, delay_secs = delay.as_secs_f64(), "rate limited; backing off");
                tokio::time::sleep(delay).await;
            }

            Err(FetchError::ExhaustedRetries {
                url: url.to_string(),
                attempts: max_attempts,
            })
        }
        .instrument(span)
        .await
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        self.client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })
    }
}

async fn read_body(url: &str, resp: reqwest::Response) -> Result<Vec<u8>, FetchError> {
    resp.bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("entry {id} is not part of run {run}")]
    UnknownEntry { run: RunId, id: EntryId },
    #[error("run {0} has no storage tables")]
    UnknownRun(String),
    #[error(transparent)]
    RunId(#[from] RunIdError),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Sqlx(_) => "storage_error",
            StoreError::UnknownEntry { .. } => "unknown_entry",
            StoreError::UnknownRun(_) => "unknown_run",
            StoreError::RunId(_) => "invalid_run_id",
        }
    }
}

const ENTRIES: &str = "entries";
const LOTS: &str = "lots";
const OFFERS: &str = "offers";

/// Durable state of ingestion runs in one SQLite database.
///
/// The pool holds a single connection, so every statement goes through one
/// serialized access path.
#[derive(Debug)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_registry().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    /// Releases the connection. Dropping the store also releases it, without waiting.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_registry(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn new_or_resume_run(&self) -> Result<RunRef, StoreError> {
        self.new_or_resume_run_at(Utc::now()).await
    }

    /// Registers the run for `now`; on a same-second collision the latest registered run is resumed.
    pub async fn new_or_resume_run_at(&self, now: DateTime<Utc>) -> Result<RunRef, StoreError> {
        let candidate = RunId::from_timestamp(now);
        let inserted = sqlx::query("INSERT OR IGNORE INTO runs (run_id, started_at) VALUES (?, ?)")
            .bind(candidate.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let run = if inserted == 1 {
            RunRef {
                id: candidate,
                resumed: false,
            }
        } else {
            let latest = self
                .latest_run()
                .await?
                .ok_or_else(|| StoreError::UnknownRun(candidate.to_string()))?;
            RunRef {
                id: latest,
                resumed: true,
            }
        };

        self.create_run_tables(&run.id).await?;
        info!(run_id = %run.id, resumed = run.resumed, "run registered");
        Ok(run)
    }

    async fn create_run_tables(&self, run: &RunId) -> Result<(), StoreError> {
        let entries = run.table(ENTRIES);
        let lots = run.table(LOTS);
        let offers = run.table(OFFERS);
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{entries}" (
                entry_id INTEGER PRIMARY KEY,
                entry_url TEXT NOT NULL,
                entry_title TEXT NOT NULL
            )"#
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{lots}" (
                lot_id INTEGER PRIMARY KEY AUTOINCREMENT,
                lot_name TEXT NOT NULL,
                lot_url TEXT NOT NULL,
                entry_id INTEGER NOT NULL REFERENCES "{entries}" (entry_id),
                run_id TEXT NOT NULL REFERENCES runs (run_id)
            )"#
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{offers}" (
                offer_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id INTEGER NOT NULL REFERENCES "{entries}" (entry_id),
                seller TEXT,
                description TEXT NOT NULL,
                price TEXT,
                link TEXT,
                observed_at TEXT NOT NULL
            )"#
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
        let rows = sqlx::query("SELECT run_id FROM runs ORDER BY run_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<RunId, StoreError> {
                Ok(RunId::parse(&row.try_get::<String, _>("run_id")?)?)
            })
            .collect()
    }

    pub async fn latest_run(&self) -> Result<Option<RunId>, StoreError> {
        let row = sqlx::query("SELECT run_id FROM runs ORDER BY run_id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(RunId::parse(&row.try_get::<String, _>("run_id")?)?)),
            None => Ok(None),
        }
    }

    /// Inserts entries that are not in the run yet. Existing rows keep their url and title.
    pub async fn insert_entries(&self, run: &RunId, entries: &[Entry]) -> Result<usize, StoreError> {
        let sql = format!(
            r#"INSERT OR IGNORE INTO "{}" (entry_id, entry_url, entry_title) VALUES (?, ?, ?)"#,
            run.table(ENTRIES)
        );
        let mut inserted = 0u64;
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            inserted += sqlx::query(&sql)
                .bind(entry.id.0)
                .bind(&entry.url)
                .bind(&entry.title)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(inserted as usize)
    }

    /// Appends lots unconditionally; repeated calls store repeated rows.
    pub async fn insert_sub_entries(
        &self,
        run: &RunId,
        sub_entries: &[SubEntry],
    ) -> Result<usize, StoreError> {
        let sql = format!(
            r#"INSERT INTO "{}" (lot_name, lot_url, entry_id, run_id) VALUES (?, ?, ?, ?)"#,
            run.table(LOTS)
        );
        let mut tx = self.pool.begin().await?;
        for sub in sub_entries {
            sqlx::query(&sql)
                .bind(&sub.name)
                .bind(&sub.url)
                .bind(sub.parent_entry_id.0)
                .bind(run.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(sub_entries.len())
    }

    pub async fn get_sub_entries(&self, run: &RunId) -> Result<Vec<SubEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT lot_name, lot_url, entry_id FROM "{}" ORDER BY lot_id"#,
            run.table(LOTS)
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<SubEntry, StoreError> {
                Ok(SubEntry {
                    name: row.try_get("lot_name")?,
                    url: row.try_get("lot_url")?,
                    parent_entry_id: EntryId(row.try_get("entry_id")?),
                })
            })
            .collect()
    }

    pub async fn append_offers(&self, run: &RunId, offers: &[Offer]) -> Result<usize, StoreError> {
        let sql = format!(
            r#"INSERT INTO "{}" (entry_id, seller, description, price, link, observed_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
            run.table(OFFERS)
        );
        let mut tx = self.pool.begin().await?;
        for offer in offers {
            sqlx::query(&sql)
                .bind(offer.entry_id.0)
                .bind(&offer.seller)
                .bind(&offer.description)
                .bind(&offer.price)
                .bind(&offer.link)
                .bind(offer.observed_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(offers.len())
    }

    pub async fn get_offers(&self, run: &RunId) -> Result<Vec<Offer>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT entry_id, seller, description, price, link, observed_at
               FROM "{}" ORDER BY offer_id"#,
            run.table(OFFERS)
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<Offer, StoreError> {
                Ok(Offer {
                    entry_id: EntryId(row.try_get("entry_id")?),
                    seller: row.try_get("seller")?,
                    description: row.try_get("description")?,
                    price: row.try_get("price")?,
                    link: row.try_get("link")?,
                    observed_at: row.try_get("observed_at")?,
                })
            })
            .collect()
    }

    /// Entry ids and urls that drive the per-entry fetch, ordered by id.
    pub async fn get_entries(&self, run: &RunId) -> Result<Vec<(EntryId, String)>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT entry_id, entry_url FROM "{}" ORDER BY entry_id"#,
            run.table(ENTRIES)
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(EntryId, String), StoreError> {
                Ok((EntryId(row.try_get("entry_id")?), row.try_get("entry_url")?))
            })
            .collect()
    }

    /// Metric columns of the run's entry table as they exist in storage.
    pub async fn get_columns(&self, run: &RunId) -> Result<ColumnSet, StoreError> {
        let rows = sqlx::query(&format!(r#"PRAGMA table_info("{}")"#, run.table(ENTRIES)))
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Err(StoreError::UnknownRun(run.to_string()));
        }
        let mut columns = ColumnSet::new();
        for row in &rows {
            let name: String = row.try_get("name")?;
            if BASE_COLUMNS.iter().any(|base| base.eq_ignore_ascii_case(&name)) {
                continue;
            }
            match MetricCategory::parse(&name) {
                Ok(category) => {
                    columns.insert(category);
                }
                Err(err) => debug!(run_id = %run, column = %name, %err, "ignoring foreign column"),
            }
        }
        Ok(columns)
    }

    pub async fn add_column(&self, run: &RunId, category: &MetricCategory) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"ALTER TABLE "{}" ADD COLUMN {} INTEGER NOT NULL DEFAULT 0"#,
            run.table(ENTRIES),
            category.quoted()
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overwrites only the given metric columns of one entry row.
    pub async fn update_entry_metrics(
        &self,
        run: &RunId,
        id: EntryId,
        metrics: &MetricSet,
    ) -> Result<(), StoreError> {
        let table = run.table(ENTRIES);
        if metrics.is_empty() {
            let exists = sqlx::query(&format!(r#"SELECT 1 FROM "{table}" WHERE entry_id = ?"#))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            return if exists {
                Ok(())
            } else {
                Err(StoreError::UnknownEntry {
                    run: run.clone(),
                    id,
                })
            };
        }

        let assignments = metrics
            .categories()
            .map(|c| format!("{} = ?", c.quoted()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(r#"UPDATE "{table}" SET {assignments} WHERE entry_id = ?"#);
        let mut query = sqlx::query(&sql);
        for (_, value) in metrics.iter() {
            query = query.bind(value);
        }
        let affected = query.bind(id.0).execute(&self.pool).await?.rows_affected();
        if affected == 0 {
            return Err(StoreError::UnknownEntry {
                run: run.clone(),
                id,
            });
        }
        Ok(())
    }

    /// One entry row with every metric column of the run.
    pub async fn get_entry(&self, run: &RunId, id: EntryId) -> Result<Entry, StoreError> {
        let columns: Vec<MetricCategory> = self.get_columns(run).await?.iter().cloned().collect();
        let mut select = vec!["entry_id".to_string(), "entry_url".into(), "entry_title".into()];
        select.extend(columns.iter().map(MetricCategory::quoted));
        let sql = format!(
            r#"SELECT {} FROM "{}" WHERE entry_id = ?"#,
            select.join(", "),
            run.table(ENTRIES)
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::UnknownEntry {
                run: run.clone(),
                id,
            })?;

        let mut metrics = MetricSet::new();
        for (offset, category) in columns.iter().enumerate() {
            let value: i64 = row.try_get(BASE_COLUMNS.len() + offset)?;
            metrics.insert(category.clone(), value);
        }
        Ok(Entry {
            id: EntryId(row.try_get(0)?),
            url: row.try_get(1)?,
            title: row.try_get(2)?,
            metrics,
        })
    }
}

/// Owner of a run's [`ColumnSet`]: the only path that adds metric columns.
///
/// The column cache sits behind one async mutex, held across column additions
/// and the metric update that needs them.
#[derive(Debug)]
pub struct SchemaReconciler {
    run: RunId,
    columns: Mutex<ColumnSet>,
    added: Mutex<Vec<MetricCategory>>,
}

impl SchemaReconciler {
    pub async fn load(store: &RunStore, run: &RunId) -> Result<Self, StoreError> {
        let columns = store.get_columns(run).await?;
        Ok(Self {
            run: run.clone(),
            columns: Mutex::new(columns),
            added: Mutex::new(Vec::new()),
        })
    }

    pub fn run(&self) -> &RunId {
        &self.run
    }

    pub async fn columns(&self) -> ColumnSet {
        self.columns.lock().await.clone()
    }

    /// Every column this reconciler added, in order, whether or not the write that needed it succeeded.
    pub async fn added_columns(&self) -> Vec<MetricCategory> {
        self.added.lock().await.clone()
    }

    /// Adds a column for every category not yet known; returns the ones added.
    pub async fn ensure_columns(
        &self,
        store: &RunStore,
        required: &[MetricCategory],
    ) -> Result<Vec<MetricCategory>, StoreError> {
        let mut columns = self.columns.lock().await;
        self.ensure_locked(store, &mut columns, required).await
    }

    /// Reconciles the schema for `metrics` and writes them, as one exclusive step.
    pub async fn persist_metrics(
        &self,
        store: &RunStore,
        id: EntryId,
        metrics: &MetricSet,
    ) -> Result<Vec<MetricCategory>, StoreError> {
        let required: Vec<MetricCategory> = metrics.categories().cloned().collect();
        let mut columns = self.columns.lock().await;
        let added = self.ensure_locked(store, &mut columns, &required).await?;
        if let Err(err) = store.update_entry_metrics(&self.run, id, metrics).await {
            if !added.is_empty() {
                let names: Vec<&str> = added.iter().map(MetricCategory::as_str).collect();
                warn!(
                    run_id = %self.run,
                    entry_id = %id,
                    columns = ?names,
                    error_kind = err.kind(),
                    "metric update failed after adding columns; columns stay"
                );
            }
            return Err(err);
        }
        Ok(added)
    }

    async fn ensure_locked(
        &self,
        store: &RunStore,
        columns: &mut ColumnSet,
        required: &[MetricCategory],
    ) -> Result<Vec<MetricCategory>, StoreError> {
        let missing = columns.missing(required.iter());
        let mut added = Vec::with_capacity(missing.len());
        for category in missing {
            let started = Instant::now();
            if let Err(err) = store.add_column(&self.run, &category).await {
                let live = store.get_columns(&self.run).await?;
                if !live.contains(&category) {
                    return Err(err);
                }
                debug!(run_id = %self.run, column = %category, "column already present in storage");
                for existing in live.iter() {
                    columns.insert(existing.clone());
                }
                continue;
            }
            info!(
                run_id = %self.run,
                column = %category,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "added metric column"
            );
            columns.insert(category.clone());
            self.added.lock().await.push(category.clone());
            added.push(category);
        }
        Ok(added)
    }
}
