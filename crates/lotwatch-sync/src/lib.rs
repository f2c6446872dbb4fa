//! Snapshot ingestion pipeline: discover, persist catalog, fetch and reconcile per entry.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use lotwatch_adapters::{
    parse_base_url, CatalogSource, FileCatalogSource, HtmlMetricSource, HtmlOfferSource,
    HttpCatalogSource, MetricSource, OfferSource,
};
use lotwatch_core::{Entry, EntryId, RunId, SubEntry};
use lotwatch_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, RetryPolicy, RunStore, SchemaReconciler,
};
use rand::Rng;
use serde::Serialize;
use tokio::fs;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotwatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub catalog_url: String,
    pub base_origin: String,
    pub catalog_file: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub workers: usize,
    pub pacing_min: Duration,
    pub pacing_max: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_attempts: usize,
    pub collect_offers: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn env_path(key: &str, default: &str) -> Option<PathBuf> {
    let value = std::env::var(key).unwrap_or_else(|_| default.to_string());
    if value.trim().is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("LOTWATCH_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://lotwatch.db".to_string()),
            catalog_url: std::env::var("LOTWATCH_CATALOG_URL")
                .unwrap_or_else(|_| "https://funpay.com/en/".to_string()),
            base_origin: std::env::var("LOTWATCH_BASE_ORIGIN")
                .unwrap_or_else(|_| "https://funpay.com".to_string()),
            catalog_file: env_path("LOTWATCH_CATALOG_FILE", ""),
            artifacts_dir: env_path("LOTWATCH_ARTIFACTS_DIR", "./artifacts"),
            reports_dir: env_path("LOTWATCH_REPORTS_DIR", "./reports"),
            workers: env_number("LOTWATCH_WORKERS", 4usize),
            pacing_min: Duration::from_millis(env_number("LOTWATCH_PACING_MIN_MS", 1000u64)),
            pacing_max: Duration::from_millis(env_number("LOTWATCH_PACING_MAX_MS", 5000u64)),
            user_agent: std::env::var("LOTWATCH_USER_AGENT")
                .unwrap_or_else(|_| "lotwatch-bot/0.1".to_string()),
            http_timeout_secs: env_number("LOTWATCH_HTTP_TIMEOUT_SECS", 20u64),
            max_attempts: env_number("LOTWATCH_MAX_ATTEMPTS", 5usize),
            collect_offers: env_flag("LOTWATCH_COLLECT_OFFERS"),
            scheduler_enabled: env_flag("LOTWATCH_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("LOTWATCH_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
        }
    }
}

/// Randomized delay each worker takes after a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn next_delay(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub pacing: Pacing,
    pub reports_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            pacing: Pacing::default(),
            reports_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntryFailure {
    pub entry_id: EntryId,
    pub url: String,
    pub stage: &'static str,
    pub error_kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: RunId,
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub catalog_source: String,
    pub discovered: usize,
    pub inserted_entries: usize,
    pub inserted_sub_entries: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_by_cancel: usize,
    pub columns_added: Vec<String>,
    pub lots_attempted: usize,
    pub lots_succeeded: usize,
    pub lots_failed: usize,
    pub lots_skipped_by_cancel: usize,
    pub offers_appended: usize,
    pub cancelled: bool,
    pub failures: Vec<EntryFailure>,
}

/// Unit of work handed to the pool: an entry page, or a lot page when offers are collected.
#[derive(Debug, Clone)]
enum WorkItem {
    Entry { id: EntryId, url: String },
    Lot(SubEntry),
}

#[derive(Debug, Default)]
struct WorkerTally {
    attempted: usize,
    succeeded: usize,
    failures: Vec<EntryFailure>,
    lots_attempted: usize,
    lots_succeeded: usize,
    offers_appended: usize,
    lot_failures: Vec<EntryFailure>,
}

impl WorkerTally {
    fn merge(&mut self, other: WorkerTally) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failures.extend(other.failures);
        self.lots_attempted += other.lots_attempted;
        self.lots_succeeded += other.lots_succeeded;
        self.offers_appended += other.offers_appended;
        self.lot_failures.extend(other.lot_failures);
    }
}

/// Resolves once the flag is raised. A dropped sender never cancels.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Cancellation flag raised on Ctrl-C.
pub fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested; finishing in-flight entries");
            let _ = tx.send(true);
        }
        tx.closed().await;
    });
    rx
}

fn failure(
    run: &RunId,
    entry_id: EntryId,
    url: &str,
    stage: &'static str,
    error_kind: &'static str,
    message: String,
) -> EntryFailure {
    warn!(
        run_id = %run,
        entry_id = %entry_id,
        url = %url,
        stage,
        error_kind,
        error = %message,
        "skipping after failure"
    );
    EntryFailure {
        entry_id,
        url: url.to_string(),
        stage,
        error_kind,
        message,
    }
}

struct Worker {
    worker_id: usize,
    run: RunId,
    store: Arc<RunStore>,
    reconciler: Arc<SchemaReconciler>,
    metrics: Arc<dyn MetricSource>,
    offers: Option<Arc<dyn OfferSource>>,
    pacing: Pacing,
    queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    cancel: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) -> WorkerTally {
        let mut tally = WorkerTally::default();
        loop {
            if *self.cancel.borrow() {
                break;
            }
            let next = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(item) = next else {
                break;
            };
            if *self.cancel.borrow() {
                break;
            }

            let finished = match item {
                WorkItem::Entry { id, url } => self.process_entry(id, &url, &mut tally).await,
                WorkItem::Lot(lot) => self.process_lot(&lot, &mut tally).await,
            };
            if !finished {
                break;
            }

            let delay = self.pacing.next_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled(&mut self.cancel) => {}
                }
            }
        }
        tally
    }

    /// Returns false when the fetch was abandoned on cancellation.
    async fn process_entry(&mut self, entry_id: EntryId, url: &str, tally: &mut WorkerTally) -> bool {
        let fetched = tokio::select! {
            biased;
            res = self.metrics.fetch_metrics(url) => Some(res),
            _ = cancelled(&mut self.cancel) => None,
        };
        let Some(fetched) = fetched else {
            info!(entry_id = %entry_id, "fetch abandoned on cancellation");
            return false;
        };
        tally.attempted += 1;

        let metrics = match fetched {
            Ok(metrics) => metrics,
            Err(err) => {
                tally.failures.push(failure(
                    &self.run,
                    entry_id,
                    url,
                    "fetch",
                    err.kind(),
                    err.to_string(),
                ));
                return true;
            }
        };
        match self
            .reconciler
            .persist_metrics(&self.store, entry_id, &metrics)
            .await
        {
            Ok(added) => {
                tally.succeeded += 1;
                info!(
                    entry_id = %entry_id,
                    counters = metrics.len(),
                    columns_added = added.len(),
                    "entry updated"
                );
            }
            Err(err) => tally.failures.push(failure(
                &self.run,
                entry_id,
                url,
                "persist",
                err.kind(),
                err.to_string(),
            )),
        }
        true
    }

    async fn process_lot(&mut self, lot: &SubEntry, tally: &mut WorkerTally) -> bool {
        let Some(source) = self.offers.clone() else {
            return true;
        };
        let fetched = tokio::select! {
            biased;
            res = source.fetch_offers(lot) => Some(res),
            _ = cancelled(&mut self.cancel) => None,
        };
        let Some(fetched) = fetched else {
            info!(entry_id = %lot.parent_entry_id, url = %lot.url, "lot fetch abandoned on cancellation");
            return false;
        };
        tally.lots_attempted += 1;

        let offers = match fetched {
            Ok(offers) => offers,
            Err(err) => {
                tally.lot_failures.push(failure(
                    &self.run,
                    lot.parent_entry_id,
                    &lot.url,
                    "offers_fetch",
                    err.kind(),
                    err.to_string(),
                ));
                return true;
            }
        };
        match self.store.append_offers(&self.run, &offers).await {
            Ok(appended) => {
                tally.lots_succeeded += 1;
                tally.offers_appended += appended;
                info!(entry_id = %lot.parent_entry_id, lot = %lot.name, offers = appended, "lot offers appended");
            }
            Err(err) => tally.lot_failures.push(failure(
                &self.run,
                lot.parent_entry_id,
                &lot.url,
                "offers_persist",
                err.kind(),
                err.to_string(),
            )),
        }
        true
    }
}

/// Lots repeat across resumed discovery passes; each url is visited once per run.
fn distinct_lots(lots: Vec<SubEntry>) -> Vec<SubEntry> {
    let mut seen = BTreeSet::new();
    lots.into_iter()
        .filter(|lot| seen.insert(lot.url.clone()))
        .collect()
}

pub struct SyncPipeline {
    store: Arc<RunStore>,
    catalog: Box<dyn CatalogSource>,
    metrics: Arc<dyn MetricSource>,
    offers: Option<Arc<dyn OfferSource>>,
    options: PipelineOptions,
    running: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<RunStore>,
        catalog: Box<dyn CatalogSource>,
        metrics: Arc<dyn MetricSource>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            catalog,
            metrics,
            offers: None,
            options,
            running: Mutex::new(()),
        }
    }

    /// Adds the lot stage: after entry metrics, every lot page is fetched and its offers appended.
    pub fn with_offers(mut self, offers: Arc<dyn OfferSource>) -> Self {
        self.offers = Some(offers);
        self
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = RunStore::open(&config.database_url)
            .await
            .with_context(|| format!("opening run store {}", config.database_url))?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                ..RetryPolicy::default()
            },
        })?);
        let base = parse_base_url(&config.base_origin)?;

        let catalog: Box<dyn CatalogSource> = match &config.catalog_file {
            Some(path) => Box::new(FileCatalogSource::new(path, base.clone())),
            None => {
                let source = HttpCatalogSource::new(http.clone(), &config.catalog_url, base.clone());
                match &config.artifacts_dir {
                    Some(dir) => Box::new(source.with_artifacts(ArtifactStore::new(dir))),
                    None => Box::new(source),
                }
            }
        };

        let pipeline = Self::new(
            Arc::new(store),
            catalog,
            Arc::new(HtmlMetricSource::new(http.clone())),
            PipelineOptions {
                workers: config.workers,
                pacing: Pacing {
                    min: config.pacing_min,
                    max: config.pacing_max,
                },
                reports_dir: config.reports_dir.clone(),
            },
        );
        Ok(if config.collect_offers {
            pipeline.with_offers(Arc::new(HtmlOfferSource::new(http, base)))
        } else {
            pipeline
        })
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    /// Resolves once no run is in progress.
    pub async fn wait_idle(&self) {
        let _idle = self.running.lock().await;
    }

    /// Executes one run. Per-entry failures are counted; run-level failures are returned.
    pub async fn run_once(&self, cancel: watch::Receiver<bool>) -> Result<SyncRunSummary> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| anyhow!("a sync run is already in progress"))?;

        let started_at = Utc::now();
        let run = self
            .store
            .new_or_resume_run()
            .await
            .context("creating or resuming run")?;
        let span = info_span!("sync_run", run_id = %run.id);

        async {
            let catalog = self
                .catalog
                .discover(&run.id)
                .await
                .with_context(|| format!("discovering catalog from {}", self.catalog.describe()))?;
            let discovered = catalog.len();

            let (entries, sub_entries): (Vec<Entry>, Vec<Vec<SubEntry>>) = catalog
                .into_iter()
                .map(|c| (c.entry, c.sub_entries))
                .unzip();
            let sub_entries: Vec<SubEntry> = sub_entries.into_iter().flatten().collect();

            let inserted_entries = self
                .store
                .insert_entries(&run.id, &entries)
                .await
                .context("persisting catalog entries")?;
            let inserted_sub_entries = self
                .store
                .insert_sub_entries(&run.id, &sub_entries)
                .await
                .context("persisting catalog lots")?;
            info!(discovered, inserted_entries, inserted_sub_entries, "catalog persisted");

            let reconciler = Arc::new(
                SchemaReconciler::load(&self.store, &run.id)
                    .await
                    .context("loading run columns")?,
            );
            let work: Vec<WorkItem> = self
                .store
                .get_entries(&run.id)
                .await
                .context("listing run entries")?
                .into_iter()
                .map(|(id, url)| WorkItem::Entry { id, url })
                .collect();
            let total = work.len();

            let mut tally = self
                .fan_out(&run.id, reconciler.clone(), work, cancel.clone())
                .await?;

            let mut lots_total = 0;
            if self.offers.is_some() && !*cancel.borrow() {
                let lots = distinct_lots(
                    self.store
                        .get_sub_entries(&run.id)
                        .await
                        .context("listing run lots")?,
                );
                lots_total = lots.len();
                let lot_work = lots.into_iter().map(WorkItem::Lot).collect();
                let lot_tally = self
                    .fan_out(&run.id, reconciler.clone(), lot_work, cancel.clone())
                    .await?;
                tally.merge(lot_tally);
            }
            let was_cancelled = *cancel.borrow();

            let columns_added = reconciler
                .added_columns()
                .await
                .iter()
                .map(ToString::to_string)
                .collect();
            let failed = tally.failures.len();
            let lots_failed = tally.lot_failures.len();
            let mut failures = tally.failures;
            failures.extend(tally.lot_failures);

            let summary = SyncRunSummary {
                run_id: run.id.clone(),
                resumed: run.resumed,
                started_at,
                finished_at: Utc::now(),
                catalog_source: self.catalog.describe(),
                discovered,
                inserted_entries,
                inserted_sub_entries,
                attempted: tally.attempted,
                succeeded: tally.succeeded,
                failed,
                skipped_by_cancel: total.saturating_sub(tally.attempted),
                columns_added,
                lots_attempted: tally.lots_attempted,
                lots_succeeded: tally.lots_succeeded,
                lots_failed,
                lots_skipped_by_cancel: lots_total.saturating_sub(tally.lots_attempted),
                offers_appended: tally.offers_appended,
                cancelled: was_cancelled,
                failures,
            };
            info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped_by_cancel = summary.skipped_by_cancel,
                offers_appended = summary.offers_appended,
                "run finished"
            );

            if let Some(dir) = &self.options.reports_dir {
                let path = write_summary_report(dir, &summary).await?;
                info!(path = %path.display(), "run summary written");
            }
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn fan_out(
        &self,
        run: &RunId,
        reconciler: Arc<SchemaReconciler>,
        work: Vec<WorkItem>,
        cancel: watch::Receiver<bool>,
    ) -> Result<WorkerTally> {
        let workers = self.options.workers.max(1);
        let (tx, rx) = mpsc::channel::<WorkItem>(workers);
        let queue = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let worker = Worker {
                worker_id,
                run: run.clone(),
                store: self.store.clone(),
                reconciler: reconciler.clone(),
                metrics: self.metrics.clone(),
                offers: self.offers.clone(),
                pacing: self.options.pacing,
                queue: queue.clone(),
                cancel: cancel.clone(),
            };
            let span = info_span!("sync_worker", worker_id = worker.worker_id);
            handles.push(tokio::spawn(worker.run().instrument(span)));
        }
        drop(queue);

        let mut producer_cancel = cancel;
        for item in work {
            if *producer_cancel.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancelled(&mut producer_cancel) => break,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);

        let mut tally = WorkerTally::default();
        for handle in handles {
            tally.merge(handle.await.context("sync worker panicked")?);
        }
        Ok(tally)
    }
}

/// Writes `<reports_dir>/<run>/summary.json` through a temp file and rename.
pub async fn write_summary_report(reports_dir: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let dir = reports_dir.join(summary.run_id.as_str());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let path = dir.join("summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    fs::rename(&temp_path, &path)
        .await
        .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))?;
    Ok(path)
}

/// Cron scheduler that starts a run per tick. Overlapping ticks are skipped.
pub async fn build_scheduler(
    pipeline: Arc<SyncPipeline>,
    cron: &str,
    cancel: watch::Receiver<bool>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            if *cancel.borrow() {
                return;
            }
            match pipeline.run_once(cancel).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "scheduled run complete"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// The configured scheduler, or `None` when `LOTWATCH_SCHEDULER_ENABLED` is off.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
    cancel: watch::Receiver<bool>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline, &config.sync_cron, cancel)
        .await
        .map(Some)
}
