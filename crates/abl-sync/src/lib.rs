//! Reconciliation of the local approved ball list against the USBC catalog.

pub mod notify;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use abl_core::{Ball, BallFilter, Brand};
use abl_storage::{BallStore, SqliteConfig, SqliteStore, StoreError};
use abl_usbc::{BallSource, FetchError, UsbcClient, UsbcConfig};
use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use notify::{DiscordWebhookNotifier, LogNotifier, Notifier, NotifyError};

/// Worker count used when nothing else is configured. Kept below the brand count
/// so fetches overlap without hammering the upstream host.
pub const DEFAULT_CONCURRENCY: usize = 7;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub port: u16,
    pub database_url: String,
    pub usbc_base_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub concurrency: usize,
    pub discord_webhook_urls: Vec<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            environment: std::env::var("ABL_ENV").unwrap_or_else(|_| "local".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://abl.db".to_string()),
            usbc_base_url: std::env::var("USBC_BASE_URL")
                .unwrap_or_else(|_| abl_usbc::DEFAULT_BASE_URL.to_string()),
            http_timeout_secs: std::env::var("ABL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            user_agent: std::env::var("ABL_USER_AGENT")
                .unwrap_or_else(|_| "abl-bot/0.1".to_string()),
            concurrency: std::env::var("ABL_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CONCURRENCY)
                .max(1),
            discord_webhook_urls: std::env::var("DISCORD_WEBHOOK_URLS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            scheduler_enabled: std::env::var("ABL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("ABL_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
        }
    }

    pub fn is_local(&self) -> bool {
        self.environment == "local"
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Error)]
pub enum CategoryFailure {
    #[error("checking usbc list: {0}")]
    Fetch(#[from] FetchError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("cancelled before completion")]
    Cancelled,
    #[error("worker exited before reporting")]
    WorkerLost,
}

/// A single brand's failure within a run.
#[derive(Debug, Error)]
#[error("brand {brand}: {failure}")]
pub struct CategoryError {
    pub brand: Brand,
    #[source]
    pub failure: CategoryFailure,
}

/// What one brand's job produced.
#[derive(Debug)]
pub enum Outcome {
    Success(Vec<Ball>),
    Failure(CategoryError),
}

#[derive(Debug)]
struct JobResult {
    brand: Brand,
    outcome: Outcome,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("notifying: {0}")]
    Notify(#[from] NotifyError),
}

/// Aggregate of one reconciliation run. Category failures do not fail the run;
/// they are reported here for the caller to escalate if it wants to.
#[derive(Debug, Default)]
pub struct RunReport {
    pub run_id: Uuid,
    pub brands_checked: usize,
    pub new_balls: Vec<Ball>,
    pub errors: Vec<CategoryError>,
}

impl RunReport {
    pub fn is_partial_failure(&self) -> bool {
        !self.errors.is_empty()
    }

    /// All category errors joined into one message, or `None` when every brand succeeded.
    pub fn joined_errors(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            brands_checked: self.brands_checked,
            new_balls: self.new_balls.len(),
            failed_brands: self.errors.iter().map(|e| e.brand).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub brands_checked: usize,
    pub new_balls: usize,
    pub failed_brands: Vec<Brand>,
}

/// Balls from `fetched` with no stored ball of the same brand and name.
/// Repeats inside `fetched` are collapsed to their first occurrence.
pub fn new_balls(fetched: Vec<Ball>, stored: &[Ball]) -> Vec<Ball> {
    let mut fresh: Vec<Ball> = Vec::new();
    for ball in fetched {
        let known = stored.iter().any(|s| s.same_ball(&ball))
            || fresh.iter().any(|f| f.same_ball(&ball));
        if !known {
            fresh.push(ball);
        }
    }
    fresh
}

#[derive(Clone)]
struct Worker {
    source: Arc<dyn BallSource>,
    store: Arc<dyn BallStore>,
    jobs: Arc<Mutex<mpsc::Receiver<Brand>>>,
    results: mpsc::Sender<JobResult>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = self.jobs.lock().await.recv().await;
            let Some(brand) = next else {
                break;
            };
            let outcome = self
                .check_brand(brand)
                .instrument(info_span!("brand_job", %brand))
                .await;
            if self.results.send(JobResult { brand, outcome }).await.is_err() {
                break;
            }
        }
    }

    async fn check_brand(&self, brand: Brand) -> Outcome {
        let fail = |failure: CategoryFailure| Outcome::Failure(CategoryError { brand, failure });

        if self.cancel.is_cancelled() {
            return fail(CategoryFailure::Cancelled);
        }

        info!("listing balls from {brand}");
        let fetched = match self.source.list_balls(brand).await {
            Ok(balls) => balls,
            Err(err) => return fail(err.into()),
        };
        if fetched.is_empty() {
            return Outcome::Success(Vec::new());
        }

        if self.cancel.is_cancelled() {
            return fail(CategoryFailure::Cancelled);
        }
        let stored = match self.store.all_balls(&BallFilter::brand(brand)).await {
            Ok(balls) => balls,
            Err(err) => return fail(err.into()),
        };

        let fresh = new_balls(fetched, &stored);
        if fresh.is_empty() {
            return Outcome::Success(fresh);
        }

        if self.cancel.is_cancelled() {
            return fail(CategoryFailure::Cancelled);
        }
        match self.store.add_balls(&fresh).await {
            Ok(()) => {
                for ball in &fresh {
                    info!(name = %ball.name, "approved ball");
                }
                Outcome::Success(fresh)
            }
            Err(err) => fail(err.into()),
        }
    }
}

/// Fans one job per brand out to a fixed pool of workers, persists what is new,
/// and notifies once per run.
///
/// Cancellation is cooperative: workers check the token before each fetch and
/// store call, but an in-flight request is allowed to finish.
pub struct Reconciler {
    source: Arc<dyn BallSource>,
    store: Arc<dyn BallStore>,
    notifier: Arc<dyn Notifier>,
    concurrency: usize,
    brands: Vec<Brand>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn BallSource>,
        store: Arc<dyn BallStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            source,
            store,
            notifier,
            concurrency: DEFAULT_CONCURRENCY,
            brands: Brand::ALL.to_vec(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_brands(mut self, brands: Vec<Brand>) -> Self {
        self.brands = brands;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id, cancel)
            .instrument(info_span!("reconcile", %run_id))
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let num_jobs = self.brands.len();
        let capacity = num_jobs.max(1);

        let (job_tx, job_rx) = mpsc::channel::<Brand>(capacity);
        for brand in &self.brands {
            // Capacity equals the job count, so this never waits.
            if job_tx.try_send(*brand).is_err() {
                warn!(%brand, "job queue rejected brand");
            }
        }
        drop(job_tx);

        let (result_tx, mut result_rx) = mpsc::channel::<JobResult>(capacity);
        let worker = Worker {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            jobs: Arc::new(Mutex::new(job_rx)),
            results: result_tx,
            cancel: cancel.clone(),
        };
        for _ in 0..self.concurrency {
            tokio::spawn(worker.clone().run().in_current_span());
        }
        drop(worker);

        let mut report = RunReport {
            run_id,
            brands_checked: num_jobs,
            ..RunReport::default()
        };
        let mut reported = HashSet::with_capacity(num_jobs);
        for _ in 0..num_jobs {
            // `None` means every worker is gone; whatever is missing gets reported below.
            let Some(JobResult { brand, outcome }) = result_rx.recv().await else {
                break;
            };
            reported.insert(brand);
            match outcome {
                Outcome::Success(balls) => report.new_balls.extend(balls),
                Outcome::Failure(err) => report.errors.push(err),
            }
        }
        for brand in &self.brands {
            if !reported.contains(brand) {
                report.errors.push(CategoryError {
                    brand: *brand,
                    failure: CategoryFailure::WorkerLost,
                });
            }
        }

        if let Some(errors) = report.joined_errors() {
            error!(failed = report.errors.len(), errors = %errors, "error checking for approved balls");
        }
        info!("{} newly approved balls", report.new_balls.len());

        self.notifier.notify(&report.new_balls).await?;
        Ok(report)
    }
}

/// Everything a process needs to serve and reconcile.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<SqliteStore>,
    pub reconciler: Arc<Reconciler>,
}

impl Services {
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store = SqliteStore::connect(&SqliteConfig::new(&config.database_url))
            .await
            .with_context(|| format!("opening store {}", config.database_url))?;
        let store = Arc::new(store);

        let source = UsbcClient::new(UsbcConfig {
            base_url: config.usbc_base_url.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;

        let reconciler = Reconciler::new(Arc::new(source), store.clone(), notifier_for(config)?)
            .with_concurrency(config.concurrency);

        Ok(Self {
            store,
            reconciler: Arc::new(reconciler),
        })
    }
}

pub fn notifier_for(config: &AppConfig) -> Result<Arc<dyn Notifier>> {
    if config.discord_webhook_urls.is_empty() {
        if !config.is_local() {
            warn!("no discord webhooks configured; approvals will only be logged");
        }
        return Ok(Arc::new(LogNotifier));
    }
    let notifier = DiscordWebhookNotifier::new(
        config.discord_webhook_urls.clone(),
        Duration::from_secs(config.http_timeout_secs),
    )?;
    Ok(Arc::new(notifier))
}

/// Scheduled reconciliation, when enabled in config.
pub async fn maybe_build_scheduler(
    config: &AppConfig,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let reconciler = Arc::clone(&reconciler);
        let cancel = cancel.clone();
        Box::pin(async move {
            match reconciler.run(&cancel).await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    new_balls = report.new_balls.len(),
                    failed = report.errors.len(),
                    "scheduled reconciliation finished"
                ),
                Err(err) => error!(error = %err, "scheduled reconciliation failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
